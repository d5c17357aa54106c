//! Connection abstraction consumed by the controller
//!
//! A connection moves opaque messages of type `T` to and from a device.
//! Framing, byte transport and reconnection belong to the implementation;
//! the controller only writes messages and listens for events.

use crate::command::{Command, Payload};
use crate::error::ConnectionError;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Events published by a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent<T> {
    /// Connection opened
    Opened,
    /// Connection closed (locally or by the peer)
    Closed,
    /// A complete inbound message
    Received(T),
    /// Transport failure outside of a write call
    IoError(String),
}

/// Decides whether an inbound message answers a command
pub trait DataFormat<T>: Send + Sync {
    fn is_reply(&self, command: &Command<T>, msg: &T) -> bool;
}

impl<T, F> DataFormat<T> for F
where
    F: Fn(&Command<T>, &T) -> bool + Send + Sync,
{
    fn is_reply(&self, command: &Command<T>, msg: &T) -> bool {
        self(command, msg)
    }
}

/// A bidirectional message connection to a single device
#[async_trait]
pub trait DataConnection<T: Payload>: Send + Sync + 'static {
    /// Open the connection
    async fn open(&self) -> Result<(), ConnectionError>;

    /// Close the connection
    async fn close(&self) -> Result<(), ConnectionError>;

    fn is_open(&self) -> bool;

    /// Write one message
    async fn write_data(&self, msg: &T) -> io::Result<()>;

    /// Reply predicate used to correlate inbound messages
    fn format(&self) -> Arc<dyn DataFormat<T>>;

    /// Subscribe to connection events
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent<T>>;

    /// Human-readable name for logs
    fn name(&self) -> String {
        "connection".into()
    }
}

/// Handle for a registered listener. Dropping it also unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivering events to the listener
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Deliver every event of `connection` to `listener` until unsubscribed.
///
/// Must be called from within a tokio runtime.
pub fn listen<T, C, F>(connection: &C, mut listener: F) -> Subscription
where
    T: Payload,
    C: DataConnection<T> + ?Sized,
    F: FnMut(ConnectionEvent<T>) + Send + 'static,
{
    let mut rx = connection.subscribe();
    let name = connection.name();

    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => listener(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Listener on {} lagged, {} events dropped", name, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Subscription { task }
}

/// Register a listener for inbound messages
pub fn on_data_received<T, C, F>(connection: &C, mut listener: F) -> Subscription
where
    T: Payload,
    C: DataConnection<T> + ?Sized,
    F: FnMut(T) + Send + 'static,
{
    listen(connection, move |event| {
        if let ConnectionEvent::Received(msg) = event {
            listener(msg);
        }
    })
}

/// Register a listener for transport errors
pub fn on_io_error<T, C, F>(connection: &C, mut listener: F) -> Subscription
where
    T: Payload,
    C: DataConnection<T> + ?Sized,
    F: FnMut(String) + Send + 'static,
{
    listen(connection, move |event| {
        if let ConnectionEvent::IoError(err) = event {
            listener(err);
        }
    })
}

/// Register a listener for the connection being opened
pub fn on_connection_opened<T, C, F>(connection: &C, mut listener: F) -> Subscription
where
    T: Payload,
    C: DataConnection<T> + ?Sized,
    F: FnMut() + Send + 'static,
{
    listen(connection, move |event| {
        if let ConnectionEvent::Opened = event {
            listener();
        }
    })
}

/// Register a listener for the connection being closed
pub fn on_connection_closed<T, C, F>(connection: &C, mut listener: F) -> Subscription
where
    T: Payload,
    C: DataConnection<T> + ?Sized,
    F: FnMut() + Send + 'static,
{
    listen(connection, move |event| {
        if let ConnectionEvent::Closed = event {
            listener();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_closure_as_format() {
        let format = |cmd: &Command<&'static str>, msg: &&'static str| {
            cmd.payload().len() == msg.len()
        };
        let cmd = Command::new("PING");
        assert!(format.is_reply(&cmd, &"PONG"));
        assert!(!format.is_reply(&cmd, &"ACK"));
    }

    #[tokio::test]
    async fn test_on_data_received() {
        let conn = MemoryConnection::<String>::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = on_data_received(&conn, move |msg| {
            let _ = tx.send(msg);
        });

        conn.deliver("hello".to_string());

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("listener not called");
        assert_eq!(got.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let conn = MemoryConnection::<String>::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = on_data_received(&conn, move |msg| {
            let _ = tx.send(msg);
        });

        sub.unsubscribe();
        tokio::task::yield_now().await;
        conn.deliver("ignored".to_string());

        // Sender is dropped with the aborted task, so the channel closes empty
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel should close");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_open_close_listeners() {
        let conn = MemoryConnection::<String>::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let opened_tx = tx.clone();
        let _opened = on_connection_opened(&conn, move || {
            let _ = opened_tx.send("opened");
        });
        let _closed = on_connection_closed(&conn, move || {
            let _ = tx.send("closed");
        });

        conn.open().await.unwrap();
        conn.close().await.unwrap();

        // Listeners run on separate tasks, so their relative order is not fixed
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_unstable();
        assert_eq!(seen, ["closed", "opened"]);
    }
}
