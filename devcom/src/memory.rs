//! In-memory connection
//!
//! Records every written message and lets the owner inject inbound messages.
//! Writes can be made to fail or to block, which is how the controller's
//! timeout and shutdown paths are exercised without hardware.

use crate::command::{Command, Payload};
use crate::connection::{ConnectionEvent, DataConnection, DataFormat};
use crate::error::ConnectionError;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

/// Format under which every inbound message answers the oldest pending command
pub struct AnyReply;

impl<T> DataFormat<T> for AnyReply {
    fn is_reply(&self, _command: &Command<T>, _msg: &T) -> bool {
        true
    }
}

pub struct MemoryConnection<T> {
    name: String,
    open: AtomicBool,
    format: Arc<dyn DataFormat<T>>,
    events: broadcast::Sender<ConnectionEvent<T>>,
    written: Mutex<Vec<T>>,
    write_count: watch::Sender<usize>,
    fail_writes: AtomicBool,
    /// `true` while writes may complete
    gate: watch::Sender<bool>,
    active_writes: AtomicUsize,
    max_active_writes: AtomicUsize,
}

impl<T: Payload> MemoryConnection<T> {
    /// A closed connection using [`AnyReply`]
    pub fn new() -> Self {
        Self::with_format(AnyReply)
    }

    pub fn with_format(format: impl DataFormat<T> + 'static) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (write_count, _) = watch::channel(0);
        let (gate, _) = watch::channel(true);

        Self {
            name: "memory".into(),
            open: AtomicBool::new(false),
            format: Arc::new(format),
            events,
            written: Mutex::new(Vec::new()),
            write_count,
            fail_writes: AtomicBool::new(false),
            gate,
            active_writes: AtomicUsize::new(0),
            max_active_writes: AtomicUsize::new(0),
        }
    }

    /// Rename the connection (shows up in logs)
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark the connection open without publishing an event
    pub fn connected(self) -> Self {
        self.open.store(true, Ordering::SeqCst);
        self
    }

    /// Inject an inbound message
    pub fn deliver(&self, msg: T) {
        let _ = self.events.send(ConnectionEvent::Received(msg));
    }

    /// Publish a transport error
    pub fn raise_io_error(&self, err: impl Into<String>) {
        let _ = self.events.send(ConnectionEvent::IoError(err.into()));
    }

    /// Messages written so far, in write order
    pub fn written(&self) -> Vec<T> {
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait until at least `count` writes have completed
    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.write_count.subscribe();
        let _ = rx.wait_for(|written| *written >= count).await;
    }

    /// Make subsequent writes fail with `BrokenPipe`
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Block writes until [`MemoryConnection::release_writes`]
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Writes currently inside `write_data`
    pub fn active_writes(&self) -> usize {
        self.active_writes.load(Ordering::SeqCst)
    }

    /// Highest number of writes that were ever in progress at once
    pub fn max_active_writes(&self) -> usize {
        self.max_active_writes.load(Ordering::SeqCst)
    }
}

impl<T: Payload> Default for MemoryConnection<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Payload> DataConnection<T> for MemoryConnection<T> {
    async fn open(&self) -> Result<(), ConnectionError> {
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Opened);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write_data(&self, msg: &T) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not open", self.name),
            ));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            ));
        }

        let active = self.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_writes.fetch_max(active, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(msg.clone());
        self.active_writes.fetch_sub(1, Ordering::SeqCst);
        self.write_count.send_modify(|count| *count += 1);
        Ok(())
    }

    fn format(&self) -> Arc<dyn DataFormat<T>> {
        self.format.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent<T>> {
        self.events.subscribe()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
