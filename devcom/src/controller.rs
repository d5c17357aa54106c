//! Device controller
//!
//! Binds one connection at a time and serializes every command sent through
//! it. Many tasks may send concurrently; each awaits its own reply.
//!
//! ```text
//! caller ─► CommandQueue ─► Dispatcher ─unit─► Worker ─write─► connection
//!                                                │                │
//!                                         PendingReplies ◄─ Correlator ◄─ Received
//! ```

use crate::command::{Command, Payload};
use crate::connection::{self, DataConnection, Subscription};
use crate::correlator::{Correlator, PendingReplies};
use crate::defaults;
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::DevcomError;
use crate::events::{CommandEvent, EventSink};
use crate::queue::CommandQueue;
use crate::reply::Reply;
use crate::worker::Worker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long the dispatcher waits for a write to finish (zero = no limit)
    pub command_timeout: Duration,
    /// Reply deadline of [`Controller::send`]
    pub reply_timeout: Duration,
    /// How long [`Controller::close`] waits for the worker
    pub shutdown_grace: Duration,
    /// Fallback wake-up of the idle dispatcher
    pub idle_poll: Duration,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::ZERO,
            reply_timeout: Duration::from_millis(defaults::REPLY_TIMEOUT_MS),
            shutdown_grace: Duration::from_millis(defaults::SHUTDOWN_GRACE_MS),
            idle_poll: Duration::from_millis(defaults::IDLE_POLL_MS),
            event_capacity: defaults::EVENT_CAPACITY,
        }
    }
}

struct Binding {
    connection: String,
    dispatcher: DispatcherHandle,
    inbound: Subscription,
}

struct ControllerState<T: Payload> {
    binding: Option<Binding>,
    worker: Option<Worker<T>>,
}

/// Serializes commands to a single connection and correlates replies
pub struct Controller<T: Payload> {
    config: ControllerConfig,
    command_timeout_ms: Arc<AtomicU64>,
    queue: Arc<CommandQueue<T>>,
    pending: Arc<PendingReplies<T>>,
    events: EventSink<T>,
    state: Mutex<ControllerState<T>>,
}

impl<T: Payload> Controller<T> {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let millis = u64::try_from(config.command_timeout.as_millis()).unwrap_or(u64::MAX);
        let command_timeout_ms = Arc::new(AtomicU64::new(millis));
        let events = EventSink::new(config.event_capacity);

        Self {
            config,
            command_timeout_ms,
            queue: Arc::new(CommandQueue::new()),
            pending: Arc::new(PendingReplies::new()),
            events,
            state: Mutex::new(ControllerState {
                binding: None,
                worker: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ControllerState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the send timeout in milliseconds (0 = no timeout).
    ///
    /// Takes effect from the next dispatched command.
    pub fn set_command_timeout(&self, milliseconds: u64) -> &Self {
        self.command_timeout_ms.store(milliseconds, Ordering::SeqCst);
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Bind to `connection` and start dispatching.
    ///
    /// Replaces a previous binding: its dispatcher is stopped and its
    /// inbound listener removed. Commands already handed to the worker are
    /// not migrated; commands still queued go to the new connection.
    /// Must be called from within a tokio runtime.
    pub fn init(&self, connection: Arc<dyn DataConnection<T>>) {
        let mut state = self.state();

        if let Some(old) = state.binding.take() {
            info!("Rebinding controller from {} to {}", old.connection, connection.name());
            old.dispatcher.stop();
            old.inbound.unsubscribe();
        }

        let worker = state
            .worker
            .get_or_insert_with(|| Worker::spawn(self.pending.clone(), self.events.clone()));
        let worker_tx = worker.sender();

        let correlator = Correlator::new(
            self.pending.clone(),
            connection.format(),
            self.events.clone(),
        );
        let inbound = connection::on_data_received(connection.as_ref(), move |msg| {
            correlator.on_message(msg);
        });

        let dispatcher = Dispatcher {
            queue: self.queue.clone(),
            pending: self.pending.clone(),
            worker: worker_tx,
            connection: connection.clone(),
            events: self.events.clone(),
            command_timeout_ms: self.command_timeout_ms.clone(),
            idle_poll: self.config.idle_poll,
        }
        .spawn();

        info!("Controller bound to {}", connection.name());
        state.binding = Some(Binding {
            connection: connection.name(),
            dispatcher,
            inbound,
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.state().binding.is_some()
    }

    /// Stop dispatching and shut the worker down.
    ///
    /// Returns [`DevcomError::Shutdown`] if the worker is still busy after the
    /// grace period; the worker is released either way. Queued commands stay
    /// queued until the next [`Controller::init`].
    pub async fn close(&self) -> Result<(), DevcomError> {
        let (binding, worker) = {
            let mut state = self.state();
            (state.binding.take(), state.worker.take())
        };

        if let Some(binding) = binding {
            binding.inbound.unsubscribe();
            binding.dispatcher.shutdown().await;
            info!("Controller unbound from {}", binding.connection);
        }

        match worker {
            Some(worker) => worker.shutdown(self.config.shutdown_grace).await,
            None => Ok(()),
        }
    }

    fn dispatch(&self, command: Arc<Command<T>>) -> Result<(), DevcomError> {
        let state = self.state();
        if state.binding.is_none() {
            return Err(DevcomError::NotInitialized);
        }
        debug!("Queueing command {}: {:?}", command.id(), command.payload());
        self.queue.push(command);
        Ok(())
    }

    /// Queue `command` and return it without waiting
    pub fn send_command_async(
        &self,
        command: Arc<Command<T>>,
    ) -> Result<Arc<Command<T>>, DevcomError> {
        self.dispatch(command.clone())?;
        Ok(command)
    }

    /// Queue `command` and wait for its outcome.
    ///
    /// There is no deadline here; apply one to the future, or use
    /// [`ReplyHandle::get_timeout`](crate::ReplyHandle::get_timeout) on an
    /// async command.
    pub async fn send_command(
        &self,
        command: Arc<Command<T>>,
    ) -> Result<Arc<Command<T>>, DevcomError> {
        self.dispatch(command.clone())?;
        match command.reply().get().await.into_result() {
            Ok(_) => Ok(command),
            Err(e) => {
                info!("Reply for command {} cannot be received: {}", command.id(), e);
                Err(e)
            }
        }
    }

    /// Wrap `payload` in a reply-expecting command and queue it
    pub fn send_payload_async(&self, payload: T) -> Result<Arc<Command<T>>, DevcomError> {
        self.send_command_async(Command::new(payload))
    }

    /// Send `payload` and wait for its reply with the configured deadline
    pub async fn send(&self, payload: T) -> Result<T, DevcomError> {
        let deadline = self.config.reply_timeout;
        self.send_with_timeout(payload, deadline).await
    }

    /// Send `payload` and wait at most `deadline` for its reply.
    ///
    /// On expiry the command is abandoned: it leaves the reply-wait set and
    /// a late reply is not matched to it.
    pub async fn send_with_timeout(
        &self,
        payload: T,
        deadline: Duration,
    ) -> Result<T, DevcomError> {
        let command = self.send_payload_async(payload)?;
        let reply = command.reply().get_timeout(deadline).await;
        if !matches!(reply, Reply::Matched(_)) {
            self.pending.remove(&command);
        }

        reply_message(command.id(), reply)
    }

    /// Send `payload` without expecting a reply.
    ///
    /// Write failures are logged and published as events.
    pub fn send_data(&self, payload: T) -> Result<(), DevcomError> {
        let command = Command::without_reply(payload);
        self.dispatch(command)
    }

    /// Subscribe to command outcome events
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent<T>> {
        self.events.subscribe()
    }

    /// Commands queued but not yet handed to the worker
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Commands written and waiting for a reply
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// The matched message of a reply-expecting command
fn reply_message<T>(id: u64, reply: Reply<T>) -> Result<T, DevcomError> {
    match reply.into_result() {
        Ok(Some(msg)) => Ok(msg),
        Ok(None) => Err(DevcomError::Cancelled(format!(
            "command {} completed without a reply",
            id
        ))),
        Err(err) => {
            info!("Reply for command {} cannot be received: {}", id, err);
            Err(err)
        }
    }
}

impl<T: Payload> Default for Controller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> Drop for Controller<T> {
    fn drop(&mut self) {
        let state = self.state();
        if state.binding.is_some() {
            warn!("Controller dropped without close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DataFormat;
    use crate::memory::MemoryConnection;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    /// "PONG<n>" answers "PING<n>"; a bare "PONG" answers "PING1" only
    fn pong_format() -> impl DataFormat<String> {
        |cmd: &Command<String>, msg: &String| {
            let target = match msg.as_str() {
                "PONG" => "PING1".to_string(),
                other => other.replacen("PONG", "PING", 1),
            };
            *cmd.payload() == target
        }
    }

    fn setup() -> (Controller<String>, Arc<MemoryConnection<String>>) {
        let controller = Controller::new();
        let conn = Arc::new(MemoryConnection::with_format(pong_format()).connected());
        controller.init(conn.clone());
        (controller, conn)
    }

    #[test]
    fn test_huge_command_timeout_saturates() {
        let controller = Controller::<String>::with_config(ControllerConfig {
            command_timeout: Duration::MAX,
            ..Default::default()
        });
        assert_eq!(controller.command_timeout(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_reply_without_message_is_an_error() {
        assert_eq!(reply_message(1, Reply::Matched("PONG".to_string())).unwrap(), "PONG");
        assert!(matches!(
            reply_message::<String>(2, Reply::Sent),
            Err(DevcomError::Cancelled(_))
        ));
        assert!(matches!(
            reply_message::<String>(3, Reply::Cancelled("stop".into())),
            Err(DevcomError::Cancelled(reason)) if reason == "stop"
        ));
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let controller = Controller::<String>::new();
        assert!(!controller.is_initialized());

        let err = controller.send_data("X".into()).unwrap_err();
        assert!(matches!(err, DevcomError::NotInitialized));
        assert!(matches!(
            controller.send("X".into()).await,
            Err(DevcomError::NotInitialized)
        ));
        assert_eq!(controller.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_ping_pong_correlation() {
        let (controller, conn) = setup();

        let ping1 = controller.send_payload_async("PING1".into()).unwrap();
        let ping2 = controller.send_payload_async("PING2".into()).unwrap();
        conn.wait_for_writes(2).await;
        assert_eq!(conn.written(), vec!["PING1".to_string(), "PING2".to_string()]);

        conn.deliver("PONG".into());

        let reply = ping1.reply().get().await;
        assert_eq!(reply.message().map(String::as_str), Some("PONG"));
        assert!(!ping2.is_resolved());
        assert_eq!(controller.pending_len(), 1);

        controller.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_their_own_reply() {
        let (controller, conn) = setup();
        let controller = Arc::new(controller);

        let mut callers = Vec::new();
        for i in 1..=5 {
            let controller = controller.clone();
            callers.push(tokio::spawn(async move {
                controller
                    .send_with_timeout(format!("PING{}", i), Duration::from_secs(5))
                    .await
            }));
        }

        conn.wait_for_writes(5).await;
        for i in (1..=5).rev() {
            conn.deliver(format!("PONG{}", i));
        }

        for (i, caller) in callers.into_iter().enumerate() {
            let reply = caller.await.unwrap().unwrap();
            assert_eq!(reply, format!("PONG{}", i + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_after_reply_deadline() {
        let (controller, conn) = setup();
        let started = Instant::now();

        let result = controller.send("X".into()).await;

        assert!(matches!(result, Err(DevcomError::ReplyTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(conn.written(), vec!["X".to_string()]);
        // The abandoned command no longer waits for a reply
        assert_eq!(controller.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_sends_leave_no_wait_entries() {
        let (controller, conn) = setup();

        for i in 0..200 {
            let result = controller
                .send_with_timeout(format!("SILENT{}", i), Duration::from_millis(5))
                .await;
            assert!(matches!(result, Err(DevcomError::ReplyTimeout(_))));
        }

        // Let the worker catch up with writes still queued at their deadline
        conn.wait_for_writes(200).await;
        assert_eq!(controller.pending.raw_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_expired_in_queue_never_waits() {
        let (controller, conn) = setup();
        conn.hold_writes();

        controller.send_data("BLOCKER".into()).unwrap();
        let result = controller
            .send_with_timeout("LATE".into(), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(DevcomError::ReplyTimeout(_))));

        conn.release_writes();
        conn.wait_for_writes(2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.pending.raw_len(), 0);
    }

    #[tokio::test]
    async fn test_send_command_blocking() {
        let (controller, conn) = setup();
        let controller = Arc::new(controller);
        let cmd = Command::new("PING7".to_string());

        let caller = {
            let controller = controller.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { controller.send_command(cmd).await })
        };

        conn.wait_for_writes(1).await;
        conn.deliver("PONG7".into());

        let done = caller.await.unwrap().unwrap();
        assert_eq!(done.id(), cmd.id());
        assert_eq!(
            done.reply().try_get().and_then(|r| r.message().cloned()).as_deref(),
            Some("PONG7")
        );
    }

    #[tokio::test]
    async fn test_cancelled_command_never_written() {
        let (controller, conn) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let cmd = {
            let calls = calls.clone();
            Command::builder("PING1".to_string())
                .on_cancel(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build()
        };
        cmd.cancel("not needed");

        let result = controller.send_command(cmd.clone()).await;

        assert!(matches!(result, Err(DevcomError::Cancelled(_))));
        assert!(conn.written().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_data_is_fire_and_forget() {
        let (controller, conn) = setup();
        let mut events = controller.subscribe();

        controller.send_data("DATA".into()).unwrap();
        conn.wait_for_writes(1).await;

        assert_eq!(controller.pending_len(), 0);
        let event = events.recv().await.unwrap();
        assert!(matches!(event, CommandEvent::Written { .. }));
    }

    #[tokio::test]
    async fn test_write_failure_reaches_caller_and_events() {
        let (controller, conn) = setup();
        conn.fail_writes(true);
        let mut events = controller.subscribe();

        let result = controller.send_command(Command::new("PING1".to_string())).await;

        assert!(matches!(result, Err(DevcomError::IoWrite(_))));
        assert!(matches!(
            events.recv().await.unwrap(),
            CommandEvent::Failed { .. }
        ));

        // The engine keeps going
        conn.fail_writes(false);
        controller.send_data("AFTER".into()).unwrap();
        conn.wait_for_writes(1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_completes_async_reply() {
        let (controller, conn) = setup();
        controller.set_command_timeout(100);
        assert_eq!(controller.command_timeout(), Duration::from_millis(100));
        conn.hold_writes();

        let first = controller.send_payload_async("PING1".into()).unwrap();
        let second = controller.send_payload_async("PING2".into()).unwrap();

        assert!(matches!(
            second.reply().get().await,
            Reply::Failed(DevcomError::SendTimeout(_))
        ));
        assert!(matches!(
            first.reply().try_get(),
            Some(Reply::Failed(DevcomError::SendTimeout(_)))
        ));
        assert_eq!(conn.max_active_writes(), 1);
        conn.release_writes();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_stuck_worker() {
        let (controller, conn) = setup();
        conn.hold_writes();
        controller.send_data("STUCK".into()).unwrap();
        while conn.active_writes() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let started = Instant::now();
        let result = controller.close().await;

        assert!(matches!(result, Err(DevcomError::Shutdown(_))));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(!controller.is_initialized());
        assert!(matches!(
            controller.send_data("X".into()),
            Err(DevcomError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_close_when_idle() {
        let (controller, _conn) = setup();
        controller.close().await.unwrap();
        assert!(!controller.is_initialized());
        // Closing twice is harmless
        controller.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebind_moves_queued_commands() {
        let (controller, old) = setup();
        old.hold_writes();

        controller.send_data("FIRST".into()).unwrap();
        while old.active_writes() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        controller.send_data("SECOND".into()).unwrap();

        let new = Arc::new(MemoryConnection::with_format(pong_format()).named("new").connected());
        controller.init(new.clone());

        // FIRST was in flight on the old binding; SECOND was still queued
        old.release_writes();
        new.wait_for_writes(1).await;
        assert_eq!(old.written(), vec!["FIRST".to_string()]);
        assert_eq!(new.written(), vec!["SECOND".to_string()]);

        // Inbound messages now come from the new connection only
        let ping = controller.send_payload_async("PING3".into()).unwrap();
        new.wait_for_writes(2).await;
        old.deliver("PONG3".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ping.is_resolved());

        new.deliver("PONG3".into());
        assert_eq!(
            ping.reply().get().await.message().map(String::as_str),
            Some("PONG3")
        );
    }
}
