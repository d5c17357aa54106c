//! Commands and their lifecycle handles

use crate::reply::{Reply, ReplyHandle};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(0);

/// Error type returned by cancellation handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Hook run by the worker when it skips a cancelled command
pub type CancelHandler = Box<dyn FnOnce(&str) -> Result<(), BoxError> + Send>;

/// Bounds every payload type must satisfy
pub trait Payload: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Payload for T {}

/// A queued request: payload, reply handle and lifecycle flags
pub struct Command<T> {
    id: u64,
    payload: T,
    reply_expected: bool,
    consumed: AtomicBool,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    on_cancel: Mutex<Option<CancelHandler>>,
    reply: ReplyHandle<T>,
}

impl<T: Payload> Command<T> {
    /// A command that waits for a correlated reply
    pub fn new(payload: T) -> Arc<Self> {
        CommandBuilder::new(payload).build()
    }

    /// A command that is complete once written
    pub fn without_reply(payload: T) -> Arc<Self> {
        CommandBuilder::new(payload).reply_expected(false).build()
    }

    pub fn builder(payload: T) -> CommandBuilder<T> {
        CommandBuilder::new(payload)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn is_reply_expected(&self) -> bool {
        self.reply_expected
    }

    /// Whether a worker has already taken this command
    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Request cancellation.
    ///
    /// Only observed when the worker picks the command up; a write that has
    /// already started is never interrupted.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.cancel_reason.lock() {
            slot.get_or_insert_with(|| reason.into());
        }
        self.cancel.cancel();
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that flips when [`Command::cancel`] is called
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reply(&self) -> &ReplyHandle<T> {
        &self.reply
    }

    pub fn is_resolved(&self) -> bool {
        self.reply.is_done()
    }

    /// Atomically take the command for execution or abandonment.
    ///
    /// Exactly one caller observes `true`.
    pub(crate) fn claim(&self) -> bool {
        !self.consumed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn complete(&self, reply: Reply<T>) -> bool {
        self.reply.complete(reply)
    }

    pub(crate) fn cancel_reason(&self) -> String {
        self.cancel_reason
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| "cancellation requested".into())
    }

    pub(crate) fn take_cancel_handler(&self) -> Option<CancelHandler> {
        self.on_cancel.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl<T: fmt::Debug> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("reply_expected", &self.reply_expected)
            .field("consumed", &self.consumed.load(Ordering::SeqCst))
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Builder for commands with non-default settings
pub struct CommandBuilder<T> {
    payload: T,
    reply_expected: bool,
    on_cancel: Option<CancelHandler>,
}

impl<T: Payload> CommandBuilder<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            reply_expected: true,
            on_cancel: None,
        }
    }

    pub fn reply_expected(mut self, expected: bool) -> Self {
        self.reply_expected = expected;
        self
    }

    /// Run `handler` with the cancellation reason if the command is skipped
    pub fn on_cancel<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&str) -> Result<(), BoxError> + Send + 'static,
    {
        self.on_cancel = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> Arc<Command<T>> {
        Arc::new(Command {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::SeqCst) + 1,
            payload: self.payload,
            reply_expected: self.reply_expected,
            consumed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            on_cancel: Mutex::new(self.on_cancel),
            reply: ReplyHandle::new(),
        })
    }
}
