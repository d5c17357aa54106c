//! Side-channel notifications about command outcomes

use crate::command::Payload;
use crate::error::DevcomError;
use tokio::sync::broadcast;

/// Something that happened to a command
#[derive(Debug, Clone)]
pub enum CommandEvent<T> {
    /// The payload reached the connection
    Written { id: u64 },
    /// An inbound message resolved the command
    Matched { id: u64, reply: T },
    /// The write failed
    Failed { id: u64, error: DevcomError },
    /// Skipped because cancellation was requested
    Cancelled { id: u64, reason: String },
    /// The cancellation handler returned an error
    CancelHandlerFailed { id: u64, error: String },
    /// Given up on by the dispatcher's send timeout
    Abandoned { id: u64, error: DevcomError },
}

impl<T> CommandEvent<T> {
    pub fn command_id(&self) -> u64 {
        match self {
            CommandEvent::Written { id }
            | CommandEvent::Matched { id, .. }
            | CommandEvent::Failed { id, .. }
            | CommandEvent::Cancelled { id, .. }
            | CommandEvent::CancelHandlerFailed { id, .. }
            | CommandEvent::Abandoned { id, .. } => *id,
        }
    }
}

/// Cloneable publisher; emitting never blocks and never fails
#[derive(Debug, Clone)]
pub(crate) struct EventSink<T> {
    tx: broadcast::Sender<CommandEvent<T>>,
}

impl<T: Payload> EventSink<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: CommandEvent<T>) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent<T>> {
        self.tx.subscribe()
    }
}
