//! FIFO command queue shared by callers and the dispatcher

use crate::command::{Command, Payload};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Unbounded multi-producer queue with a wake-up signal for its consumer
pub(crate) struct CommandQueue<T> {
    items: Mutex<VecDeque<Arc<Command<T>>>>,
    signal: Notify,
}

impl<T: Payload> CommandQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Arc<Command<T>>>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append to the tail and wake the consumer. Never blocks on I/O.
    pub fn push(&self, command: Arc<Command<T>>) {
        self.items().push_back(command);
        self.signal.notify_one();
    }

    /// Return a command to the head, keeping its place in line
    pub fn push_front(&self, command: Arc<Command<T>>) {
        self.items().push_front(command);
        self.signal.notify_one();
    }

    pub fn pop(&self) -> Option<Arc<Command<T>>> {
        self.items().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Wait for a push, or for `fallback` to elapse, whichever comes first
    pub async fn wait(&self, fallback: Duration) {
        let _ = tokio::time::timeout(fallback, self.signal.notified()).await;
    }
}
