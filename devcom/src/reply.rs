//! Single-assignment reply handles
//!
//! Every command owns one [`ReplyHandle`]. The first outcome written wins;
//! later completions are ignored, which is what lets the worker, the
//! correlator and the timeout paths race without double resolution.

use crate::error::DevcomError;
use std::time::Duration;
use tokio::sync::watch;

/// Final outcome of a command
#[derive(Debug, Clone)]
pub enum Reply<T> {
    /// An inbound message matched the command
    Matched(T),
    /// The command expected no reply and was written
    Sent,
    /// Write failure or abandonment by a timeout
    Failed(DevcomError),
    /// Cancellation was requested before the write
    Cancelled(String),
}

impl<T> Reply<T> {
    /// True for `Matched` and `Sent`
    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Matched(_) | Reply::Sent)
    }

    /// The matched message, if any
    pub fn message(&self) -> Option<&T> {
        match self {
            Reply::Matched(msg) => Some(msg),
            _ => None,
        }
    }

    /// Convert into a `Result`, `Ok(None)` meaning "sent, no reply expected"
    pub fn into_result(self) -> Result<Option<T>, DevcomError> {
        match self {
            Reply::Matched(msg) => Ok(Some(msg)),
            Reply::Sent => Ok(None),
            Reply::Failed(err) => Err(err),
            Reply::Cancelled(reason) => Err(DevcomError::Cancelled(reason)),
        }
    }
}

/// Write-once slot that any number of tasks can await
#[derive(Debug)]
pub struct ReplyHandle<T> {
    slot: watch::Sender<Option<Reply<T>>>,
}

impl<T: Clone> ReplyHandle<T> {
    pub(crate) fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Store the outcome unless one is already present.
    ///
    /// Returns `true` if this call resolved the handle.
    pub(crate) fn complete(&self, reply: Reply<T>) -> bool {
        let mut reply = Some(reply);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = reply.take();
            true
        })
    }

    /// Whether an outcome has been stored
    pub fn is_done(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Non-blocking peek at the outcome
    pub fn try_get(&self) -> Option<Reply<T>> {
        self.slot.borrow().clone()
    }

    /// Wait for the outcome without a deadline
    pub async fn get(&self) -> Reply<T> {
        let mut rx = self.slot.subscribe();
        if let Ok(reply) = rx.wait_for(Option::is_some).await {
            if let Some(reply) = reply.clone() {
                return reply;
            }
        }
        // The sender lives in `self`, so the slot only closes with it
        Reply::Cancelled("reply slot closed".to_string())
    }

    /// Wait for the outcome for at most `deadline`.
    ///
    /// On expiry the handle is resolved with `ReplyTimeout`, so a reply that
    /// arrives later is no longer correlated to this command. If another
    /// outcome won the race, that outcome is returned instead.
    pub async fn get_timeout(&self, deadline: Duration) -> Reply<T> {
        match tokio::time::timeout(deadline, self.get()).await {
            Ok(reply) => reply,
            Err(_) => {
                let err = DevcomError::ReplyTimeout(deadline);
                if self.complete(Reply::Failed(err.clone())) {
                    Reply::Failed(err)
                } else {
                    self.try_get().unwrap_or(Reply::Failed(err))
                }
            }
        }
    }
}
