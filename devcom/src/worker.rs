//! Single-slot write worker
//!
//! The worker is the only task that calls [`DataConnection::write_data`].
//! Units of work are executed strictly one after another, so writes never
//! interleave, even when the dispatcher stopped waiting for a unit.

use crate::command::{Command, Payload};
use crate::connection::DataConnection;
use crate::correlator::PendingReplies;
use crate::error::DevcomError;
use crate::events::{CommandEvent, EventSink};
use crate::reply::Reply;
use futures::FutureExt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One command to execute against one connection
pub(crate) struct WorkUnit<T: Payload> {
    pub command: Arc<Command<T>>,
    pub connection: Arc<dyn DataConnection<T>>,
    /// Fires when the unit finished, whatever the branch taken
    pub done: oneshot::Sender<Result<(), DevcomError>>,
}

pub(crate) type WorkSender<T> = mpsc::UnboundedSender<WorkUnit<T>>;

/// Handle to the running worker task
pub(crate) struct Worker<T: Payload> {
    tx: WorkSender<T>,
    task: JoinHandle<()>,
}

impl<T: Payload> Worker<T> {
    /// Start the worker task. Must be called from within a tokio runtime.
    pub fn spawn(pending: Arc<PendingReplies<T>>, events: EventSink<T>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkUnit<T>>();

        let task = tokio::spawn(async move {
            while let Some(unit) = rx.recv().await {
                let WorkUnit {
                    command,
                    connection,
                    done,
                } = unit;

                let work = execute(&command, connection.as_ref(), &pending, &events);
                let result = AssertUnwindSafe(work)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!("Write of command {} panicked", command.id());
                        let err = DevcomError::io_write(io::Error::new(
                            io::ErrorKind::Other,
                            "connection write panicked",
                        ));
                        fail(&command, err.clone(), &pending, &events);
                        Err(err)
                    });

                let _ = done.send(result);
            }
            info!("Worker stopped");
        });

        Self { tx, task }
    }

    /// Sender for submitting units of work
    pub fn sender(&self) -> WorkSender<T> {
        self.tx.clone()
    }

    /// Stop accepting work and wait for the current unit to finish.
    ///
    /// Senders held by dispatchers must be gone for the worker to drain.
    /// If it is still busy after `grace`, the task is aborted.
    pub async fn shutdown(self, grace: Duration) -> Result<(), DevcomError> {
        let Worker { tx, mut task } = self;
        drop(tx);

        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Worker still busy after {:?}, aborting", grace);
                task.abort();
                Err(DevcomError::Shutdown(grace))
            }
        }
    }
}

/// Execute one command: skip, cancel, or write
async fn execute<T: Payload>(
    command: &Arc<Command<T>>,
    connection: &dyn DataConnection<T>,
    pending: &PendingReplies<T>,
    events: &EventSink<T>,
) -> Result<(), DevcomError> {
    // Already taken by another unit or abandoned by the dispatcher
    if !command.claim() {
        debug!("Skipping consumed command {}", command.id());
        return Ok(());
    }

    if command.is_cancellation_requested() {
        cancel(command, events);
        return Ok(());
    }

    // Register before writing so a fast reply cannot slip past. A command
    // that timed out while queued is still written but never waits.
    if command.is_reply_expected() && !pending.insert(command.clone()) {
        debug!("Command {} resolved before its write", command.id());
    }

    match connection.write_data(command.payload()).await {
        Ok(()) => {
            debug!("Wrote command {}: {:?}", command.id(), command.payload());
            events.emit(CommandEvent::Written { id: command.id() });
            if !command.is_reply_expected() {
                command.complete(Reply::Sent);
            }
            Ok(())
        }
        Err(e) => {
            error!("Cannot send command {} ({:?}): {}", command.id(), command.payload(), e);
            let err = DevcomError::io_write(e);
            fail(command, err.clone(), pending, events);
            Err(err)
        }
    }
}

fn fail<T: Payload>(
    command: &Command<T>,
    err: DevcomError,
    pending: &PendingReplies<T>,
    events: &EventSink<T>,
) {
    pending.remove(command);
    if command.complete(Reply::Failed(err.clone())) {
        events.emit(CommandEvent::Failed {
            id: command.id(),
            error: err,
        });
    }
}

fn cancel<T: Payload>(command: &Command<T>, events: &EventSink<T>) {
    let reason = command.cancel_reason();
    info!("Command {} cancelled: {}", command.id(), reason);

    if command.complete(Reply::Cancelled(reason.clone())) {
        events.emit(CommandEvent::Cancelled {
            id: command.id(),
            reason: reason.clone(),
        });
    }

    if let Some(handler) = command.take_cancel_handler() {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&reason)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("cancellation handler panicked".to_string()),
        };
        if let Some(error) = failure {
            error!("Cancellation handler of command {} failed: {}", command.id(), error);
            events.emit(CommandEvent::CancelHandlerFailed {
                id: command.id(),
                error,
            });
        }
    }
}
