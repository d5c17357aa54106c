//! Dispatch loop: queue head to worker, one unit at a time

use crate::command::{Command, Payload};
use crate::connection::DataConnection;
use crate::correlator::PendingReplies;
use crate::error::DevcomError;
use crate::events::{CommandEvent, EventSink};
use crate::queue::CommandQueue;
use crate::reply::Reply;
use crate::worker::{WorkSender, WorkUnit};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a submitted unit of work ended, from the dispatcher's side
enum UnitOutcome {
    Finished(Result<(), DevcomError>),
    /// The worker dropped the unit without reporting (aborted)
    Dropped,
    TimedOut(Duration),
}

/// Everything one dispatch loop needs
pub(crate) struct Dispatcher<T: Payload> {
    pub queue: Arc<CommandQueue<T>>,
    pub pending: Arc<PendingReplies<T>>,
    pub worker: WorkSender<T>,
    pub connection: Arc<dyn DataConnection<T>>,
    pub events: EventSink<T>,
    /// Send timeout in milliseconds, 0 = wait forever. Read before every unit.
    pub command_timeout_ms: Arc<AtomicU64>,
    /// Fallback wake-up while the queue is empty
    pub idle_poll: Duration,
}

/// Running dispatch loop. Dropping the handle stops the loop.
pub(crate) struct DispatcherHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Ask the loop to exit at its next suspension point
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop and wait for the loop to exit
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Dispatcher task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<T: Payload> Dispatcher<T> {
    /// Start the loop. Must be called from within a tokio runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(stop.clone()));
        DispatcherHandle {
            stop,
            task: Some(task),
        }
    }

    fn send_timeout(&self) -> Option<Duration> {
        match self.command_timeout_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    async fn run(self, stop: CancellationToken) {
        let name = self.connection.name();
        info!("Dispatcher started on {}", name);

        while !stop.is_cancelled() {
            let Some(command) = self.queue.pop() else {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = self.queue.wait(self.idle_poll) => {}
                }
                continue;
            };

            let (done, done_rx) = oneshot::channel();
            let unit = WorkUnit {
                command: command.clone(),
                connection: self.connection.clone(),
                done,
            };
            if self.worker.send(unit).is_err() {
                error!("Worker is gone, dispatcher on {} stopping", name);
                self.queue.push_front(command);
                break;
            }

            let send_timeout = self.send_timeout();
            let outcome = tokio::select! {
                _ = stop.cancelled() => break,
                outcome = wait_for_unit(done_rx, send_timeout) => outcome,
            };

            match outcome {
                UnitOutcome::Finished(Ok(())) => {}
                UnitOutcome::Finished(Err(e)) => {
                    error!("Queue error on command {}: {}", command.id(), e);
                }
                UnitOutcome::Dropped => {
                    warn!("Command {} dropped by the worker", command.id());
                }
                UnitOutcome::TimedOut(limit) => self.abandon(&command, limit),
            }
        }

        info!("Dispatcher on {} stopped, {} commands left queued", name, self.queue.len());
    }

    /// Give up on a command whose unit did not finish within the send timeout.
    ///
    /// If the worker has not started it yet, it is skipped later. A write
    /// that is already running is left to finish; only the worker writes.
    fn abandon(&self, command: &Command<T>, limit: Duration) {
        let started = !command.claim();
        let err = DevcomError::SendTimeout(limit);

        if command.complete(Reply::Failed(err.clone())) {
            self.pending.remove(command);
            self.events.emit(CommandEvent::Abandoned {
                id: command.id(),
                error: err,
            });
        }

        if started {
            warn!(
                "Command {} still writing after {:?}, moving on",
                command.id(),
                limit
            );
        } else {
            warn!(
                "Command {} not started within {:?}, abandoned",
                command.id(),
                limit
            );
        }
    }
}

async fn wait_for_unit(
    done: oneshot::Receiver<Result<(), DevcomError>>,
    limit: Option<Duration>,
) -> UnitOutcome {
    let Some(limit) = limit else {
        return match done.await {
            Ok(result) => UnitOutcome::Finished(result),
            Err(_) => UnitOutcome::Dropped,
        };
    };

    match tokio::time::timeout(limit, done).await {
        Ok(Ok(result)) => UnitOutcome::Finished(result),
        Ok(Err(_)) => UnitOutcome::Dropped,
        Err(_) => UnitOutcome::TimedOut(limit),
    }
}
