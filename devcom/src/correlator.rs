//! Reply correlation
//!
//! Written commands that expect an answer wait in [`PendingReplies`] in the
//! order they were registered. Each inbound message is offered to them
//! oldest-first and resolves at most one command.

use crate::command::{Command, Payload};
use crate::connection::DataFormat;
use crate::events::{CommandEvent, EventSink};
use crate::reply::Reply;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Reply-wait set, safe for concurrent insert/remove/scan
pub(crate) struct PendingReplies<T> {
    commands: Mutex<VecDeque<Arc<Command<T>>>>,
}

impl<T: Payload> PendingReplies<T> {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(VecDeque::new()),
        }
    }

    fn commands(&self) -> MutexGuard<'_, VecDeque<Arc<Command<T>>>> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `command` unless it already resolved.
    ///
    /// Resolved entries left behind by timeouts are pruned first, so the set
    /// never outgrows the commands still waiting. Returns `false` if the
    /// command was not added.
    pub fn insert(&self, command: Arc<Command<T>>) -> bool {
        let mut commands = self.commands();
        commands.retain(|c| !c.is_resolved());
        if command.is_resolved() {
            return false;
        }
        commands.push_back(command);
        true
    }

    /// Remove `command` if present
    pub fn remove(&self, command: &Command<T>) -> bool {
        let mut commands = self.commands();
        match commands.iter().position(|c| c.id() == command.id()) {
            Some(idx) => {
                commands.remove(idx);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, command: &Command<T>) -> bool {
        self.commands().iter().any(|c| c.id() == command.id())
    }

    /// Entries held, resolved or not
    #[cfg(test)]
    pub fn raw_len(&self) -> usize {
        self.commands().len()
    }

    /// Number of unresolved commands
    pub fn len(&self) -> usize {
        let mut commands = self.commands();
        commands.retain(|c| !c.is_resolved());
        commands.len()
    }

    /// Remove and resolve the oldest command that `msg` answers.
    ///
    /// Commands resolved elsewhere (abandoned by a timeout) are pruned on the
    /// way and never match.
    pub fn resolve_first(&self, msg: &T, format: &dyn DataFormat<T>) -> Option<Arc<Command<T>>> {
        let mut commands = self.commands();
        commands.retain(|c| !c.is_resolved());

        loop {
            let idx = commands.iter().position(|c| format.is_reply(c, msg))?;
            let command = commands.remove(idx)?;
            // A timeout may win between the prune and here; keep looking then
            if command.complete(Reply::Matched(msg.clone())) {
                return Some(command);
            }
        }
    }
}

/// Routes inbound messages to pending commands
pub(crate) struct Correlator<T> {
    pending: Arc<PendingReplies<T>>,
    format: Arc<dyn DataFormat<T>>,
    events: EventSink<T>,
}

impl<T: Payload> Correlator<T> {
    pub fn new(
        pending: Arc<PendingReplies<T>>,
        format: Arc<dyn DataFormat<T>>,
        events: EventSink<T>,
    ) -> Self {
        Self {
            pending,
            format,
            events,
        }
    }

    /// Handle one inbound message; returns the id of the command it resolved
    pub fn on_message(&self, msg: T) -> Option<u64> {
        match self.pending.resolve_first(&msg, self.format.as_ref()) {
            Some(command) => {
                debug!("Reply for command {}: {:?}", command.id(), msg);
                self.events.emit(CommandEvent::Matched {
                    id: command.id(),
                    reply: msg,
                });
                Some(command.id())
            }
            None => {
                trace!("Discarding unmatched message: {:?}", msg);
                None
            }
        }
    }
}
