//! Serialization of asynchronous hardware operations.
//!
//! The underlying link tolerates only one outstanding operation per
//! peripheral, so every read/write/subscribe/discover goes through a
//! [`CommandQueue`]: strictly FIFO, at most one command in flight. Completion
//! is reported back by whoever routes the hardware callbacks (the transport)
//! via [`CommandQueue::completed_command`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::Error;
use crate::signal::lock;

/// Tag describing what kind of hardware operation a command performs.
/// Completion callbacks are matched against this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ReadCharacteristic,
    WriteCharacteristic,
    WriteDescriptor,
    DiscoverServices,
}

type CommandAction = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// A queued unit of hardware work.
pub struct Command {
    kind: CommandKind,
    action: CommandAction,
}

impl Command {
    pub fn new<F>(kind: CommandKind, action: F) -> Self
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        Self {
            kind,
            action: Box::new(action),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }
}

struct QueueState {
    pending: VecDeque<Command>,
    in_flight: Option<CommandKind>,
    started: u64,
    completed: u64,
}

/// FIFO queue guaranteeing at most one in-flight hardware operation.
#[derive(Clone)]
pub struct CommandQueue {
    state: Arc<Mutex<QueueState>>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: None,
                started: 0,
                completed: 0,
            })),
        }
    }

    /// Append a command; starts it immediately if nothing is in flight.
    pub fn enqueue(&self, command: Command) {
        let start_now = {
            let mut state = lock(&self.state);
            state.pending.push_back(command);
            state.in_flight.is_none()
        };
        if start_now {
            self.start_next();
        }
    }

    /// Report that the in-flight operation finished. A kind mismatch is
    /// diagnostic only; the queue advances either way.
    pub fn completed_command(&self, kind: CommandKind) {
        {
            let mut state = lock(&self.state);
            match state.in_flight.take() {
                Some(expected) if expected != kind => {
                    warn!(?expected, completed = ?kind, "command completion kind mismatch");
                }
                Some(_) => {}
                None => {
                    debug!(completed = ?kind, "completion with no command in flight");
                    return;
                }
            }
            state.completed += 1;
        }
        self.start_next();
    }

    fn start_next(&self) {
        loop {
            let command = {
                let mut state = lock(&self.state);
                if state.in_flight.is_some() {
                    return;
                }
                match state.pending.pop_front() {
                    Some(command) => {
                        state.in_flight = Some(command.kind);
                        state.started += 1;
                        command
                    }
                    None => return,
                }
            };
            // Run the action without holding the lock: it may synchronously
            // trigger the completion callback.
            match (command.action)() {
                Ok(()) => return,
                Err(error) => {
                    warn!(kind = ?command.kind, %error, "command failed to start");
                    lock(&self.state).in_flight = None;
                    // No automatic retry; callers own retry policy.
                }
            }
        }
    }

    /// Kind of the command currently in flight, if any.
    pub fn in_flight(&self) -> Option<CommandKind> {
        lock(&self.state).in_flight
    }

    /// Number of commands waiting behind the in-flight one.
    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Total commands started since creation. Diagnostic only.
    pub fn started_count(&self) -> u64 {
        lock(&self.state).started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn starts_head_immediately_and_serializes_the_rest() {
        let queue = CommandQueue::new();
        let started = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let started = started.clone();
            queue.enqueue(Command::new(CommandKind::WriteCharacteristic, move || {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight(), Some(CommandKind::WriteCharacteristic));
        assert_eq!(queue.pending_len(), 2);

        queue.completed_command(CommandKind::WriteCharacteristic);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        queue.completed_command(CommandKind::WriteCharacteristic);
        assert_eq!(started.load(Ordering::SeqCst), 3);
        queue.completed_command(CommandKind::WriteCharacteristic);
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.started_count(), 3);
    }

    #[test]
    fn never_more_than_one_in_flight() {
        let queue = CommandQueue::new();
        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            queue.enqueue(Command::new(CommandKind::ReadCharacteristic, move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                Ok(())
            }));
        }
        for _ in 0..5 {
            active.fetch_sub(1, Ordering::SeqCst);
            queue.completed_command(CommandKind::ReadCharacteristic);
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kind_mismatch_is_nonfatal() {
        let queue = CommandQueue::new();
        let started = Arc::new(AtomicU32::new(0));
        for kind in [CommandKind::WriteCharacteristic, CommandKind::ReadCharacteristic] {
            let started = started.clone();
            queue.enqueue(Command::new(kind, move || {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        // Completed with the wrong tag: logged, but the queue still advances.
        queue.completed_command(CommandKind::DiscoverServices);
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(queue.in_flight(), Some(CommandKind::ReadCharacteristic));
    }

    #[test]
    fn failed_start_advances_to_next_command() {
        let queue = CommandQueue::new();
        let started = Arc::new(AtomicU32::new(0));
        queue.enqueue(Command::new(CommandKind::WriteDescriptor, || {
            Err(Error::DeviceNotFound("aa:bb".into()))
        }));
        {
            let started = started.clone();
            queue.enqueue(Command::new(CommandKind::WriteCharacteristic, move || {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight(), Some(CommandKind::WriteCharacteristic));
    }

    #[test]
    fn completion_without_in_flight_is_ignored() {
        let queue = CommandQueue::new();
        queue.completed_command(CommandKind::ReadCharacteristic);
        assert_eq!(queue.in_flight(), None);
    }
}
