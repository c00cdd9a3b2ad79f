//! Command listeners and the ordered fan-out that feeds them.
//!
//! Listeners are invoked synchronously from inside the mutating call that
//! produced the command, while the assignment is exclusively borrowed. They
//! cannot call back into the assignment; a listener that needs to react must
//! hand the work to another execution context (for example an
//! [`AssignmentHandle`](crate::rebalancing::AssignmentHandle)).

use crate::rebalancing::command::BucketCommand;
use std::fmt;
use std::sync::Arc;

/// Subscriber receiving every command the assignment emits.
pub trait CommandListener: Send + Sync + 'static {
    /// Called once per emitted command.
    fn on_command(&self, command: &BucketCommand);
}

/// No-op command listener.
pub struct NoopCommandListener;

impl CommandListener for NoopCommandListener {
    fn on_command(&self, _command: &BucketCommand) {}
}

/// Command listener that logs commands.
pub struct LoggingCommandListener;

impl CommandListener for LoggingCommandListener {
    fn on_command(&self, command: &BucketCommand) {
        let batch = command.batch();
        match command {
            BucketCommand::BeginTransfer(_) | BucketCommand::BeginReplicaRestore(_) => {
                tracing::info!(
                    kind = %command.kind(),
                    cache = %batch.cache_name,
                    source = %batch.source_endpoint(),
                    destination = %batch.destination_endpoint(),
                    buckets = batch.len(),
                    "Bucket data transfer started"
                );
            }
            BucketCommand::FinishTransfer(_) | BucketCommand::FinishReplicaRestore(_) => {
                tracing::info!(
                    kind = %command.kind(),
                    cache = %batch.cache_name,
                    source = %batch.source_endpoint(),
                    destination = %batch.destination_endpoint(),
                    buckets = batch.len(),
                    "Bucket data transfer finished"
                );
            }
            BucketCommand::CancelTransfer(_) => {
                tracing::warn!(
                    cache = %batch.cache_name,
                    source = %batch.source_endpoint(),
                    destination = %batch.destination_endpoint(),
                    buckets = batch.len(),
                    "Bucket data transfer cancelled"
                );
            }
            BucketCommand::RestoreBucket(_) => {
                tracing::info!(
                    cache = %batch.cache_name,
                    member = %batch.source,
                    from_slot = batch.source_slot,
                    to_slot = batch.destination_slot,
                    buckets = batch.len(),
                    "Bucket data re-filed under another slot"
                );
            }
        }
    }
}

/// Ordered set of command listeners.
///
/// Every command is delivered to every listener in registration order.
#[derive(Clone, Default)]
pub struct CommandListeners {
    listeners: Vec<Arc<dyn CommandListener>>,
}

impl CommandListeners {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn add(&mut self, listener: Arc<dyn CommandListener>) {
        self.listeners.push(listener);
    }

    /// Append listeners, keeping their order.
    pub fn extend<I>(&mut self, listeners: I)
    where
        I: IntoIterator<Item = Arc<dyn CommandListener>>,
    {
        self.listeners.extend(listeners);
    }

    /// Number of attached listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Check if no listener is attached.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Deliver commands, each to every listener, in order.
    pub fn dispatch(&self, commands: &[BucketCommand]) {
        for command in commands {
            for listener in &self.listeners {
                listener.on_command(command);
            }
        }
    }
}

impl fmt::Debug for CommandListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandListeners")
            .field("len", &self.listeners.len())
            .finish()
    }
}
