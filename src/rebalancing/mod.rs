//! Rebalancing commands and the machinery that delivers them.
//!
//! The assignment never moves data itself. Each mutating call produces
//! [`BucketCommand`]s that tell the data transport what to copy, cancel or
//! promote; the transport reports back with finish or reject notices.
//!
//! # Command lifecycle
//!
//! ```text
//!   repartition ──▶ BeginTransfer ──▶ transport copies data
//!                                        │
//!                     ┌──────────────────┴───────────────┐
//!                     ▼                                  ▼
//!             finish_transfer                     reject_transfer
//!             → FinishTransfer                    → CancelTransfer
//!               (ownership moves)                   (retry later)
//!
//!   remove_owners ──▶ CancelTransfer      (work touching the member)
//!                 ──▶ RestoreBucket       (replica promoted in place)
//!                 ──▶ BeginReplicaRestore (replica re-homed)
//!
//!   repartition   ──▶ RestoreBucket       (two holders swap slots, no copy)
//! ```
//!
//! # Delivery
//!
//! Commands go to every attached [`CommandListener`] in registration order,
//! synchronously, before the mutating call returns. The same commands are
//! also returned to the caller. Wrap the assignment in an
//! [`AssignmentCoordinator`] to drive it from async code.
//!
//! # Example
//!
//! ```
//! use bucket_ownership::config::{AssignmentConfig, CoordinatorConfig};
//! use bucket_ownership::partitioning::BucketOwnershipAssignment;
//! use bucket_ownership::rebalancing::AssignmentCoordinator;
//!
//! # #[tokio::main]
//! # async fn main() -> bucket_ownership::Result<()> {
//! let boa = BucketOwnershipAssignment::new(AssignmentConfig::new("sessions"))?;
//! let (handle, join) = AssignmentCoordinator::spawn(boa, CoordinatorConfig::default());
//!
//! handle.add_owner("127.0.0.1:7001".parse().unwrap()).await?;
//! assert_eq!(handle.snapshot().get_owner_count(), 1);
//!
//! handle.shutdown().await?;
//! let boa = join.await.unwrap();
//! assert_eq!(boa.get_owner_count(), 1);
//! # Ok(())
//! # }
//! ```

pub(crate) mod command;
mod coordinator;
mod listener;

pub use command::{BucketBatch, BucketCommand, CommandKind};
pub use coordinator::{AssignmentCoordinator, AssignmentHandle};
pub use listener::{CommandListener, CommandListeners, LoggingCommandListener, NoopCommandListener};
