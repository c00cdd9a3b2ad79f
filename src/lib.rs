//! Bucket ownership assignment for a partitioned in-memory cache.
//!
//! This crate decides which cluster member owns which slice of a cache's
//! keyspace and how ownership moves when members come and go:
//! - **Buckets**: keys hash onto a fixed number of buckets (default 2051)
//! - **Slots**: every bucket has a primary copy and optional replicas, each
//!   held by a distinct member
//! - **Commands**: ownership changes are announced as commands that a data
//!   transport executes and acknowledges
//!
//! # Features
//!
//! - Even distribution: each owner holds `floor(B/N)` or `ceil(B/N)` buckets
//! - Minimal movement: a joining member only takes buckets; no data moves
//!   between existing members
//! - Every bucket has an owner at all times, including mid-transfer
//! - Idempotent repartitioning; stale acknowledgements are ignored
//! - Replica promotion when a primary holder fails
//! - The settled table depends only on the member set, not on join order
//!
//! # Example
//!
//! ```rust
//! use bucket_ownership::{AssignmentConfig, BucketOwnershipAssignment, CommandKind};
//!
//! let config = AssignmentConfig::new("sessions").with_replica_count(1);
//! let mut boa = BucketOwnershipAssignment::new(config).unwrap();
//!
//! let a = "127.0.0.1:7001".parse().unwrap();
//! let b = "127.0.0.1:7002".parse().unwrap();
//! boa.add_owner(a);
//! boa.add_owner(b);
//!
//! // Buckets move only when the transport confirms the copy.
//! for command in boa.repartition() {
//!     assert_eq!(command.kind(), CommandKind::BeginTransfer);
//!     let batch = command.batch();
//!     boa.finish_transfer(
//!         batch.source_slot,
//!         batch.destination_slot,
//!         batch.source,
//!         batch.destination,
//!         batch.buckets.iter().copied(),
//!     );
//! }
//!
//! assert_eq!(boa.get_owned_buckets(0, a).len(), 1026);
//! assert_eq!(boa.get_owned_buckets(0, b).len(), 1025);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Membership feed / data transport      │
//! └─────────────────────────────────────────────┘
//!                     │ MemberEvent, finish / reject
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │  AssignmentCoordinator (one tokio task)     │
//! │  • serializes every mutation                │
//! │  • publishes OwnershipSnapshot              │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │  BucketOwnershipAssignment                  │
//! │  • add_owner / remove_owners / repartition  │
//! │  • finish_transfer / reject_transfer        │
//! └─────────────────────────────────────────────┘
//!                     │ BucketCommand
//!                     ▼
//!            CommandListener(s)
//! ```
//!
//! # Concurrency Model
//!
//! - **Mutations**: single-threaded; `&mut self` on the assignment, or the
//!   coordinator task when shared
//! - **Reads**: snapshots are immutable and can be read from any thread
//! - **Listeners**: invoked synchronously inside the mutating call

pub mod cluster;
pub mod config;
pub mod error;
pub mod partitioning;
pub mod rebalancing;
#[doc(hidden)]
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{AssignmentConfig, CoordinatorConfig};
pub use error::{Error, Result};
pub use types::{Address, BucketNumber, StorageSlot, DEFAULT_BUCKET_COUNT, PRIMARY_SLOT};

// Re-export cluster types
pub use cluster::{MemberEvent, MemberEventListener};

// Re-export partitioning types
pub use partitioning::{
    bucket_for_key, BucketOwner, BucketOwnershipAssignment, BucketTransfer, OwnerSummary,
    OwnershipSnapshot, SlotState,
};

// Re-export rebalancing types
pub use rebalancing::{
    AssignmentCoordinator, AssignmentHandle, BucketBatch, BucketCommand, CommandKind,
    CommandListener, CommandListeners, LoggingCommandListener, NoopCommandListener,
};
