//! Bucket ownership for a partitioned cache.
//!
//! The key space is split into a fixed number of buckets. Each bucket has a
//! primary owner (slot 0) and, optionally, replica owners (slots 1..=R), all
//! distinct members. This module keeps that table and moves buckets between
//! members as the membership changes:
//!
//! - balance every slot so each owner holds `floor(B/N)` or `ceil(B/N)`
//!   buckets,
//! - move only what is necessary when an owner joins,
//! - never leave a bucket without an owner, even while data is in flight.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 BucketOwnershipAssignment                    │
//! │                                                              │
//! │   slot 0  [ A A A B B B C C C ... ]   owner per bucket       │
//! │   slot 1  [ B C B C A C A B A ... ]   distinct from slot 0   │
//! │                                                              │
//! │   BucketOwner (per member)                                   │
//! │     owned / outbound / inbound / restoring per slot          │
//! └─────────────────────────────────────────────────────────────┘
//!          │ add_owner / remove_owners / repartition
//!          │ finish_transfer / reject_transfer
//!          ▼
//!   BucketCommand ──▶ CommandListener(s) ──▶ data transport
//! ```
//!
//! # Example
//!
//! ```
//! use bucket_ownership::config::AssignmentConfig;
//! use bucket_ownership::partitioning::BucketOwnershipAssignment;
//!
//! let mut boa = BucketOwnershipAssignment::new(AssignmentConfig::new("sessions")).unwrap();
//! let a = "127.0.0.1:7001".parse().unwrap();
//! let b = "127.0.0.1:7002".parse().unwrap();
//!
//! boa.add_owner(a);
//! boa.add_owner(b);
//!
//! let commands = boa.repartition();
//! assert_eq!(commands.len(), 1);
//! let batch = commands[0].batch();
//! assert_eq!(batch.len(), 1025);
//!
//! boa.finish_transfer(0, 0, a, b, batch.buckets.iter().copied());
//! assert_eq!(boa.get_owned_buckets(0, a).len(), 1026);
//! assert_eq!(boa.get_owned_buckets(0, b).len(), 1025);
//! ```

mod assignment;
mod distribution;
mod owner;
mod rebalance;
mod removal;
mod snapshot;
mod transfer;

pub use assignment::{BucketOwnershipAssignment, SlotState};
pub use distribution::{
    bucket_for_key, home_layout, max_owned_bucket_count, slot_target_shares, target_shares,
    total_target_shares,
};
pub use owner::BucketOwner;
pub use snapshot::{OwnerSummary, OwnershipSnapshot};
pub use transfer::BucketTransfer;
