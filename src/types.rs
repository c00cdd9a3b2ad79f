//! Core types used throughout the bucket ownership subsystem.

use std::net::SocketAddr;

/// Address of a cluster member that can own buckets.
pub type Address = SocketAddr;

/// Index of a bucket in `[0, bucket_count)`.
pub type BucketNumber = u32;

/// Storage slot of a bucket copy. Slot 0 is the primary, slots `1..=replica_count`
/// are replicas.
pub type StorageSlot = u32;

/// The storage slot holding a bucket's primary copy.
pub const PRIMARY_SLOT: StorageSlot = 0;

/// Default number of buckets a cache's keyspace is divided into.
pub const DEFAULT_BUCKET_COUNT: u32 = 2051;
