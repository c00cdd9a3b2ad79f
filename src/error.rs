//! Error types for bucket ownership assignment.
//!
//! Stale transfer completions and duplicate membership notices are expected
//! in a distributed setting and are therefore not errors; they are logged
//! and ignored by the assignment itself.

use crate::types::{BucketNumber, StorageSlot};
use thiserror::Error;

/// Result type alias for bucket ownership operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bucket ownership operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors. Raised at construction and never recoverable.
    #[error("config error: {0}")]
    Config(String),

    /// A storage slot outside `[0, replica_count]`.
    #[error("invalid storage slot {slot}: replica count is {replica_count}")]
    InvalidSlot {
        slot: StorageSlot,
        replica_count: u32,
    },

    /// A bucket number outside `[0, bucket_count)`.
    #[error("invalid bucket {bucket}: bucket count is {bucket_count}")]
    InvalidBucket {
        bucket: BucketNumber,
        bucket_count: u32,
    },

    /// Command encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The assignment coordinator task has stopped.
    #[error("assignment coordinator is not running")]
    CoordinatorStopped,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
