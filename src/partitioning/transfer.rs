//! The (slot, address) pair used to describe transfer endpoints.

use crate::types::{Address, StorageSlot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A storage slot on a particular member.
///
/// Used both as "where a bucket is moving from / to" in transfer bookkeeping
/// and as "who holds a given replica".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketTransfer {
    /// Storage slot on `address`.
    pub slot: StorageSlot,
    /// Member address.
    pub address: Address,
}

impl BucketTransfer {
    /// Create a new transfer endpoint.
    pub fn new(slot: StorageSlot, address: Address) -> Self {
        Self { slot, address }
    }
}

impl fmt::Display for BucketTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.slot)
    }
}
