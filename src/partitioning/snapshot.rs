//! Immutable ownership views for readers outside the mutation context.

use crate::partitioning::distribution::bucket_for_key;
use crate::types::{Address, BucketNumber, StorageSlot};
use serde::{Deserialize, Serialize};

/// Per-owner summary captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSummary {
    pub address: Address,
    pub leaving: bool,
    /// Owned bucket count, indexed by storage slot.
    pub owned_counts: Vec<usize>,
}

/// Point-in-time copy of an ownership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipSnapshot {
    pub cache_name: String,
    pub bucket_count: u32,
    pub replica_count: u32,
    /// Number of populated slots.
    pub active_slots: usize,
    /// Transfers and restores in flight when the snapshot was taken.
    pub pending_transfers: usize,
    /// Owner per `[slot][bucket]`, populated slots only.
    pub table: Vec<Vec<Option<Address>>>,
    /// Owners ordered by address.
    pub owners: Vec<OwnerSummary>,
}

impl OwnershipSnapshot {
    /// Snapshot of a cache with no owners.
    pub fn empty(cache_name: impl Into<String>, bucket_count: u32, replica_count: u32) -> Self {
        Self {
            cache_name: cache_name.into(),
            bucket_count,
            replica_count,
            active_slots: 0,
            pending_transfers: 0,
            table: Vec::new(),
            owners: Vec::new(),
        }
    }

    /// Owner of `bucket` in `slot`.
    pub fn get_owner(&self, slot: StorageSlot, bucket: BucketNumber) -> Option<Address> {
        self.table
            .get(slot as usize)
            .and_then(|row| row.get(bucket as usize))
            .copied()
            .flatten()
    }

    /// Owner of the bucket `key` maps to, in `slot`.
    pub fn owner_for_key(&self, slot: StorageSlot, key: &[u8]) -> Option<Address> {
        if self.bucket_count == 0 {
            return None;
        }
        self.get_owner(slot, bucket_for_key(key, self.bucket_count))
    }

    /// Number of owners.
    pub fn get_owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Buckets `address` owned in `slot`.
    pub fn owned_count(&self, address: Address, slot: StorageSlot) -> usize {
        self.owners
            .iter()
            .find(|o| o.address == address)
            .and_then(|o| o.owned_counts.get(slot as usize).copied())
            .unwrap_or(0)
    }

    /// Whether nothing was in flight.
    pub fn is_quiescent(&self) -> bool {
        self.pending_transfers == 0
    }

    /// Serialize snapshot to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize snapshot from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn snapshot() -> OwnershipSnapshot {
        OwnershipSnapshot {
            cache_name: "c".to_string(),
            bucket_count: 4,
            replica_count: 1,
            active_slots: 2,
            pending_transfers: 0,
            table: vec![
                vec![Some(addr(7001)), Some(addr(7001)), Some(addr(7002)), Some(addr(7002))],
                vec![Some(addr(7002)), Some(addr(7002)), Some(addr(7001)), Some(addr(7001))],
            ],
            owners: vec![
                OwnerSummary {
                    address: addr(7001),
                    leaving: false,
                    owned_counts: vec![2, 2],
                },
                OwnerSummary {
                    address: addr(7002),
                    leaving: false,
                    owned_counts: vec![2, 2],
                },
            ],
        }
    }

    #[test]
    fn test_lookup() {
        let snapshot = snapshot();
        assert_eq!(snapshot.get_owner(0, 2), Some(addr(7002)));
        assert_eq!(snapshot.get_owner(1, 2), Some(addr(7001)));
        assert_eq!(snapshot.get_owner(2, 0), None);
        assert_eq!(snapshot.get_owner(0, 9), None);
        assert_eq!(snapshot.owned_count(addr(7001), 1), 2);
        assert_eq!(snapshot.owned_count(addr(7999), 0), 0);
        assert!(snapshot.is_quiescent());
    }

    #[test]
    fn test_owner_for_key_matches_bucket() {
        let snapshot = snapshot();
        let bucket = bucket_for_key(b"user:1", 4);
        assert_eq!(snapshot.owner_for_key(0, b"user:1"), snapshot.get_owner(0, bucket));
    }

    #[test]
    fn test_empty() {
        let snapshot = OwnershipSnapshot::empty("c", 16, 0);
        assert_eq!(snapshot.get_owner_count(), 0);
        assert_eq!(snapshot.owner_for_key(0, b"k"), None);
    }

    #[test]
    fn test_serialization() {
        let snapshot = snapshot();
        let decoded = OwnershipSnapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(snapshot, decoded);
    }
}
