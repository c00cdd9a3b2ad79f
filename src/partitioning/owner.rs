//! Per-member bucket bookkeeping.
//!
//! A [`BucketOwner`] records which buckets a member holds in each storage
//! slot, plus the in-flight work touching those buckets. The assignment keeps
//! these records and its routing table in lockstep; owners never mutate
//! each other.

use crate::partitioning::transfer::BucketTransfer;
use crate::types::{Address, BucketNumber, StorageSlot};
use std::collections::{BTreeMap, BTreeSet};

/// Bucket ownership record of a single cluster member.
#[derive(Debug, Clone)]
pub struct BucketOwner {
    /// Member address.
    address: Address,

    /// Owned bucket numbers, indexed by storage slot.
    owned: Vec<BTreeSet<BucketNumber>>,

    /// Buckets this member is handing over, indexed by the slot being moved.
    /// Maps bucket to destination.
    outbound: Vec<BTreeMap<BucketNumber, BucketTransfer>>,

    /// Buckets this member is about to take over, indexed by destination
    /// slot. Maps bucket to source.
    inbound: Vec<BTreeMap<BucketNumber, BucketTransfer>>,

    /// Owned replica buckets whose data is still being copied in, indexed by
    /// slot. Maps bucket to the copy source.
    restoring: Vec<BTreeMap<BucketNumber, BucketTransfer>>,

    /// Replica restores this member is the data source for, indexed by the
    /// replica slot being restored. Maps bucket to the restore destination.
    outbound_replicas: Vec<BTreeMap<BucketNumber, BucketTransfer>>,

    /// Set before a graceful removal; leaving owners are drained.
    leaving: bool,
}

impl BucketOwner {
    /// Create an empty owner serving `slot_count` storage slots.
    pub fn new(address: Address, slot_count: usize) -> Self {
        Self {
            address,
            owned: vec![BTreeSet::new(); slot_count],
            outbound: vec![BTreeMap::new(); slot_count],
            inbound: vec![BTreeMap::new(); slot_count],
            restoring: vec![BTreeMap::new(); slot_count],
            outbound_replicas: vec![BTreeMap::new(); slot_count],
            leaving: false,
        }
    }

    /// Member address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the owner is being drained before removal.
    pub fn is_leaving(&self) -> bool {
        self.leaving
    }

    pub(crate) fn set_leaving(&mut self, leaving: bool) {
        self.leaving = leaving;
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Buckets owned in `slot`.
    pub fn owned_buckets(&self, slot: StorageSlot) -> &BTreeSet<BucketNumber> {
        &self.owned[slot as usize]
    }

    /// Number of buckets owned in `slot`.
    pub fn owned_count(&self, slot: StorageSlot) -> usize {
        self.owned[slot as usize].len()
    }

    /// Number of buckets owned across all slots.
    pub fn total_owned(&self) -> usize {
        self.owned.iter().map(BTreeSet::len).sum()
    }

    /// Whether `bucket` is owned in `slot`.
    pub fn owns(&self, slot: StorageSlot, bucket: BucketNumber) -> bool {
        self.owned[slot as usize].contains(&bucket)
    }

    pub(crate) fn add_bucket(&mut self, slot: StorageSlot, bucket: BucketNumber) {
        self.owned[slot as usize].insert(bucket);
    }

    pub(crate) fn remove_bucket(&mut self, slot: StorageSlot, bucket: BucketNumber) -> bool {
        self.owned[slot as usize].remove(&bucket)
    }

    /// Holding in `slot` once all pending transfers complete.
    ///
    /// Buckets promised away are already subtracted and buckets on their way
    /// in are already added, so balancing never re-selects in-flight work.
    pub fn projected_count(&self, slot: StorageSlot) -> usize {
        let slot = slot as usize;
        self.owned[slot].len() - self.outbound[slot].len() + self.inbound[slot].len()
    }

    /// Owned buckets in `slot` with no transfer or restore in flight,
    /// highest bucket number first.
    pub fn idle_buckets(&self, slot: StorageSlot) -> impl Iterator<Item = BucketNumber> + '_ {
        let index = slot as usize;
        self.owned[index]
            .iter()
            .rev()
            .copied()
            .filter(move |b| {
                !self.outbound[index].contains_key(b) && !self.restoring[index].contains_key(b)
            })
    }

    /// Whether `bucket` in `slot` is owned and has no work in flight.
    pub fn is_idle(&self, slot: StorageSlot, bucket: BucketNumber) -> bool {
        let index = slot as usize;
        self.owned[index].contains(&bucket)
            && !self.outbound[index].contains_key(&bucket)
            && !self.restoring[index].contains_key(&bucket)
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Destination of the outbound transfer of `bucket` in `slot`, if any.
    pub fn outbound(&self, slot: StorageSlot, bucket: BucketNumber) -> Option<&BucketTransfer> {
        self.outbound[slot as usize].get(&bucket)
    }

    /// All outbound transfers in `slot`.
    pub fn outbound_transfers(
        &self,
        slot: StorageSlot,
    ) -> impl Iterator<Item = (BucketNumber, BucketTransfer)> + '_ {
        self.outbound[slot as usize].iter().map(|(b, t)| (*b, *t))
    }

    pub(crate) fn begin_outbound(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        destination: BucketTransfer,
    ) {
        self.outbound[slot as usize].insert(bucket, destination);
    }

    pub(crate) fn take_outbound(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
    ) -> Option<BucketTransfer> {
        self.outbound[slot as usize].remove(&bucket)
    }

    /// Source of the inbound transfer of `bucket` into `slot`, if any.
    pub fn inbound(&self, slot: StorageSlot, bucket: BucketNumber) -> Option<&BucketTransfer> {
        self.inbound[slot as usize].get(&bucket)
    }

    /// All inbound transfers into `slot`.
    pub fn inbound_transfers(
        &self,
        slot: StorageSlot,
    ) -> impl Iterator<Item = (BucketNumber, BucketTransfer)> + '_ {
        self.inbound[slot as usize].iter().map(|(b, t)| (*b, *t))
    }

    pub(crate) fn begin_inbound(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        source: BucketTransfer,
    ) {
        self.inbound[slot as usize].insert(bucket, source);
    }

    pub(crate) fn take_inbound(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
    ) -> Option<BucketTransfer> {
        self.inbound[slot as usize].remove(&bucket)
    }

    // =========================================================================
    // Replica restores
    // =========================================================================

    /// Source of the restore filling `bucket` in `slot`, if it is still
    /// being copied in.
    pub fn restore_source(&self, slot: StorageSlot, bucket: BucketNumber) -> Option<&BucketTransfer> {
        self.restoring[slot as usize].get(&bucket)
    }

    /// All restores into `slot` still in flight.
    pub fn restores(
        &self,
        slot: StorageSlot,
    ) -> impl Iterator<Item = (BucketNumber, BucketTransfer)> + '_ {
        self.restoring[slot as usize].iter().map(|(b, t)| (*b, *t))
    }

    pub(crate) fn begin_restore(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        source: BucketTransfer,
    ) {
        self.restoring[slot as usize].insert(bucket, source);
    }

    pub(crate) fn take_restore(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
    ) -> Option<BucketTransfer> {
        self.restoring[slot as usize].remove(&bucket)
    }

    /// Destination of a restore of replica `slot` of `bucket` sourced here.
    pub fn outbound_replica(
        &self,
        slot: StorageSlot,
        bucket: BucketNumber,
    ) -> Option<&BucketTransfer> {
        self.outbound_replicas[slot as usize].get(&bucket)
    }

    /// All restores of replica `slot` sourced here.
    pub fn outbound_replica_restores(
        &self,
        slot: StorageSlot,
    ) -> impl Iterator<Item = (BucketNumber, BucketTransfer)> + '_ {
        self.outbound_replicas[slot as usize].iter().map(|(b, t)| (*b, *t))
    }

    pub(crate) fn begin_outbound_replica(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        destination: BucketTransfer,
    ) {
        self.outbound_replicas[slot as usize].insert(bucket, destination);
    }

    pub(crate) fn take_outbound_replica(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
    ) -> Option<BucketTransfer> {
        self.outbound_replicas[slot as usize].remove(&bucket)
    }

    // =========================================================================
    // Summary
    // =========================================================================

    /// Number of in-flight transfers and restores this owner takes part in.
    pub fn pending_count(&self) -> usize {
        self.outbound.iter().map(BTreeMap::len).sum::<usize>()
            + self.inbound.iter().map(BTreeMap::len).sum::<usize>()
            + self.restoring.iter().map(BTreeMap::len).sum::<usize>()
            + self.outbound_replicas.iter().map(BTreeMap::len).sum::<usize>()
    }

    /// Whether the owner takes part in no in-flight work.
    pub fn is_quiescent(&self) -> bool {
        self.pending_count() == 0
    }

    /// Drop everything recorded for `slot`.
    pub(crate) fn clear_slot(&mut self, slot: StorageSlot) {
        let slot = slot as usize;
        self.owned[slot].clear();
        self.outbound[slot].clear();
        self.inbound[slot].clear();
        self.restoring[slot].clear();
        self.outbound_replicas[slot].clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_owned_buckets() {
        let mut owner = BucketOwner::new(addr(7001), 2);
        owner.add_bucket(0, 3);
        owner.add_bucket(0, 1);
        owner.add_bucket(1, 2);

        assert!(owner.owns(0, 3));
        assert!(!owner.owns(1, 3));
        assert_eq!(owner.owned_count(0), 2);
        assert_eq!(owner.total_owned(), 3);

        assert!(owner.remove_bucket(0, 3));
        assert!(!owner.remove_bucket(0, 3));
        assert_eq!(owner.owned_count(0), 1);
    }

    #[test]
    fn test_projected_count() {
        let mut owner = BucketOwner::new(addr(7001), 1);
        for b in 0..4 {
            owner.add_bucket(0, b);
        }
        owner.begin_outbound(0, 3, BucketTransfer::new(0, addr(7002)));
        owner.begin_outbound(0, 2, BucketTransfer::new(0, addr(7002)));
        owner.begin_inbound(0, 9, BucketTransfer::new(0, addr(7003)));

        assert_eq!(owner.owned_count(0), 4);
        assert_eq!(owner.projected_count(0), 3);
        assert_eq!(owner.pending_count(), 3);
        assert!(!owner.is_quiescent());
    }

    #[test]
    fn test_idle_buckets_skip_in_flight_work() {
        let mut owner = BucketOwner::new(addr(7001), 2);
        for b in 0..4 {
            owner.add_bucket(1, b);
        }
        owner.begin_outbound(1, 3, BucketTransfer::new(1, addr(7002)));
        owner.begin_restore(1, 1, BucketTransfer::new(0, addr(7003)));

        let idle: Vec<_> = owner.idle_buckets(1).collect();
        assert_eq!(idle, vec![2, 0]);
        assert!(owner.is_idle(1, 2));
        assert!(!owner.is_idle(1, 3));
        assert!(!owner.is_idle(1, 1));
    }

    #[test]
    fn test_take_clears_bookkeeping() {
        let mut owner = BucketOwner::new(addr(7001), 2);
        owner.begin_outbound_replica(1, 5, BucketTransfer::new(1, addr(7002)));
        assert_eq!(
            owner.outbound_replica(1, 5),
            Some(&BucketTransfer::new(1, addr(7002)))
        );
        assert!(owner.take_outbound_replica(1, 5).is_some());
        assert!(owner.take_outbound_replica(1, 5).is_none());
        assert!(owner.is_quiescent());
    }

    #[test]
    fn test_clear_slot() {
        let mut owner = BucketOwner::new(addr(7001), 2);
        owner.add_bucket(0, 1);
        owner.add_bucket(1, 2);
        owner.begin_restore(1, 2, BucketTransfer::new(0, addr(7002)));

        owner.clear_slot(1);
        assert_eq!(owner.owned_count(1), 0);
        assert_eq!(owner.owned_count(0), 1);
        assert!(owner.is_quiescent());
    }

    #[test]
    fn test_leaving_flag() {
        let mut owner = BucketOwner::new(addr(7001), 1);
        assert!(!owner.is_leaving());
        owner.set_leaving(true);
        assert!(owner.is_leaving());
    }
}
