//! Owner removal.
//!
//! Removing an owner is synchronous: the table never shows a departed
//! member. Work touching the member is cancelled, replicas of its primaries
//! are promoted in place, and its replica buckets are handed to the
//! remaining owners and refilled by restores.

use crate::partitioning::assignment::BucketOwnershipAssignment;
use crate::partitioning::owner::BucketOwner;
use crate::partitioning::transfer::BucketTransfer;
use crate::rebalancing::command::{BucketCommand, CommandBuilder, CommandKind};
use crate::types::{Address, BucketNumber, StorageSlot, PRIMARY_SLOT};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl BucketOwnershipAssignment {
    /// Remove owners, in the given order.
    ///
    /// Every bucket a removed owner held gets a new owner before this
    /// returns. Primaries go to a replica holder that has the data when one
    /// exists (emitting `RestoreBucket`), otherwise to the owner with the
    /// largest deficit, without data. Transfers and restores touching the
    /// removed owner are cancelled. Unknown addresses are ignored.
    pub fn remove_owners<I>(&mut self, addresses: I) -> Vec<BucketCommand>
    where
        I: IntoIterator<Item = Address>,
    {
        let mut builder = CommandBuilder::new(&self.config.cache_name);
        for address in addresses {
            self.remove_owner(address, &mut builder);
        }
        self.emit(builder, "remove_owners")
    }

    fn remove_owner(&mut self, address: Address, builder: &mut CommandBuilder) {
        let Some(removed) = self.owners.remove(&address) else {
            debug!(cache = %self.config.cache_name, %address, "Remove for unknown owner ignored");
            return;
        };

        self.cancel_pending_work(&removed, builder);
        let resource = self.detach_restore_sources(&removed, builder);

        if self.owners.is_empty() {
            for row in &mut self.table {
                row.iter_mut().for_each(|entry| *entry = None);
            }
            self.active_slots = 0;
            self.unrestored.clear();
            warn!(
                cache = %self.config.cache_name,
                %address,
                "Last owner removed, no bucket has an owner"
            );
            return;
        }

        // Primaries: promote a replica that has the data, else reassign.
        let mut vacancies: Vec<(StorageSlot, BucketNumber)> = Vec::new();
        let mut lost: Vec<BucketNumber> = Vec::new();
        for bucket in removed.owned_buckets(PRIMARY_SLOT).iter().copied() {
            self.table[PRIMARY_SLOT as usize][bucket as usize] = None;
            match self.promotion_candidate(bucket, &resource) {
                Some((slot, holder)) => {
                    self.promote(slot, bucket, holder, builder);
                    vacancies.push((slot, bucket));
                }
                None => lost.push(bucket),
            }
        }
        let promoted = vacancies.len();

        while self.active_slots > self.owners.len() {
            self.deactivate_last_slot(builder);
        }
        vacancies.retain(|(slot, _)| (*slot as usize) < self.active_slots);

        let targets: Vec<BTreeMap<Address, usize>> = (0..self.active_slots as StorageSlot)
            .map(|slot| self.slot_targets(slot))
            .collect();
        for bucket in lost.iter().copied() {
            match self.choose_holder(PRIMARY_SLOT, bucket, &targets[PRIMARY_SLOT as usize]) {
                Some((holder, conflict)) => {
                    if let Some(other) = conflict {
                        self.cancel_inbound(holder, other, bucket, builder);
                    }
                    self.assign(PRIMARY_SLOT, bucket, holder);
                }
                None => {
                    warn!(cache = %self.config.cache_name, bucket, "No owner available for primary bucket");
                }
            }
        }

        // Replicas the removed owner held in slots that are still populated.
        for slot in 1..self.active_slots as StorageSlot {
            for bucket in removed.owned_buckets(slot).iter().copied() {
                if self.table[slot as usize][bucket as usize] == Some(address) {
                    self.table[slot as usize][bucket as usize] = None;
                    vacancies.push((slot, bucket));
                }
            }
        }

        for (slot, bucket) in vacancies.iter().copied() {
            self.fill_vacancy(slot, bucket, &targets[slot as usize], builder);
        }

        for ((slot, bucket), holder) in resource {
            if slot as usize >= self.active_slots
                || self.table[slot as usize][bucket as usize] != Some(holder)
            {
                continue;
            }
            let Some(primary) = self.table[PRIMARY_SLOT as usize][bucket as usize] else {
                continue;
            };
            let source = BucketTransfer::new(PRIMARY_SLOT, primary);
            self.restore_into_holder(slot, bucket, holder, source);
            builder.add(
                CommandKind::BeginReplicaRestore,
                source,
                BucketTransfer::new(slot, holder),
                bucket,
            );
        }

        info!(
            cache = %self.config.cache_name,
            %address,
            promoted,
            reassigned = lost.len(),
            replicas = vacancies.len(),
            owner_count = self.owners.len(),
            "Removed bucket owner"
        );
    }

    /// Cancel transfers to and from `removed` and restores into it.
    fn cancel_pending_work(&mut self, removed: &BucketOwner, builder: &mut CommandBuilder) {
        let address = removed.address();

        for slot in 0..self.active_slots as StorageSlot {
            let here = BucketTransfer::new(slot, address);

            for (bucket, source) in removed.inbound_transfers(slot) {
                if let Some(owner) = self.owners.get_mut(&source.address) {
                    owner.take_outbound(source.slot, bucket);
                }
                builder.add(CommandKind::CancelTransfer, source, here, bucket);
            }

            for (bucket, destination) in removed.outbound_transfers(slot) {
                if let Some(owner) = self.owners.get_mut(&destination.address) {
                    owner.take_inbound(destination.slot, bucket);
                }
                builder.add(CommandKind::CancelTransfer, here, destination, bucket);
            }

            for (bucket, source) in removed.restores(slot) {
                if let Some(owner) = self.owners.get_mut(&source.address) {
                    owner.take_outbound_replica(slot, bucket);
                }
                builder.add(CommandKind::CancelTransfer, source, here, bucket);
            }
        }

        self.unrestored
            .retain(|(slot, bucket)| !removed.owns(*slot, *bucket));
    }

    /// Cancel restores sourced from `removed`. Returns the replicas that
    /// still need a source, keyed by (slot, bucket), with their holder.
    fn detach_restore_sources(
        &mut self,
        removed: &BucketOwner,
        builder: &mut CommandBuilder,
    ) -> BTreeMap<(StorageSlot, BucketNumber), Address> {
        let mut resource = BTreeMap::new();

        for slot in 1..self.active_slots as StorageSlot {
            for (bucket, destination) in removed.outbound_replica_restores(slot) {
                let source = self
                    .owners
                    .get_mut(&destination.address)
                    .and_then(|o| o.take_restore(slot, bucket))
                    .unwrap_or_else(|| BucketTransfer::new(PRIMARY_SLOT, removed.address()));
                builder.add(CommandKind::CancelTransfer, source, destination, bucket);
                resource.insert((slot, bucket), destination.address);
            }
        }

        resource
    }

    /// Lowest replica slot of `bucket` whose holder has complete data.
    fn promotion_candidate(
        &self,
        bucket: BucketNumber,
        resource: &BTreeMap<(StorageSlot, BucketNumber), Address>,
    ) -> Option<(StorageSlot, Address)> {
        (1..self.active_slots as StorageSlot).find_map(|slot| {
            let holder = self.table[slot as usize][bucket as usize]?;
            let owner = self.owners.get(&holder)?;
            let complete = owner.restore_source(slot, bucket).is_none()
                && !self.unrestored.contains(&(slot, bucket))
                && !resource.contains_key(&(slot, bucket));
            complete.then_some((slot, holder))
        })
    }

    /// Move the replica in `slot` of `bucket` to the primary slot of the
    /// same holder. The replica slot is left vacant.
    fn promote(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        holder: Address,
        builder: &mut CommandBuilder,
    ) {
        let from = BucketTransfer::new(slot, holder);
        let to = BucketTransfer::new(PRIMARY_SLOT, holder);

        let outbound = self
            .owners
            .get(&holder)
            .and_then(|o| o.outbound(slot, bucket))
            .copied();
        if let Some(destination) = outbound {
            self.abort_transfer(from, destination, bucket);
            builder.add(CommandKind::CancelTransfer, from, destination, bucket);
        }

        if let Some(owner) = self.owners.get_mut(&holder) {
            owner.remove_bucket(slot, bucket);
            owner.add_bucket(PRIMARY_SLOT, bucket);
        }
        self.table[slot as usize][bucket as usize] = None;
        self.table[PRIMARY_SLOT as usize][bucket as usize] = Some(holder);

        builder.add(CommandKind::RestoreBucket, from, to, bucket);
    }

    /// Depopulate the highest active replica slot.
    fn deactivate_last_slot(&mut self, builder: &mut CommandBuilder) {
        if self.active_slots <= 1 {
            return;
        }
        let slot = (self.active_slots - 1) as StorageSlot;

        let mut cancels: Vec<(BucketTransfer, BucketTransfer, BucketNumber)> = Vec::new();
        for owner in self.owners.values() {
            let here = BucketTransfer::new(slot, owner.address());
            cancels.extend(
                owner
                    .outbound_transfers(slot)
                    .map(|(bucket, destination)| (here, destination, bucket)),
            );
            cancels.extend(
                owner
                    .restores(slot)
                    .map(|(bucket, source)| (source, here, bucket)),
            );
        }
        for (source, destination, bucket) in cancels {
            builder.add(CommandKind::CancelTransfer, source, destination, bucket);
        }

        for owner in self.owners.values_mut() {
            owner.clear_slot(slot);
        }
        self.table[slot as usize]
            .iter_mut()
            .for_each(|entry| *entry = None);
        self.unrestored.retain(|(s, _)| *s != slot);
        self.active_slots -= 1;

        info!(
            cache = %self.config.cache_name,
            slot,
            owner_count = self.owners.len(),
            "Deactivated replica slot, not enough owners"
        );
    }

    /// Give a vacant replica a new holder and restore it from the primary.
    fn fill_vacancy(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        targets: &BTreeMap<Address, usize>,
        builder: &mut CommandBuilder,
    ) {
        let Some(primary) = self.table[PRIMARY_SLOT as usize][bucket as usize] else {
            return;
        };
        match self.choose_holder(slot, bucket, targets) {
            Some((holder, conflict)) => {
                if let Some(other) = conflict {
                    self.cancel_inbound(holder, other, bucket, builder);
                }
                let source = BucketTransfer::new(PRIMARY_SLOT, primary);
                self.start_restore(slot, bucket, holder, source);
                builder.add(
                    CommandKind::BeginReplicaRestore,
                    source,
                    BucketTransfer::new(slot, holder),
                    bucket,
                );
            }
            None => {
                warn!(
                    cache = %self.config.cache_name,
                    slot,
                    bucket,
                    "No distinct owner available for replica bucket"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AssignmentConfig;
    use crate::partitioning::{BucketOwnershipAssignment, SlotState};
    use crate::rebalancing::CommandKind;
    use crate::testing::{addr, converge};
    use std::collections::BTreeSet;

    fn assignment(bucket_count: u32, replica_count: u32) -> BucketOwnershipAssignment {
        BucketOwnershipAssignment::new(
            AssignmentConfig::new("test")
                .with_bucket_count(bucket_count)
                .with_replica_count(replica_count),
        )
        .unwrap()
    }

    fn assert_fully_owned(boa: &BucketOwnershipAssignment) {
        for slot in 0..boa.active_slot_count() as u32 {
            for bucket in 0..boa.bucket_count() {
                let owner = boa.get_owner(slot, bucket);
                assert!(owner.is_some(), "slot {} bucket {} unowned", slot, bucket);
                assert!(boa.has_owner(owner.unwrap()));
            }
        }
    }

    fn assert_distinct_holders(boa: &BucketOwnershipAssignment) {
        for bucket in 0..boa.bucket_count() {
            let holders: BTreeSet<_> = (0..boa.active_slot_count() as u32)
                .filter_map(|slot| boa.get_owner(slot, bucket))
                .collect();
            assert_eq!(holders.len(), boa.active_slot_count(), "bucket {}", bucket);
        }
    }

    #[test]
    fn test_remove_unknown_owner_is_noop() {
        let mut boa = assignment(16, 0);
        boa.add_owner(addr(7001));
        assert!(boa.remove_owners([addr(7999)]).is_empty());
        assert_eq!(boa.get_owner_count(), 1);
    }

    #[test]
    fn test_remove_without_replicas_emits_nothing() {
        let mut boa = assignment(2051, 0);
        for port in 7001..=7004 {
            boa.add_owner(addr(port));
        }
        converge(&mut boa);

        let commands = boa.remove_owners([addr(7002)]);
        assert!(commands.is_empty());
        assert_eq!(boa.get_owner_count(), 3);
        assert_fully_owned(&boa);
        let total: usize = [7001, 7003, 7004]
            .iter()
            .map(|p| boa.get_owned_buckets(0, addr(*p)).len())
            .sum();
        assert_eq!(total, 2051);
    }

    #[test]
    fn test_remove_destination_cancels_inbound() {
        let mut boa = assignment(2051, 0);
        boa.add_owner(addr(7001));
        boa.add_owner(addr(7002));
        converge(&mut boa);

        boa.add_owner(addr(7003));
        let begun: BTreeSet<u32> = boa
            .repartition()
            .iter()
            .filter(|c| c.batch().destination == addr(7003))
            .flat_map(|c| c.batch().buckets.iter().copied())
            .collect();
        assert!(!begun.is_empty());

        let commands = boa.remove_owners([addr(7003)]);
        assert!(commands
            .iter()
            .all(|c| c.kind() == CommandKind::CancelTransfer));
        let cancelled: BTreeSet<u32> = commands
            .iter()
            .flat_map(|c| c.batch().buckets.iter().copied())
            .collect();
        assert_eq!(cancelled, begun);

        assert!(boa.is_quiescent());
        assert_eq!(boa.get_owned_buckets(0, addr(7001)).len(), 1026);
        assert_eq!(boa.get_owned_buckets(0, addr(7002)).len(), 1025);
    }

    #[test]
    fn test_remove_source_mid_transfer() {
        let mut boa = assignment(64, 0);
        boa.add_owner(addr(7001));
        boa.add_owner(addr(7002));
        let begun = boa.repartition();
        assert_eq!(begun.len(), 1);

        let commands = boa.remove_owners([addr(7001)]);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind(), CommandKind::CancelTransfer);
        assert_eq!(commands[0].batch().buckets, begun[0].batch().buckets);

        assert_eq!(boa.get_owned_buckets(0, addr(7002)).len(), 64);
        assert!(boa.is_quiescent());
    }

    #[test]
    fn test_remove_last_owner_clears_table() {
        let mut boa = assignment(16, 1);
        boa.add_owner(addr(7001));
        boa.remove_owners([addr(7001)]);
        assert_eq!(boa.get_owner_count(), 0);
        assert_eq!(boa.active_slot_count(), 0);
        assert_eq!(boa.get_owner(0, 0), None);

        // The next owner starts from scratch.
        boa.add_owner(addr(7002));
        assert_eq!(boa.get_owned_buckets(0, addr(7002)).len(), 16);
    }

    #[test]
    fn test_replica_promoted_on_removal() {
        let mut boa = assignment(30, 1);
        for port in 7001..=7003 {
            boa.add_owner(addr(port));
        }
        converge(&mut boa);
        assert_eq!(boa.active_slot_count(), 2);
        assert_distinct_holders(&boa);

        let primaries = boa.get_owned_buckets(0, addr(7002));
        let replica_holders: Vec<_> = primaries
            .iter()
            .map(|b| (*b, boa.get_owner(1, *b).unwrap()))
            .collect();

        let commands = boa.remove_owners([addr(7002)]);
        assert_eq!(boa.active_slot_count(), 2);

        let promoted: BTreeSet<u32> = commands
            .iter()
            .filter(|c| c.kind() == CommandKind::RestoreBucket)
            .flat_map(|c| c.batch().buckets.iter().copied())
            .collect();
        assert_eq!(promoted, primaries);

        for (bucket, holder) in replica_holders {
            assert_eq!(boa.get_owner(0, bucket), Some(holder));
        }
        for command in commands.iter().filter(|c| c.kind() == CommandKind::RestoreBucket) {
            let batch = command.batch();
            assert_eq!(batch.source, batch.destination);
            assert_eq!(batch.source_slot, 1);
            assert_eq!(batch.destination_slot, 0);
        }

        assert_fully_owned(&boa);
        assert_distinct_holders(&boa);

        // Every replica that changed hands is being restored from its primary.
        for bucket in 0..30 {
            if let Some(SlotState::Restoring { source, .. }) = boa.slot_state(1, bucket) {
                assert_eq!(Some(source.address), boa.get_owner(0, bucket));
            }
        }

        converge(&mut boa);
        assert!(boa.is_quiescent());
        assert_distinct_holders(&boa);
    }

    #[test]
    fn test_replica_slot_deactivated_when_owners_drop() {
        let mut boa = assignment(10, 1);
        boa.add_owner(addr(7001));
        boa.add_owner(addr(7002));
        converge(&mut boa);
        assert_eq!(boa.active_slot_count(), 2);

        let commands = boa.remove_owners([addr(7001)]);
        assert_eq!(boa.active_slot_count(), 1);
        assert!(commands
            .iter()
            .all(|c| c.kind() == CommandKind::RestoreBucket));
        assert_eq!(boa.get_owned_buckets(0, addr(7002)).len(), 10);
        assert!(boa.get_owned_buckets(1, addr(7002)).is_empty());
        assert!(boa.is_quiescent());
    }

    #[test]
    fn test_remove_restore_source_resources_replica() {
        let mut boa = assignment(12, 1);
        for port in 7001..=7003 {
            boa.add_owner(addr(port));
        }
        // Balance primaries, then populate the replica slot but leave the
        // restores in flight.
        let commands = boa.repartition();
        crate::testing::finish_all(&mut boa, &commands);
        let restores = boa.repartition();
        assert!(restores
            .iter()
            .all(|c| c.kind() == CommandKind::BeginReplicaRestore));

        let commands = boa.remove_owners([addr(7001)]);
        assert!(commands
            .iter()
            .any(|c| c.kind() == CommandKind::CancelTransfer));
        // Unfinished replicas cannot be promoted.
        assert!(!commands
            .iter()
            .any(|c| c.kind() == CommandKind::RestoreBucket));

        assert_fully_owned(&boa);
        assert_distinct_holders(&boa);
        for bucket in 0..12 {
            if let Some(SlotState::Restoring { source, .. }) = boa.slot_state(1, bucket) {
                assert_ne!(source.address, addr(7001));
                assert_eq!(Some(source.address), boa.get_owner(0, bucket));
            }
        }

        converge(&mut boa);
        assert!(boa.is_quiescent());
    }
}
