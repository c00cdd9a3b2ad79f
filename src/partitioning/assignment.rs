//! Bucket ownership assignment.
//!
//! The assignment holds the ownership table of one cache: for every storage
//! slot and bucket, the member that owns it and any in-flight work. It
//! validates every transition and emits [`BucketCommand`]s describing the
//! data movement the transport has to perform.
//!
//! # State machine
//!
//! ```text
//! OWNED(owner) --begin-transfer--> TRANSFERRING(owner=old, pending=new)
//! TRANSFERRING --finish-transfer--> OWNED(new)
//! TRANSFERRING --reject/cancel----> OWNED(old)
//!
//! replica slots only:
//! (vacant) --begin-replica-restore--> RESTORING(owner=new, source)
//! RESTORING --finish-replica-restore--> OWNED(new)
//! ```
//!
//! # Concurrency
//!
//! There is no internal locking. All mutating calls must be serialized
//! through one logical execution context; `&mut self` enforces that within a
//! thread and [`AssignmentCoordinator`](crate::rebalancing::AssignmentCoordinator)
//! provides it across tasks. Listeners run inside the mutating call and
//! cannot reach back into the assignment.

use crate::config::AssignmentConfig;
use crate::error::Result;
use crate::partitioning::distribution::{
    max_owned_bucket_count, slot_target_shares, total_target_shares,
};
use crate::partitioning::owner::BucketOwner;
use crate::partitioning::snapshot::{OwnerSummary, OwnershipSnapshot};
use crate::partitioning::transfer::BucketTransfer;
use crate::rebalancing::command::{BucketCommand, CommandBuilder, CommandKind};
use crate::rebalancing::{CommandListener, CommandListeners};
use crate::types::{Address, BucketNumber, StorageSlot, PRIMARY_SLOT};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observable state of one (slot, bucket) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned with no work in flight.
    Owned(Address),
    /// Owned by `owner` while its data is copied to `destination`.
    Transferring {
        owner: Address,
        destination: BucketTransfer,
    },
    /// Owned by `owner` while its data is copied in from `source`.
    Restoring {
        owner: Address,
        source: BucketTransfer,
    },
}

impl SlotState {
    /// The member currently responsible for the pair.
    pub fn owner(&self) -> Address {
        match self {
            SlotState::Owned(owner)
            | SlotState::Transferring { owner, .. }
            | SlotState::Restoring { owner, .. } => *owner,
        }
    }

    /// Whether any work is in flight.
    pub fn is_pending(&self) -> bool {
        !matches!(self, SlotState::Owned(_))
    }
}

/// The ownership table of one cache and the rebalancing protocol around it.
pub struct BucketOwnershipAssignment {
    pub(super) config: AssignmentConfig,

    /// Current owners, ordered by address.
    pub(super) owners: BTreeMap<Address, BucketOwner>,

    /// Owner of every bucket, indexed by `[slot][bucket]`.
    pub(super) table: Vec<Vec<Option<Address>>>,

    /// Slots `0..active_slots` are populated.
    pub(super) active_slots: usize,

    /// Replica buckets whose restore was rejected and must be re-issued.
    pub(super) unrestored: BTreeSet<(StorageSlot, BucketNumber)>,

    listeners: CommandListeners,
}

impl BucketOwnershipAssignment {
    /// Create an empty assignment.
    ///
    /// Fails if the configuration is invalid.
    pub fn new(config: AssignmentConfig) -> Result<Self> {
        config.validate()?;

        let table = vec![vec![None; config.bucket_count as usize]; config.slot_count()];

        info!(
            cache = %config.cache_name,
            bucket_count = config.bucket_count,
            replica_count = config.replica_count,
            "Created bucket ownership assignment"
        );

        Ok(Self {
            config,
            owners: BTreeMap::new(),
            table,
            active_slots: 0,
            unrestored: BTreeSet::new(),
            listeners: CommandListeners::new(),
        })
    }

    /// Append listeners that receive every command, in order.
    pub fn attach_listeners<I>(&mut self, listeners: I)
    where
        I: IntoIterator<Item = Arc<dyn CommandListener>>,
    {
        self.listeners.extend(listeners);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The configuration this assignment was built with.
    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    /// Cache name.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> u32 {
        self.config.bucket_count
    }

    /// Number of replica slots.
    pub fn replica_count(&self) -> u32 {
        self.config.replica_count
    }

    /// Number of populated slots. Replica slot `k` is populated once there
    /// are more than `k` owners to hold distinct copies.
    pub fn active_slot_count(&self) -> usize {
        self.active_slots
    }

    /// Owner of `bucket` in `slot`.
    ///
    /// Returns `None` when no owner exists yet or the arguments are out of
    /// range. Replica slot `k` is unowned until more than `k` owners exist
    /// and the slot has been populated by a repartition.
    pub fn get_owner(&self, slot: StorageSlot, bucket: BucketNumber) -> Option<Address> {
        if slot as usize >= self.active_slots {
            return None;
        }
        self.table[slot as usize]
            .get(bucket as usize)
            .copied()
            .flatten()
    }

    /// Full state of `bucket` in `slot`.
    pub fn slot_state(&self, slot: StorageSlot, bucket: BucketNumber) -> Option<SlotState> {
        let owner_address = self.get_owner(slot, bucket)?;
        let owner = self.owners.get(&owner_address)?;

        if let Some(destination) = owner.outbound(slot, bucket) {
            return Some(SlotState::Transferring {
                owner: owner_address,
                destination: *destination,
            });
        }
        if let Some(source) = owner.restore_source(slot, bucket) {
            return Some(SlotState::Restoring {
                owner: owner_address,
                source: *source,
            });
        }
        Some(SlotState::Owned(owner_address))
    }

    /// Buckets `address` owns in `slot`. Empty for unknown members.
    pub fn get_owned_buckets(&self, slot: StorageSlot, address: Address) -> BTreeSet<BucketNumber> {
        if !self.config.is_valid_slot(slot) {
            return BTreeSet::new();
        }
        self.owners
            .get(&address)
            .map(|owner| owner.owned_buckets(slot).clone())
            .unwrap_or_default()
    }

    /// Number of current owners.
    pub fn get_owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Ownership record of `address`.
    pub fn owner(&self, address: Address) -> Option<&BucketOwner> {
        self.owners.get(&address)
    }

    /// All ownership records, ordered by address.
    pub fn owners(&self) -> impl Iterator<Item = &BucketOwner> {
        self.owners.values()
    }

    /// Addresses of all current owners, ordered.
    pub fn owner_addresses(&self) -> Vec<Address> {
        self.owners.keys().copied().collect()
    }

    /// Whether `address` is a current owner.
    pub fn has_owner(&self, address: Address) -> bool {
        self.owners.contains_key(&address)
    }

    /// Largest per-slot share any owner holds in a balanced table of
    /// `owner_count` owners.
    pub fn max_owned_bucket_count(&self, owner_count: usize) -> usize {
        max_owned_bucket_count(self.config.bucket_count, owner_count)
    }

    /// Number of (slot, bucket) pairs with a transfer or restore in flight.
    pub fn pending_transfer_count(&self) -> usize {
        (0..self.active_slots as StorageSlot)
            .map(|slot| {
                self.owners
                    .values()
                    .map(|o| o.outbound_transfers(slot).count() + o.restores(slot).count())
                    .sum::<usize>()
            })
            .sum()
    }

    /// Whether no transfer or restore is in flight or waiting to be retried.
    pub fn is_quiescent(&self) -> bool {
        self.unrestored.is_empty() && self.owners.values().all(BucketOwner::is_quiescent)
    }

    /// Capture an immutable view of the table.
    pub fn snapshot(&self) -> OwnershipSnapshot {
        let owners = self
            .owners
            .values()
            .map(|owner| OwnerSummary {
                address: owner.address(),
                leaving: owner.is_leaving(),
                owned_counts: (0..self.config.slot_count() as StorageSlot)
                    .map(|slot| owner.owned_count(slot))
                    .collect(),
            })
            .collect();

        OwnershipSnapshot {
            cache_name: self.config.cache_name.clone(),
            bucket_count: self.config.bucket_count,
            replica_count: self.config.replica_count,
            active_slots: self.active_slots,
            pending_transfers: self.pending_transfer_count(),
            table: self.table[..self.active_slots].to_vec(),
            owners,
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Register a new owner.
    ///
    /// The first owner immediately receives every primary bucket; there is no
    /// data anywhere yet, so no command is needed. Later owners receive
    /// buckets through [`repartition`](Self::repartition). Adding a current
    /// owner is a no-op, except that it clears a pending leave.
    ///
    /// Returns true if a new owner was registered.
    pub fn add_owner(&mut self, address: Address) -> bool {
        if let Some(existing) = self.owners.get_mut(&address) {
            if existing.is_leaving() {
                existing.set_leaving(false);
                info!(cache = %self.config.cache_name, %address, "Owner rejoined before leaving");
            } else {
                debug!(cache = %self.config.cache_name, %address, "Owner already present");
            }
            return false;
        }

        let mut owner = BucketOwner::new(address, self.config.slot_count());

        if self.owners.is_empty() {
            for bucket in 0..self.config.bucket_count {
                owner.add_bucket(PRIMARY_SLOT, bucket);
                self.table[PRIMARY_SLOT as usize][bucket as usize] = Some(address);
            }
            self.active_slots = 1;
        }

        self.owners.insert(address, owner);

        info!(
            cache = %self.config.cache_name,
            %address,
            owner_count = self.owners.len(),
            "Added bucket owner"
        );
        true
    }

    /// Flag an owner as leaving. Subsequent repartitions drain its buckets to
    /// the remaining owners so that it can be removed without data loss.
    ///
    /// Returns false if `address` is not an owner.
    pub fn begin_leave(&mut self, address: Address) -> bool {
        match self.owners.get_mut(&address) {
            Some(owner) => {
                owner.set_leaving(true);
                info!(cache = %self.config.cache_name, %address, "Owner is leaving");
                true
            }
            None => {
                debug!(cache = %self.config.cache_name, %address, "Leave for unknown owner ignored");
                false
            }
        }
    }

    // =========================================================================
    // Transfer completion
    // =========================================================================

    /// Apply a completed transfer: `new_owner` takes over the named buckets.
    ///
    /// Buckets that are not pending exactly this transfer are skipped, so
    /// duplicate and late notices are harmless.
    pub fn finish_transfer<I>(
        &mut self,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        old_owner: Address,
        new_owner: Address,
        buckets: I,
    ) -> Vec<BucketCommand>
    where
        I: IntoIterator<Item = BucketNumber>,
    {
        let source = BucketTransfer::new(source_slot, old_owner);
        let destination = BucketTransfer::new(destination_slot, new_owner);
        let mut builder = CommandBuilder::new(&self.config.cache_name);
        let mut stale = 0usize;

        for bucket in buckets {
            if self.is_pending_transfer(source, destination, bucket) {
                self.complete_transfer(source, destination, bucket);
                builder.add(CommandKind::FinishTransfer, source, destination, bucket);
            } else {
                stale += 1;
            }
        }

        if stale > 0 {
            debug!(
                cache = %self.config.cache_name,
                %source,
                %destination,
                stale,
                "Ignored stale transfer completion"
            );
        }

        self.emit(builder, "finish_transfer")
    }

    /// Apply a completed replica restore. Stale notices are skipped.
    pub fn finish_replica_restore<I>(
        &mut self,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        source_owner: Address,
        destination_owner: Address,
        buckets: I,
    ) -> Vec<BucketCommand>
    where
        I: IntoIterator<Item = BucketNumber>,
    {
        let source = BucketTransfer::new(source_slot, source_owner);
        let destination = BucketTransfer::new(destination_slot, destination_owner);
        let mut builder = CommandBuilder::new(&self.config.cache_name);
        let mut stale = 0usize;

        for bucket in buckets {
            if self.is_pending_restore(source, destination, bucket) {
                self.clear_restore(destination, bucket);
                builder.add(CommandKind::FinishReplicaRestore, source, destination, bucket);
            } else {
                stale += 1;
            }
        }

        if stale > 0 {
            debug!(
                cache = %self.config.cache_name,
                %source,
                %destination,
                stale,
                "Ignored stale replica restore completion"
            );
        }

        self.emit(builder, "finish_replica_restore")
    }

    /// Abandon a failed transfer or restore.
    ///
    /// A rejected transfer leaves ownership with `old_owner`; a rejected
    /// restore leaves the replica with its holder and queues the bucket for
    /// another restore. Either way a `CancelTransfer` is emitted and the next
    /// repartition retries. Stale notices are skipped.
    pub fn reject_transfer<I>(
        &mut self,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        old_owner: Address,
        new_owner: Address,
        buckets: I,
    ) -> Vec<BucketCommand>
    where
        I: IntoIterator<Item = BucketNumber>,
    {
        let source = BucketTransfer::new(source_slot, old_owner);
        let destination = BucketTransfer::new(destination_slot, new_owner);
        let mut builder = CommandBuilder::new(&self.config.cache_name);
        let mut stale = 0usize;

        for bucket in buckets {
            if self.is_pending_transfer(source, destination, bucket) {
                self.abort_transfer(source, destination, bucket);
                builder.add(CommandKind::CancelTransfer, source, destination, bucket);
            } else if self.is_pending_restore(source, destination, bucket) {
                self.clear_restore(destination, bucket);
                self.unrestored.insert((destination_slot, bucket));
                builder.add(CommandKind::CancelTransfer, source, destination, bucket);
            } else {
                stale += 1;
            }
        }

        if stale > 0 {
            debug!(
                cache = %self.config.cache_name,
                %source,
                %destination,
                stale,
                "Ignored stale transfer rejection"
            );
        }
        if !builder.is_empty() {
            warn!(cache = %self.config.cache_name, %source, %destination, "Transfer rejected");
        }

        self.emit(builder, "reject_transfer")
    }

    // =========================================================================
    // Internal transitions
    // =========================================================================

    pub(super) fn slot_count(&self) -> usize {
        self.config.slot_count()
    }

    fn in_range(&self, slot: StorageSlot, bucket: BucketNumber) -> bool {
        (slot as usize) < self.active_slots && bucket < self.config.bucket_count
    }

    /// Whether `bucket` is pending exactly the transfer `source -> destination`.
    pub(super) fn is_pending_transfer(
        &self,
        source: BucketTransfer,
        destination: BucketTransfer,
        bucket: BucketNumber,
    ) -> bool {
        if !self.in_range(source.slot, bucket) || !self.in_range(destination.slot, bucket) {
            return false;
        }
        if self.table[source.slot as usize][bucket as usize] != Some(source.address) {
            return false;
        }
        let outbound_matches = self
            .owners
            .get(&source.address)
            .and_then(|o| o.outbound(source.slot, bucket))
            == Some(&destination);
        let inbound_matches = self
            .owners
            .get(&destination.address)
            .and_then(|o| o.inbound(destination.slot, bucket))
            == Some(&source);
        outbound_matches && inbound_matches
    }

    /// Whether `bucket` is pending exactly the restore `source -> destination`.
    pub(super) fn is_pending_restore(
        &self,
        source: BucketTransfer,
        destination: BucketTransfer,
        bucket: BucketNumber,
    ) -> bool {
        if !self.in_range(destination.slot, bucket) {
            return false;
        }
        if self.table[destination.slot as usize][bucket as usize] != Some(destination.address) {
            return false;
        }
        self.owners
            .get(&destination.address)
            .and_then(|o| o.restore_source(destination.slot, bucket))
            == Some(&source)
    }

    /// Record a transfer of `bucket` from `source` to `destination`.
    pub(super) fn start_transfer(
        &mut self,
        source: BucketTransfer,
        destination: BucketTransfer,
        bucket: BucketNumber,
    ) {
        if let Some(owner) = self.owners.get_mut(&source.address) {
            owner.begin_outbound(source.slot, bucket, destination);
        }
        if let Some(owner) = self.owners.get_mut(&destination.address) {
            owner.begin_inbound(destination.slot, bucket, source);
        }
    }

    /// Move ownership of a pending transfer to its destination.
    fn complete_transfer(
        &mut self,
        source: BucketTransfer,
        destination: BucketTransfer,
        bucket: BucketNumber,
    ) {
        if let Some(owner) = self.owners.get_mut(&source.address) {
            owner.take_outbound(source.slot, bucket);
            owner.remove_bucket(source.slot, bucket);
        }
        if let Some(owner) = self.owners.get_mut(&destination.address) {
            owner.take_inbound(destination.slot, bucket);
            owner.add_bucket(destination.slot, bucket);
        }
        self.table[source.slot as usize][bucket as usize] = None;
        self.table[destination.slot as usize][bucket as usize] = Some(destination.address);
    }

    /// Drop the bookkeeping of a pending transfer; ownership stays put.
    pub(super) fn abort_transfer(
        &mut self,
        source: BucketTransfer,
        destination: BucketTransfer,
        bucket: BucketNumber,
    ) {
        if let Some(owner) = self.owners.get_mut(&source.address) {
            owner.take_outbound(source.slot, bucket);
        }
        if let Some(owner) = self.owners.get_mut(&destination.address) {
            owner.take_inbound(destination.slot, bucket);
        }
    }

    /// Give `holder` ownership of `bucket` in replica `slot` and record the
    /// restore that fills it from `source`.
    pub(super) fn start_restore(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        holder: Address,
        source: BucketTransfer,
    ) {
        self.assign(slot, bucket, holder);
        if let Some(owner) = self.owners.get_mut(&holder) {
            owner.begin_restore(slot, bucket, source);
        }
        if let Some(owner) = self.owners.get_mut(&source.address) {
            owner.begin_outbound_replica(slot, bucket, BucketTransfer::new(slot, holder));
        }
    }

    /// Drop the restore marker of a replica held at `destination`.
    pub(super) fn clear_restore(&mut self, destination: BucketTransfer, bucket: BucketNumber) {
        let source = self
            .owners
            .get_mut(&destination.address)
            .and_then(|o| o.take_restore(destination.slot, bucket));
        if let Some(source) = source {
            if let Some(owner) = self.owners.get_mut(&source.address) {
                owner.take_outbound_replica(destination.slot, bucket);
            }
        }
    }

    pub(super) fn assign(&mut self, slot: StorageSlot, bucket: BucketNumber, address: Address) {
        if let Some(owner) = self.owners.get_mut(&address) {
            owner.add_bucket(slot, bucket);
        }
        self.table[slot as usize][bucket as usize] = Some(address);
    }

    /// Whether `address` holds, or is about to receive, a slot of `bucket`
    /// other than `slot`.
    pub(super) fn holds_other_slot(
        &self,
        address: Address,
        bucket: BucketNumber,
        slot: StorageSlot,
    ) -> bool {
        self.holds_other_slot_directly(address, bucket, slot)
            || self.pending_destination_slot(address, bucket, slot).is_some()
    }

    /// Whether `address` owns a slot of `bucket` other than `slot`.
    pub(super) fn holds_other_slot_directly(
        &self,
        address: Address,
        bucket: BucketNumber,
        slot: StorageSlot,
    ) -> bool {
        (0..self.active_slots as StorageSlot)
            .filter(|&other| other != slot)
            .any(|other| self.table[other as usize][bucket as usize] == Some(address))
    }

    /// A slot other than `slot` in which `address` is the destination of a
    /// pending transfer of `bucket`.
    pub(super) fn pending_destination_slot(
        &self,
        address: Address,
        bucket: BucketNumber,
        slot: StorageSlot,
    ) -> Option<StorageSlot> {
        (0..self.active_slots as StorageSlot)
            .filter(|&other| other != slot)
            .find(|&other| {
                self.owners
                    .get(&address)
                    .and_then(|o| o.inbound(other, bucket))
                    .is_some()
            })
    }

    /// Owners that targets are computed over: the ones not leaving, unless
    /// too few of them remain to hold a distinct copy for every active slot.
    /// Leavers can only be drained once enough owners stay.
    pub(super) fn target_owners(&self) -> Vec<Address> {
        let staying: Vec<Address> = self
            .owners
            .values()
            .filter(|o| !o.is_leaving())
            .map(BucketOwner::address)
            .collect();
        if staying.len() >= self.active_slots.max(1) {
            staying
        } else {
            self.owners.keys().copied().collect()
        }
    }

    /// Target share per owner in `slot`. Owners being drained are present
    /// with a target of 0.
    pub(super) fn slot_targets(&self, slot: StorageSlot) -> BTreeMap<Address, usize> {
        let mut targets = slot_target_shares(self.config.bucket_count, &self.target_owners(), slot);
        for address in self.owners.keys() {
            targets.entry(*address).or_insert(0);
        }
        targets
    }

    /// Target number of copies per owner across all active slots. Owners
    /// being drained are present with a target of 0.
    pub(super) fn total_targets(&self) -> BTreeMap<Address, usize> {
        let mut targets = total_target_shares(
            self.config.bucket_count,
            &self.target_owners(),
            self.active_slots,
        );
        for address in self.owners.keys() {
            targets.entry(*address).or_insert(0);
        }
        targets
    }

    /// Copies `address` holds across all active slots once pending work
    /// completes.
    pub(super) fn projected_total(&self, address: Address) -> usize {
        self.owners.get(&address).map_or(0, |owner| {
            (0..self.active_slots as StorageSlot)
                .map(|slot| owner.projected_count(slot))
                .sum()
        })
    }

    /// Whether `address` could take over a copy of `bucket`: it holds no
    /// slot of it and no slot of it is on its way in.
    pub(super) fn can_receive(&self, address: Address, bucket: BucketNumber) -> bool {
        let Some(owner) = self.owners.get(&address) else {
            return false;
        };
        (0..self.active_slots as StorageSlot).all(|slot| {
            self.table[slot as usize][bucket as usize] != Some(address)
                && owner.inbound(slot, bucket).is_none()
        })
    }

    /// Whether the copy of `bucket` that `address` holds in `slot` can be
    /// moved: it has complete data and no transfer or restore touches it.
    pub(super) fn is_movable(&self, address: Address, slot: StorageSlot, bucket: BucketNumber) -> bool {
        let Some(owner) = self.owners.get(&address) else {
            return false;
        };
        owner.is_idle(slot, bucket)
            && !self.unrestored.contains(&(slot, bucket))
            && (1..self.active_slots as StorageSlot)
                .all(|other| owner.outbound_replica(other, bucket).is_none())
    }

    /// Pick a new holder for `bucket` in `slot` among owners that do not own
    /// another slot of it.
    ///
    /// Preference: no pending transfer of the bucket toward the candidate,
    /// then not leaving, then the largest deficit against `targets`, then the
    /// lowest address. Returns the candidate and, if it is the destination
    /// of a pending transfer of another slot of the bucket, that slot.
    pub(super) fn choose_holder(
        &self,
        slot: StorageSlot,
        bucket: BucketNumber,
        targets: &BTreeMap<Address, usize>,
    ) -> Option<(Address, Option<StorageSlot>)> {
        self.owners
            .values()
            .filter(|o| !self.holds_other_slot_directly(o.address(), bucket, slot))
            .map(|o| {
                let conflict = self.pending_destination_slot(o.address(), bucket, slot);
                let target = targets.get(&o.address()).copied().unwrap_or(0) as i64;
                let deficit = target - o.projected_count(slot) as i64;
                (conflict.is_some(), o.is_leaving(), -deficit, o.address(), conflict)
            })
            .min_by(|a, b| (a.0, a.1, a.2, a.3).cmp(&(b.0, b.1, b.2, b.3)))
            .map(|(_, _, _, address, conflict)| (address, conflict))
    }

    /// Cancel the pending transfer of `bucket` in `slot` toward `destination`.
    pub(super) fn cancel_inbound(
        &mut self,
        destination: Address,
        slot: StorageSlot,
        bucket: BucketNumber,
        builder: &mut CommandBuilder,
    ) {
        let source = self
            .owners
            .get(&destination)
            .and_then(|o| o.inbound(slot, bucket))
            .copied();
        if let Some(source) = source {
            let destination = BucketTransfer::new(slot, destination);
            self.abort_transfer(source, destination, bucket);
            builder.add(CommandKind::CancelTransfer, source, destination, bucket);
        }
    }

    /// Build, log and deliver the commands of one mutating call.
    pub(super) fn emit(&self, builder: CommandBuilder, operation: &str) -> Vec<BucketCommand> {
        let commands = builder.build();
        if commands.is_empty() {
            return commands;
        }

        info!(
            cache = %self.config.cache_name,
            operation,
            commands = commands.len(),
            buckets = commands.iter().map(|c| c.batch().len()).sum::<usize>(),
            "Emitting bucket commands"
        );
        for command in &commands {
            debug!(%command, "Bucket command");
        }

        self.listeners.dispatch(&commands);
        commands
    }
}

impl std::fmt::Debug for BucketOwnershipAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketOwnershipAssignment")
            .field("cache_name", &self.config.cache_name)
            .field("bucket_count", &self.config.bucket_count)
            .field("replica_count", &self.config.replica_count)
            .field("owner_count", &self.owners.len())
            .field("active_slots", &self.active_slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn assignment(bucket_count: u32, replica_count: u32) -> BucketOwnershipAssignment {
        BucketOwnershipAssignment::new(
            AssignmentConfig::new("test")
                .with_bucket_count(bucket_count)
                .with_replica_count(replica_count),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_buckets_is_fatal() {
        let result =
            BucketOwnershipAssignment::new(AssignmentConfig::new("test").with_bucket_count(0));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_assignment() {
        let boa = assignment(16, 1);
        assert_eq!(boa.get_owner_count(), 0);
        assert_eq!(boa.get_owner(0, 0), None);
        assert_eq!(boa.active_slot_count(), 0);
        assert!(boa.is_quiescent());
    }

    #[test]
    fn test_first_owner_takes_every_primary() {
        let mut boa = assignment(16, 1);
        assert!(boa.add_owner(addr(7001)));

        assert_eq!(boa.get_owner_count(), 1);
        assert_eq!(boa.active_slot_count(), 1);
        for bucket in 0..16 {
            assert_eq!(boa.get_owner(0, bucket), Some(addr(7001)));
            assert_eq!(boa.slot_state(0, bucket), Some(SlotState::Owned(addr(7001))));
            // A single member cannot hold a distinct replica.
            assert_eq!(boa.get_owner(1, bucket), None);
        }
        assert_eq!(boa.get_owned_buckets(0, addr(7001)).len(), 16);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let mut boa = assignment(16, 0);
        assert!(boa.add_owner(addr(7001)));
        assert!(!boa.add_owner(addr(7001)));
        assert_eq!(boa.get_owner_count(), 1);
        assert_eq!(boa.get_owned_buckets(0, addr(7001)).len(), 16);
    }

    #[test]
    fn test_readd_clears_leaving() {
        let mut boa = assignment(16, 0);
        boa.add_owner(addr(7001));
        assert!(boa.begin_leave(addr(7001)));
        assert!(boa.owner(addr(7001)).unwrap().is_leaving());

        boa.add_owner(addr(7001));
        assert!(!boa.owner(addr(7001)).unwrap().is_leaving());
        assert!(!boa.begin_leave(addr(7999)));
    }

    #[test]
    fn test_out_of_range_queries() {
        let mut boa = assignment(16, 0);
        boa.add_owner(addr(7001));
        assert_eq!(boa.get_owner(0, 16), None);
        assert_eq!(boa.get_owner(1, 0), None);
        assert!(boa.get_owned_buckets(5, addr(7001)).is_empty());
        assert!(boa.get_owned_buckets(0, addr(7999)).is_empty());
    }

    #[test]
    fn test_finish_unknown_transfer_is_noop() {
        let mut boa = assignment(16, 0);
        boa.add_owner(addr(7001));
        boa.add_owner(addr(7002));

        let commands = boa.finish_transfer(0, 0, addr(7001), addr(7002), [1, 2, 3]);
        assert!(commands.is_empty());
        assert_eq!(boa.get_owned_buckets(0, addr(7001)).len(), 16);

        let commands = boa.reject_transfer(0, 0, addr(7001), addr(7002), [1, 99]);
        assert!(commands.is_empty());
        assert!(boa.is_quiescent());
    }

    #[test]
    fn test_max_owned_bucket_count() {
        let boa = assignment(2051, 0);
        assert_eq!(boa.max_owned_bucket_count(1), 2051);
        assert_eq!(boa.max_owned_bucket_count(3), 684);
    }

    #[test]
    fn test_targets_exclude_leaving() {
        let mut boa = assignment(10, 0);
        boa.add_owner(addr(7001));
        boa.add_owner(addr(7002));
        boa.add_owner(addr(7003));
        boa.begin_leave(addr(7002));

        let targets = boa.slot_targets(0);
        assert_eq!(targets[&addr(7001)], 5);
        assert_eq!(targets[&addr(7002)], 0);
        assert_eq!(targets[&addr(7003)], 5);
        assert_eq!(boa.total_targets()[&addr(7002)], 0);
    }

    #[test]
    fn test_leavers_keep_targets_without_enough_stayers() {
        let mut boa = assignment(10, 1);
        boa.add_owner(addr(7001));
        boa.add_owner(addr(7002));
        boa.active_slots = 2;
        boa.begin_leave(addr(7002));

        // One staying owner cannot hold two distinct copies of a bucket.
        let targets = boa.total_targets();
        assert_eq!(targets[&addr(7001)], 10);
        assert_eq!(targets[&addr(7002)], 10);
    }

    #[test]
    fn test_can_receive_checks_every_slot() {
        let mut boa = assignment(4, 1);
        boa.add_owner(addr(7001));
        boa.add_owner(addr(7002));
        boa.add_owner(addr(7003));
        boa.active_slots = 2;
        boa.assign(1, 0, addr(7002));

        assert!(!boa.can_receive(addr(7001), 0));
        assert!(!boa.can_receive(addr(7002), 0));
        assert!(boa.can_receive(addr(7003), 0));
        assert!(!boa.can_receive(addr(7999), 0));

        boa.start_transfer(
            BucketTransfer::new(0, addr(7001)),
            BucketTransfer::new(0, addr(7003)),
            1,
        );
        assert!(!boa.can_receive(addr(7003), 1));
        assert!(!boa.is_movable(addr(7001), 0, 1));
        assert!(boa.is_movable(addr(7001), 0, 2));
    }

    #[test]
    fn test_snapshot_reflects_table() {
        let mut boa = assignment(8, 0);
        boa.add_owner(addr(7001));
        let snapshot = boa.snapshot();
        assert_eq!(snapshot.get_owner(0, 3), Some(addr(7001)));
        assert_eq!(snapshot.get_owner_count(), 1);
        assert_eq!(snapshot.pending_transfers, 0);
    }
}
