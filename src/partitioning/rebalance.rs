//! Repartitioning: diff the current table against the target shares and
//! emit the commands that close the gap.
//!
//! Balancing runs in two stages. Copies first move between owners until
//! every owner holds its target number of copies across all active slots.
//! Once nothing is in flight, owners then swap slot labels on buckets they
//! already hold so that every slot is evenly spread; this moves no data.

use crate::partitioning::assignment::BucketOwnershipAssignment;
use crate::partitioning::distribution::home_layout;
use crate::partitioning::transfer::BucketTransfer;
use crate::rebalancing::command::{BucketCommand, CommandBuilder, CommandKind};
use crate::types::{Address, BucketNumber, StorageSlot, PRIMARY_SLOT};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// The copy of `bucket` in `slot` moving from `source` to `destination`.
#[derive(Debug, Clone, Copy)]
struct Hop {
    source: Address,
    destination: Address,
    slot: StorageSlot,
    bucket: BucketNumber,
}

impl BucketOwnershipAssignment {
    /// Recompute target shares and emit the commands needed to reach them.
    ///
    /// Ownership does not change here, except for slot swaps between copies
    /// an owner already holds; transfers take effect when finished. Buckets
    /// with work in flight are never re-selected, so calling this again
    /// before transfers complete emits nothing new. Each call:
    ///
    /// 1. re-issues replica restores that were rejected,
    /// 2. moves copies from owners above their total share to owners below
    ///    it, directly or along a chain of owners,
    /// 3. when nothing is in flight, swaps slots between the holders of a
    ///    bucket until every owner's copies are spread evenly over the slots,
    /// 4. when the table is balanced and quiescent, populates the next
    ///    replica slot that enough owners exist for.
    ///
    /// The settled table depends only on the owner set, not on the order in
    /// which owners joined.
    pub fn repartition(&mut self) -> Vec<BucketCommand> {
        let mut builder = CommandBuilder::new(&self.config.cache_name);

        if self.owners.is_empty() {
            debug!(cache = %self.config.cache_name, "Repartition skipped, no owners");
            return Vec::new();
        }

        self.retry_restores(&mut builder);

        let targets = self.total_targets();
        self.balance_totals(&targets, &mut builder);
        self.balance_chains(&targets, &mut builder);

        if builder.is_empty() && self.is_quiescent() {
            self.balance_slots(&mut builder);
        }
        if builder.is_empty() && self.is_quiescent() {
            self.activate_replica_slot(&mut builder);
        }

        self.emit(builder, "repartition")
    }

    /// Re-issue restores for replicas whose previous restore was rejected.
    fn retry_restores(&mut self, builder: &mut CommandBuilder) {
        let pending: Vec<(StorageSlot, BucketNumber)> = std::mem::take(&mut self.unrestored)
            .into_iter()
            .collect();

        for (slot, bucket) in pending {
            let holder = self.table[slot as usize][bucket as usize];
            let primary = self.table[PRIMARY_SLOT as usize][bucket as usize];
            match (holder, primary) {
                (Some(holder), Some(primary)) if holder != primary => {
                    let source = BucketTransfer::new(PRIMARY_SLOT, primary);
                    self.restore_into_holder(slot, bucket, holder, source);
                    builder.add(
                        CommandKind::BeginReplicaRestore,
                        source,
                        BucketTransfer::new(slot, holder),
                        bucket,
                    );
                }
                _ => {
                    warn!(
                        cache = %self.config.cache_name,
                        slot,
                        bucket,
                        "Cannot retry replica restore, no distinct source"
                    );
                    self.unrestored.insert((slot, bucket));
                }
            }
        }
    }

    /// Record a restore into a replica `holder` that already owns the bucket.
    pub(super) fn restore_into_holder(
        &mut self,
        slot: StorageSlot,
        bucket: BucketNumber,
        holder: Address,
        source: BucketTransfer,
    ) {
        if let Some(owner) = self.owners.get_mut(&holder) {
            owner.begin_restore(slot, bucket, source);
        }
        if let Some(owner) = self.owners.get_mut(&source.address) {
            owner.begin_outbound_replica(slot, bucket, BucketTransfer::new(slot, holder));
        }
    }

    fn excess(&self, address: Address, targets: &BTreeMap<Address, usize>) -> usize {
        let target = targets.get(&address).copied().unwrap_or(0);
        self.projected_total(address).saturating_sub(target)
    }

    fn deficit(&self, address: Address, targets: &BTreeMap<Address, usize>) -> usize {
        let target = targets.get(&address).copied().unwrap_or(0);
        target.saturating_sub(self.projected_total(address))
    }

    // =========================================================================
    // Copies per owner
    // =========================================================================

    /// Move copies from donors straight to receivers.
    ///
    /// Donors and receivers are paired in address order. A receiver takes
    /// the primaries of its home range first, so starting from one owner
    /// the primaries land in contiguous ranges whatever the join order.
    fn balance_totals(&mut self, targets: &BTreeMap<Address, usize>, builder: &mut CommandBuilder) {
        let donors: Vec<Address> = self
            .owners
            .keys()
            .copied()
            .filter(|a| self.excess(*a, targets) > 0)
            .collect();
        let receivers: Vec<Address> = self
            .owners
            .keys()
            .copied()
            .filter(|a| self.deficit(*a, targets) > 0)
            .collect();
        if donors.is_empty() || receivers.is_empty() {
            return;
        }

        let home = home_layout(self.config.bucket_count, &self.target_owners());
        let mut moved = 0usize;
        for donor in &donors {
            for receiver in &receivers {
                let limit = self.excess(*donor, targets).min(self.deficit(*receiver, targets));
                if limit > 0 {
                    moved += self.move_copies(*donor, *receiver, limit, &home, builder);
                }
            }
        }

        if moved > 0 {
            debug!(cache = %self.config.cache_name, moved, "Scheduled bucket transfers");
        }
    }

    /// Move up to `limit` copies from `donor` to `receiver`, keeping each in
    /// its slot. Returns the number moved.
    fn move_copies(
        &mut self,
        donor: Address,
        receiver: Address,
        limit: usize,
        home: &[Address],
        builder: &mut CommandBuilder,
    ) -> usize {
        let mut moved = 0;
        for slot in self.donor_slot_order(donor, receiver) {
            let mut candidates: Vec<BucketNumber> = match self.owners.get(&donor) {
                Some(owner) => owner.owned_buckets(slot).iter().rev().copied().collect(),
                None => return moved,
            };
            if slot == PRIMARY_SLOT {
                candidates.sort_by_key(|b| home.get(*b as usize) != Some(&receiver));
            }

            for bucket in candidates {
                if moved == limit {
                    return moved;
                }
                if self.is_movable(donor, slot, bucket) && self.can_receive(receiver, bucket) {
                    self.apply_hop(
                        Hop {
                            source: donor,
                            destination: receiver,
                            slot,
                            bucket,
                        },
                        builder,
                    );
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Active slots, those where `donor` is furthest ahead of `receiver`
    /// first.
    fn donor_slot_order(&self, donor: Address, receiver: Address) -> Vec<StorageSlot> {
        let count = |address: Address, slot: StorageSlot| {
            self.owners
                .get(&address)
                .map_or(0, |o| o.projected_count(slot)) as i64
        };
        let mut slots: Vec<StorageSlot> = (0..self.active_slots as StorageSlot).collect();
        slots.sort_by_key(|&slot| (Reverse(count(donor, slot) - count(receiver, slot)), slot));
        slots
    }

    /// Move copies along chains of owners when no donor can hand a copy
    /// straight to a receiver. Every owner on a chain passes one copy on.
    fn balance_chains(&mut self, targets: &BTreeMap<Address, usize>, builder: &mut CommandBuilder) {
        let mut chains = 0usize;
        while let Some(chain) = self.find_chain(targets) {
            for hop in chain {
                if !self.is_movable(hop.source, hop.slot, hop.bucket)
                    || !self.can_receive(hop.destination, hop.bucket)
                {
                    warn!(
                        cache = %self.config.cache_name,
                        source = %hop.source,
                        destination = %hop.destination,
                        bucket = hop.bucket,
                        "Transfer chain went stale"
                    );
                    return;
                }
                self.apply_hop(hop, builder);
            }
            chains += 1;
        }

        if chains > 0 {
            debug!(cache = %self.config.cache_name, chains, "Scheduled chained transfers");
        }
    }

    /// Shortest chain of hops from an owner with excess to an owner with a
    /// deficit. Owners with no share of their own are never intermediates.
    fn find_chain(&self, targets: &BTreeMap<Address, usize>) -> Option<Vec<Hop>> {
        let mut visited: BTreeSet<Address> = BTreeSet::new();
        let mut queue: VecDeque<Address> = VecDeque::new();
        for address in self.owners.keys() {
            if self.excess(*address, targets) > 0 {
                visited.insert(*address);
                queue.push_back(*address);
            }
        }
        if queue.is_empty() {
            return None;
        }

        let mut parent: BTreeMap<Address, Hop> = BTreeMap::new();
        while let Some(current) = queue.pop_front() {
            for next in self.owners.keys().copied() {
                if visited.contains(&next) || targets.get(&next).copied().unwrap_or(0) == 0 {
                    continue;
                }
                let Some((slot, bucket)) = self.first_movable_copy(current, next) else {
                    continue;
                };
                visited.insert(next);
                parent.insert(
                    next,
                    Hop {
                        source: current,
                        destination: next,
                        slot,
                        bucket,
                    },
                );

                if self.deficit(next, targets) > 0 {
                    let mut chain = Vec::new();
                    let mut node = next;
                    while let Some(hop) = parent.get(&node) {
                        chain.push(*hop);
                        node = hop.source;
                    }
                    chain.reverse();
                    return Some(chain);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// A copy held by `source` that `destination` could take over.
    fn first_movable_copy(
        &self,
        source: Address,
        destination: Address,
    ) -> Option<(StorageSlot, BucketNumber)> {
        let owner = self.owners.get(&source)?;
        (0..self.active_slots as StorageSlot).find_map(|slot| {
            owner
                .owned_buckets(slot)
                .iter()
                .rev()
                .copied()
                .find(|b| self.is_movable(source, slot, *b) && self.can_receive(destination, *b))
                .map(|b| (slot, b))
        })
    }

    fn apply_hop(&mut self, hop: Hop, builder: &mut CommandBuilder) {
        let source = BucketTransfer::new(hop.slot, hop.source);
        let destination = BucketTransfer::new(hop.slot, hop.destination);
        self.start_transfer(source, destination, hop.bucket);
        builder.add(CommandKind::BeginTransfer, source, destination, hop.bucket);
    }

    // =========================================================================
    // Copies per slot
    // =========================================================================

    /// Spread every owner's copies evenly over the active slots.
    ///
    /// While some owner holds at least two more copies in a heavy slot than
    /// in a light one, walk from it along buckets: take one of the current
    /// owner's heavy-slot buckets and continue at that bucket's light-slot
    /// holder, until an owner has no heavy-slot bucket left. Swapping the
    /// two holders of every bucket on the walk moves one copy from the heavy
    /// to the light slot for the first owner, and leaves every owner in
    /// between unchanged. Only runs when nothing is in flight.
    fn balance_slots(&mut self, builder: &mut CommandBuilder) {
        if self.active_slots < 2 {
            return;
        }

        let limit = self.config.bucket_count as usize * self.active_slots * self.owners.len();
        let mut swapped = 0usize;
        let mut walks = 0usize;
        while let Some((start, heavy, light)) = self.uneven_owner() {
            if walks == limit {
                warn!(cache = %self.config.cache_name, walks, "Slot balancing stopped early");
                break;
            }
            swapped += self.swap_along_walk(start, heavy, light, builder);
            walks += 1;
        }

        if swapped > 0 {
            debug!(cache = %self.config.cache_name, walks, swapped, "Swapped bucket slots");
        }
    }

    /// First owner whose copies are uneven across slots, with its heaviest
    /// and lightest slot.
    fn uneven_owner(&self) -> Option<(Address, StorageSlot, StorageSlot)> {
        self.owners.values().find_map(|owner| {
            let counts: Vec<(usize, StorageSlot)> = (0..self.active_slots as StorageSlot)
                .map(|slot| (owner.owned_count(slot), slot))
                .collect();
            let heavy = counts.iter().max_by_key(|(count, slot)| (*count, Reverse(*slot)))?;
            let light = counts.iter().min_by_key(|(count, slot)| (*count, *slot))?;
            (heavy.0 >= light.0 + 2).then_some((owner.address(), heavy.1, light.1))
        })
    }

    fn swap_along_walk(
        &mut self,
        start: Address,
        heavy: StorageSlot,
        light: StorageSlot,
        builder: &mut CommandBuilder,
    ) -> usize {
        // A single swap is enough when the other holder leans the other way.
        let direct = self.owners.get(&start).and_then(|owner| {
            owner.owned_buckets(heavy).iter().rev().copied().find(|b| {
                self.table[light as usize][*b as usize]
                    .and_then(|holder| self.owners.get(&holder))
                    .is_some_and(|holder| holder.owned_count(light) > holder.owned_count(heavy))
            })
        });
        if let Some(bucket) = direct {
            self.swap_slots(bucket, heavy, light, builder);
            return 1;
        }

        let mut unused: BTreeMap<Address, Vec<BucketNumber>> = self
            .owners
            .values()
            .map(|o| (o.address(), o.owned_buckets(heavy).iter().copied().collect()))
            .collect();

        let mut walk = Vec::new();
        let mut current = start;
        while let Some(bucket) = unused.get_mut(&current).and_then(Vec::pop) {
            let Some(next) = self.table[light as usize][bucket as usize] else {
                break;
            };
            walk.push(bucket);
            current = next;
        }

        for bucket in &walk {
            self.swap_slots(*bucket, heavy, light, builder);
        }
        walk.len()
    }

    /// Exchange the holders of `bucket` in slots `a` and `b`. Both holders
    /// already have the data and re-file it under the other slot.
    fn swap_slots(
        &mut self,
        bucket: BucketNumber,
        a: StorageSlot,
        b: StorageSlot,
        builder: &mut CommandBuilder,
    ) {
        let index = bucket as usize;
        let (Some(holder_a), Some(holder_b)) =
            (self.table[a as usize][index], self.table[b as usize][index])
        else {
            return;
        };

        if let Some(owner) = self.owners.get_mut(&holder_a) {
            owner.remove_bucket(a, bucket);
            owner.add_bucket(b, bucket);
        }
        if let Some(owner) = self.owners.get_mut(&holder_b) {
            owner.remove_bucket(b, bucket);
            owner.add_bucket(a, bucket);
        }
        self.table[a as usize][index] = Some(holder_b);
        self.table[b as usize][index] = Some(holder_a);

        builder.add(
            CommandKind::RestoreBucket,
            BucketTransfer::new(a, holder_a),
            BucketTransfer::new(b, holder_a),
            bucket,
        );
        builder.add(
            CommandKind::RestoreBucket,
            BucketTransfer::new(b, holder_b),
            BucketTransfer::new(a, holder_b),
            bucket,
        );
    }

    // =========================================================================
    // Replica slots
    // =========================================================================

    /// Populate the next replica slot once there are enough owners for it.
    ///
    /// Every bucket gets a holder that owns no other slot of it, chosen by
    /// largest deficit. Holders own the replica immediately and are filled
    /// from the primary by a restore.
    fn activate_replica_slot(&mut self, builder: &mut CommandBuilder) {
        if self.active_slots >= self.slot_count() || self.owners.len() <= self.active_slots {
            return;
        }
        let slot = self.active_slots as StorageSlot;

        // Temporarily widen the active range so placement sees the new slot.
        self.active_slots += 1;
        let targets = self.slot_targets(slot);

        let mut placed: Vec<(BucketNumber, Address, Address)> = Vec::new();
        for bucket in 0..self.config.bucket_count {
            let Some(primary) = self.table[PRIMARY_SLOT as usize][bucket as usize] else {
                break;
            };
            match self.choose_holder(slot, bucket, &targets) {
                Some((holder, None)) => {
                    // Account for the placement so later buckets see it.
                    self.assign(slot, bucket, holder);
                    placed.push((bucket, holder, primary));
                }
                _ => break,
            }
        }

        if placed.len() != self.config.bucket_count as usize {
            warn!(
                cache = %self.config.cache_name,
                slot,
                placed = placed.len(),
                "Replica slot activation deferred, not every bucket has a distinct holder"
            );
            for (bucket, holder, _) in placed {
                if let Some(owner) = self.owners.get_mut(&holder) {
                    owner.remove_bucket(slot, bucket);
                }
                self.table[slot as usize][bucket as usize] = None;
            }
            self.active_slots -= 1;
            return;
        }

        for (bucket, holder, primary) in placed {
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
            slot,
            owner_count = self.owners.len(),
            "Activated replica slot"
        );
    }
}
