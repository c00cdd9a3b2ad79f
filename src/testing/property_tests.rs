//! Randomized membership churn.
//!
//! Seeded random sequences of joins, leaves, failures, repartitions and
//! transport outcomes (finish, reject, or never answered). The table must
//! satisfy its invariants after every single step, not only at the end.

#[cfg(test)]
mod tests {
    use crate::config::AssignmentConfig;
    use crate::partitioning::BucketOwnershipAssignment;
    use crate::rebalancing::{BucketCommand, CommandKind};
    use crate::testing::{addr, TransferDriver};
    use crate::types::{Address, StorageSlot};
    use rand::rngs::StdRng;
    use rand::seq::IndexedRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn check_invariants(boa: &BucketOwnershipAssignment, step: usize) {
        let active = boa.active_slot_count();
        if boa.get_owner_count() == 0 {
            assert_eq!(active, 0, "step {}", step);
            return;
        }
        assert!(active >= 1, "step {}", step);
        assert!(active <= boa.get_owner_count(), "step {}", step);

        for slot in 0..active as StorageSlot {
            let total: usize = boa.owners().map(|o| o.owned_count(slot)).sum();
            assert_eq!(total, boa.bucket_count() as usize, "step {} slot {}", step, slot);
        }

        for bucket in 0..boa.bucket_count() {
            let mut holders = BTreeSet::new();
            for slot in 0..active as StorageSlot {
                let owner = boa
                    .get_owner(slot, bucket)
                    .unwrap_or_else(|| panic!("step {} slot {} bucket {} unowned", step, slot, bucket));
                assert!(boa.has_owner(owner), "step {}", step);
                assert!(
                    boa.owner(owner).unwrap().owns(slot, bucket),
                    "step {} table and owner disagree",
                    step
                );
                holders.insert(owner);
            }
            assert_eq!(holders.len(), active, "step {} bucket {} shares a holder", step, bucket);
        }
    }

    /// Every slot of a settled table is spread evenly: each owner holds
    /// `floor(B/N)` or `ceil(B/N)` buckets of it and drained leavers none.
    fn check_balanced(boa: &BucketOwnershipAssignment, seed: u64) {
        let staying: BTreeSet<Address> = boa
            .owners()
            .filter(|o| !o.is_leaving())
            .map(|o| o.address())
            .collect();
        let eligible = if staying.len() >= boa.active_slot_count().max(1) {
            staying
        } else {
            boa.owner_addresses().into_iter().collect()
        };
        let floor = boa.bucket_count() as usize / eligible.len();
        let ceil = floor + usize::from(boa.bucket_count() as usize % eligible.len() != 0);

        for slot in 0..boa.active_slot_count() as StorageSlot {
            for owner in boa.owners() {
                let count = owner.owned_count(slot);
                if eligible.contains(&owner.address()) {
                    assert!(
                        count == floor || count == ceil,
                        "seed {} slot {} owner {} holds {}",
                        seed,
                        slot,
                        owner.address(),
                        count
                    );
                } else {
                    assert_eq!(count, 0, "seed {} slot {} leaver {}", seed, slot, owner.address());
                }
            }
        }
    }

    fn run_churn(seed: u64, bucket_count: u32, replica_count: u32, steps: usize) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut boa = BucketOwnershipAssignment::new(
            AssignmentConfig::new("churn")
                .with_bucket_count(bucket_count)
                .with_replica_count(replica_count),
        )
        .unwrap();

        let pool: Vec<Address> = (7001..=7008).map(addr).collect();
        let mut outstanding: Vec<BucketCommand> = Vec::new();

        for step in 0..steps {
            let members = boa.owner_addresses();
            let produced = match rng.random_range(0..10) {
                0 | 1 => {
                    let candidate = *pool.choose(&mut rng).unwrap();
                    boa.add_owner(candidate);
                    Vec::new()
                }
                2 => match members.choose(&mut rng) {
                    Some(member) => boa.remove_owners([*member]),
                    None => Vec::new(),
                },
                3 => {
                    if let Some(member) = members.choose(&mut rng) {
                        boa.begin_leave(*member);
                    }
                    Vec::new()
                }
                4 | 5 => boa.repartition(),
                6 | 7 | 8 if !outstanding.is_empty() => {
                    let index = rng.random_range(0..outstanding.len());
                    let command = outstanding.swap_remove(index);
                    let batch = command.batch();
                    let buckets = batch.buckets.iter().copied();
                    match command.kind() {
                        CommandKind::BeginTransfer => boa.finish_transfer(
                            batch.source_slot,
                            batch.destination_slot,
                            batch.source,
                            batch.destination,
                            buckets,
                        ),
                        _ => boa.finish_replica_restore(
                            batch.source_slot,
                            batch.destination_slot,
                            batch.source,
                            batch.destination,
                            buckets,
                        ),
                    }
                }
                9 if !outstanding.is_empty() => {
                    let index = rng.random_range(0..outstanding.len());
                    let command = outstanding.swap_remove(index);
                    let batch = command.batch();
                    boa.reject_transfer(
                        batch.source_slot,
                        batch.destination_slot,
                        batch.source,
                        batch.destination,
                        batch.buckets.iter().copied(),
                    )
                }
                _ => boa.repartition(),
            };

            outstanding.extend(produced.into_iter().filter(|c| {
                matches!(
                    c.kind(),
                    CommandKind::BeginTransfer | CommandKind::BeginReplicaRestore
                )
            }));
            check_invariants(&boa, step);
        }

        // Let the transport catch up; the table must settle.
        TransferDriver::new().converge(&mut boa);
        check_invariants(&boa, steps);
        assert!(boa.is_quiescent());
        assert!(boa.repartition().is_empty());
        if boa.get_owner_count() > 0 {
            check_balanced(&boa, seed);
        }
    }

    #[test]
    fn test_churn_without_replicas() {
        for seed in 0..8 {
            run_churn(seed, 97, 0, 300);
        }
    }

    #[test]
    fn test_churn_with_one_replica() {
        for seed in 100..108 {
            run_churn(seed, 97, 1, 300);
        }
    }

    #[test]
    fn test_churn_with_two_replicas() {
        for seed in 200..208 {
            run_churn(seed, 64, 2, 300);
        }
    }

    #[test]
    fn test_churn_with_two_replicas_uneven_buckets() {
        for seed in 300..306 {
            run_churn(seed, 2051, 2, 120);
        }
    }
}
