//! Pure bucket distribution calculations.
//!
//! Everything here is a function of its arguments only. In particular the
//! target shares depend on the owner *set*, never on the order owners joined.

use crate::types::{Address, BucketNumber, StorageSlot, PRIMARY_SLOT};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Calculate each owner's target bucket count for the primary slot.
///
/// Owners are sorted by address. Every owner gets `bucket_count / n`
/// buckets and the first `bucket_count % n` owners in that order get one
/// more. Duplicates are ignored.
///
/// Growing the owner set never raises an existing owner's share above what
/// it held under the smaller set, so adding a member only ever moves buckets
/// toward the new member.
///
/// # Examples
///
/// ```
/// use bucket_ownership::partitioning::target_shares;
///
/// let a = "127.0.0.1:7001".parse().unwrap();
/// let b = "127.0.0.1:7002".parse().unwrap();
/// let shares = target_shares(2051, &[b, a]);
/// assert_eq!(shares[&a], 1026);
/// assert_eq!(shares[&b], 1025);
/// ```
pub fn target_shares(bucket_count: u32, owners: &[Address]) -> BTreeMap<Address, usize> {
    slot_target_shares(bucket_count, owners, PRIMARY_SLOT)
}

/// Calculate each owner's target bucket count for `slot`.
///
/// Same as [`target_shares`], except that the owners receiving the
/// remainder rotate by `bucket_count % n` positions per slot. Across
/// `k <= n` slots no owner is asked for more than one copy of every bucket,
/// which a table of `n` owners holding `k` distinct copies can satisfy.
///
/// # Examples
///
/// ```
/// use bucket_ownership::partitioning::slot_target_shares;
///
/// let owners: Vec<_> = (7001..=7003)
///     .map(|p| format!("127.0.0.1:{}", p).parse().unwrap())
///     .collect();
/// let primary = slot_target_shares(10, &owners, 0);
/// let replica = slot_target_shares(10, &owners, 1);
/// assert_eq!(primary[&owners[0]], 4);
/// assert_eq!(replica[&owners[0]], 3);
/// assert_eq!(replica[&owners[1]], 4);
/// ```
pub fn slot_target_shares(
    bucket_count: u32,
    owners: &[Address],
    slot: StorageSlot,
) -> BTreeMap<Address, usize> {
    let sorted = sorted_owners(owners);
    if sorted.is_empty() {
        return BTreeMap::new();
    }

    let n = sorted.len();
    let base = bucket_count as usize / n;
    let remainder = bucket_count as usize % n;
    let offset = (slot as usize % n) * remainder % n;

    sorted
        .into_iter()
        .enumerate()
        .map(|(rank, address)| {
            let extra = if (rank + n - offset) % n < remainder { 1 } else { 0 };
            (address, base + extra)
        })
        .collect()
}

/// Sum of the per-slot targets of slots `0..slot_count`.
pub fn total_target_shares(
    bucket_count: u32,
    owners: &[Address],
    slot_count: usize,
) -> BTreeMap<Address, usize> {
    let mut totals = BTreeMap::new();
    for slot in 0..slot_count as StorageSlot {
        for (address, share) in slot_target_shares(bucket_count, owners, slot) {
            *totals.entry(address).or_insert(0) += share;
        }
    }
    totals
}

/// Canonical primary layout: owners in address order hold contiguous bucket
/// ranges sized by [`target_shares`]. Entry `b` is the home of bucket `b`.
///
/// Balancing prefers to hand a bucket to its home, so a table built from a
/// single owner ends up in this layout whichever owner came first.
pub fn home_layout(bucket_count: u32, owners: &[Address]) -> Vec<Address> {
    let shares = target_shares(bucket_count, owners);
    let mut layout = Vec::with_capacity(bucket_count as usize);
    for (address, share) in shares {
        layout.extend(std::iter::repeat(address).take(share));
    }
    layout
}

fn sorted_owners(owners: &[Address]) -> Vec<Address> {
    let mut sorted: Vec<Address> = owners.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// Largest number of buckets any single owner holds in one slot of a
/// balanced table with `owner_count` owners.
///
/// # Examples
///
/// ```
/// use bucket_ownership::partitioning::max_owned_bucket_count;
///
/// assert_eq!(max_owned_bucket_count(2051, 3), 684);
/// assert_eq!(max_owned_bucket_count(2051, 1), 2051);
/// ```
pub fn max_owned_bucket_count(bucket_count: u32, owner_count: usize) -> usize {
    if owner_count == 0 {
        return bucket_count as usize;
    }
    (bucket_count as usize).div_ceil(owner_count)
}

/// Map a key onto a bucket.
pub fn bucket_for_key(key: &[u8], bucket_count: u32) -> BucketNumber {
    debug_assert!(bucket_count > 0, "bucket count must be positive");
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    (hasher.finish() % bucket_count.max(1) as u64) as BucketNumber
}
