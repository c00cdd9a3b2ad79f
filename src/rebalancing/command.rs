//! Commands emitted by the bucket ownership assignment.
//!
//! Commands are transient: they are created by a mutating call, delivered
//! once to every attached listener, and not retained afterwards. The data
//! transport acts on them and reports back through `finish_transfer`,
//! `finish_replica_restore` or `reject_transfer`.

use crate::partitioning::BucketTransfer;
use crate::types::{Address, BucketNumber, StorageSlot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The bucket set and endpoints a command applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBatch {
    /// Cache the buckets belong to.
    pub cache_name: String,
    /// Slot the data is read from.
    pub source_slot: StorageSlot,
    /// Slot the data is written to.
    pub destination_slot: StorageSlot,
    /// Member the data is read from.
    pub source: Address,
    /// Member the data is written to.
    pub destination: Address,
    /// Bucket numbers covered by the command.
    pub buckets: BTreeSet<BucketNumber>,
}

impl BucketBatch {
    /// Create an empty batch between two endpoints.
    pub fn new(cache_name: impl Into<String>, source: BucketTransfer, destination: BucketTransfer) -> Self {
        Self {
            cache_name: cache_name.into(),
            source_slot: source.slot,
            destination_slot: destination.slot,
            source: source.address,
            destination: destination.address,
            buckets: BTreeSet::new(),
        }
    }

    /// Source endpoint.
    pub fn source_endpoint(&self) -> BucketTransfer {
        BucketTransfer::new(self.source_slot, self.source)
    }

    /// Destination endpoint.
    pub fn destination_endpoint(&self) -> BucketTransfer {
        BucketTransfer::new(self.destination_slot, self.destination)
    }

    /// Number of buckets in the batch.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Check if the batch covers no buckets.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Kind of a [`BucketCommand`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    BeginTransfer,
    CancelTransfer,
    FinishTransfer,
    RestoreBucket,
    BeginReplicaRestore,
    FinishReplicaRestore,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::BeginTransfer => write!(f, "begin_transfer"),
            CommandKind::CancelTransfer => write!(f, "cancel_transfer"),
            CommandKind::FinishTransfer => write!(f, "finish_transfer"),
            CommandKind::RestoreBucket => write!(f, "restore_bucket"),
            CommandKind::BeginReplicaRestore => write!(f, "begin_replica_restore"),
            CommandKind::FinishReplicaRestore => write!(f, "finish_replica_restore"),
        }
    }
}

/// Instruction delivered to command listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketCommand {
    /// Start copying buckets from `source` to `destination`. Ownership moves
    /// only when the transfer is finished.
    BeginTransfer(BucketBatch),

    /// Abandon a transfer or restore. Ownership stays where it was.
    CancelTransfer(BucketBatch),

    /// A transfer completed; `destination` now owns the buckets.
    FinishTransfer(BucketBatch),

    /// Re-file data held in `source_slot` on `source` under
    /// `destination_slot` on the same member, as when a replica is promoted
    /// or two slots swap holders. Source and destination addresses are equal.
    RestoreBucket(BucketBatch),

    /// Start copying bucket data from an existing holder into a replica slot
    /// that `destination` already owns.
    BeginReplicaRestore(BucketBatch),

    /// A replica restore completed.
    FinishReplicaRestore(BucketBatch),
}

impl BucketCommand {
    /// Create a command of the given kind.
    pub fn new(kind: CommandKind, batch: BucketBatch) -> Self {
        match kind {
            CommandKind::BeginTransfer => BucketCommand::BeginTransfer(batch),
            CommandKind::CancelTransfer => BucketCommand::CancelTransfer(batch),
            CommandKind::FinishTransfer => BucketCommand::FinishTransfer(batch),
            CommandKind::RestoreBucket => BucketCommand::RestoreBucket(batch),
            CommandKind::BeginReplicaRestore => BucketCommand::BeginReplicaRestore(batch),
            CommandKind::FinishReplicaRestore => BucketCommand::FinishReplicaRestore(batch),
        }
    }

    /// The kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            BucketCommand::BeginTransfer(_) => CommandKind::BeginTransfer,
            BucketCommand::CancelTransfer(_) => CommandKind::CancelTransfer,
            BucketCommand::FinishTransfer(_) => CommandKind::FinishTransfer,
            BucketCommand::RestoreBucket(_) => CommandKind::RestoreBucket,
            BucketCommand::BeginReplicaRestore(_) => CommandKind::BeginReplicaRestore,
            BucketCommand::FinishReplicaRestore(_) => CommandKind::FinishReplicaRestore,
        }
    }

    /// The payload of this command.
    pub fn batch(&self) -> &BucketBatch {
        match self {
            BucketCommand::BeginTransfer(batch)
            | BucketCommand::CancelTransfer(batch)
            | BucketCommand::FinishTransfer(batch)
            | BucketCommand::RestoreBucket(batch)
            | BucketCommand::BeginReplicaRestore(batch)
            | BucketCommand::FinishReplicaRestore(batch) => batch,
        }
    }

    /// Serialize command to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize command from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl fmt::Display for BucketCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let batch = self.batch();
        write!(
            f,
            "{} {} {} -> {} ({} buckets)",
            self.kind(),
            batch.cache_name,
            batch.source_endpoint(),
            batch.destination_endpoint(),
            batch.len()
        )
    }
}

/// Groups per-bucket work into one batch per (kind, source, destination).
///
/// Batches come out in the order their first bucket was added, so command
/// emission order follows the order decisions were made.
#[derive(Debug, Default)]
pub(crate) struct CommandBuilder {
    cache_name: String,
    batches: Vec<(CommandKind, BucketBatch)>,
}

impl CommandBuilder {
    pub(crate) fn new(cache_name: &str) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            batches: Vec::new(),
        }
    }

    pub(crate) fn add(
        &mut self,
        kind: CommandKind,
        source: BucketTransfer,
        destination: BucketTransfer,
        bucket: BucketNumber,
    ) {
        let existing = self.batches.iter_mut().find(|(k, batch)| {
            *k == kind
                && batch.source_endpoint() == source
                && batch.destination_endpoint() == destination
        });

        match existing {
            Some((_, batch)) => {
                batch.buckets.insert(bucket);
            }
            None => {
                let mut batch = BucketBatch::new(self.cache_name.clone(), source, destination);
                batch.buckets.insert(bucket);
                self.batches.push((kind, batch));
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(crate) fn build(self) -> Vec<BucketCommand> {
        self.batches
            .into_iter()
            .map(|(kind, batch)| BucketCommand::new(kind, batch))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn endpoint(slot: StorageSlot, port: u16) -> BucketTransfer {
        BucketTransfer::new(slot, addr(port))
    }

    #[test]
    fn test_kind_round_trip() {
        let batch = BucketBatch::new("c", endpoint(0, 7001), endpoint(0, 7002));
        for kind in [
            CommandKind::BeginTransfer,
            CommandKind::CancelTransfer,
            CommandKind::FinishTransfer,
            CommandKind::RestoreBucket,
            CommandKind::BeginReplicaRestore,
            CommandKind::FinishReplicaRestore,
        ] {
            let command = BucketCommand::new(kind, batch.clone());
            assert_eq!(command.kind(), kind);
            assert_eq!(command.batch(), &batch);
        }
    }

    #[test]
    fn test_command_serialization() {
        let mut batch = BucketBatch::new("sessions", endpoint(0, 7001), endpoint(1, 7002));
        batch.buckets.extend([1, 5, 9]);
        let command = BucketCommand::BeginReplicaRestore(batch);

        let bytes = command.to_bytes().unwrap();
        let decoded = BucketCommand::from_bytes(&bytes).unwrap();
        assert_eq!(command, decoded);
    }

    #[test]
    fn test_display() {
        let mut batch = BucketBatch::new("sessions", endpoint(0, 7001), endpoint(0, 7002));
        batch.buckets.extend([1, 2]);
        let command = BucketCommand::BeginTransfer(batch);
        assert_eq!(
            command.to_string(),
            "begin_transfer sessions 127.0.0.1:7001#0 -> 127.0.0.1:7002#0 (2 buckets)"
        );
    }

    #[test]
    fn test_builder_groups_by_endpoints() {
        let mut builder = CommandBuilder::new("c");
        builder.add(CommandKind::BeginTransfer, endpoint(0, 7001), endpoint(0, 7003), 10);
        builder.add(CommandKind::BeginTransfer, endpoint(0, 7002), endpoint(0, 7003), 11);
        builder.add(CommandKind::BeginTransfer, endpoint(0, 7001), endpoint(0, 7003), 12);
        builder.add(CommandKind::CancelTransfer, endpoint(0, 7001), endpoint(0, 7003), 13);
        assert!(!builder.is_empty());

        let commands = builder.build();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].kind(), CommandKind::BeginTransfer);
        assert_eq!(commands[0].batch().source, addr(7001));
        assert_eq!(commands[0].batch().buckets, BTreeSet::from([10, 12]));
        assert_eq!(commands[1].batch().source, addr(7002));
        assert_eq!(commands[2].kind(), CommandKind::CancelTransfer);
    }
}
