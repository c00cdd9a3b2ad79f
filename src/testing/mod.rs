//! Testing utilities for bucket ownership. Hidden from the public docs;
//! nothing here is needed to run an assignment.
//!
//! This module provides tools for driving an assignment without a real data
//! transport:
//! - [`RecordingListener`] captures every emitted command
//! - [`TransferDriver`] completes in-flight work and repartitions until the
//!   table settles
//! - address helpers for readable fixtures
//!
//! # Example
//!
//! ```
//! use bucket_ownership::config::AssignmentConfig;
//! use bucket_ownership::partitioning::BucketOwnershipAssignment;
//! use bucket_ownership::testing::{addr, TransferDriver};
//!
//! let mut boa = BucketOwnershipAssignment::new(AssignmentConfig::new("c")).unwrap();
//! for port in 7001..=7003 {
//!     boa.add_owner(addr(port));
//! }
//!
//! TransferDriver::new().converge(&mut boa);
//! assert!(boa.is_quiescent());
//! assert_eq!(boa.get_owned_buckets(0, addr(7003)).len(), 683);
//! ```

mod property_tests;

use crate::partitioning::BucketOwnershipAssignment;
use crate::rebalancing::{BucketCommand, CommandKind, CommandListener};
use crate::types::{Address, StorageSlot};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::debug;

/// Loopback address with the given port.
#[doc(hidden)]
pub fn addr(port: u16) -> Address {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Command listener that keeps every command it receives.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct RecordingListener {
    commands: Mutex<Vec<BucketCommand>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands received so far, in delivery order.
    pub fn commands(&self) -> Vec<BucketCommand> {
        self.commands.lock().clone()
    }

    /// Drain the received commands.
    pub fn take(&self) -> Vec<BucketCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Received commands of one kind.
    pub fn of_kind(&self, kind: CommandKind) -> Vec<BucketCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }
}

impl CommandListener for RecordingListener {
    fn on_command(&self, command: &BucketCommand) {
        self.commands.lock().push(command.clone());
    }
}

/// Acts as a perfectly reliable data transport.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct TransferDriver {
    max_rounds: usize,
}

impl Default for TransferDriver {
    fn default() -> Self {
        Self { max_rounds: 100 }
    }
}

impl TransferDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of repartition rounds `converge` may take.
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Finish every transfer and restore that `commands` started.
    pub fn finish(&self, boa: &mut BucketOwnershipAssignment, commands: &[BucketCommand]) {
        for command in commands {
            let batch = command.batch();
            let buckets = batch.buckets.iter().copied();
            match command.kind() {
                CommandKind::BeginTransfer => {
                    boa.finish_transfer(
                        batch.source_slot,
                        batch.destination_slot,
                        batch.source,
                        batch.destination,
                        buckets,
                    );
                }
                CommandKind::BeginReplicaRestore => {
                    boa.finish_replica_restore(
                        batch.source_slot,
                        batch.destination_slot,
                        batch.source,
                        batch.destination,
                        buckets,
                    );
                }
                _ => {}
            }
        }
    }

    /// Finish all work currently in flight. Returns the number of buckets
    /// completed.
    pub fn drain(&self, boa: &mut BucketOwnershipAssignment) -> usize {
        let mut transfers = Vec::new();
        let mut restores = Vec::new();

        for owner in boa.owners() {
            for slot in 0..boa.active_slot_count() as StorageSlot {
                for (bucket, destination) in owner.outbound_transfers(slot) {
                    transfers.push((slot, owner.address(), destination, bucket));
                }
                for (bucket, source) in owner.restores(slot) {
                    restores.push((source, slot, owner.address(), bucket));
                }
            }
        }

        let completed = transfers.len() + restores.len();
        for (slot, source, destination, bucket) in transfers {
            boa.finish_transfer(slot, destination.slot, source, destination.address, [bucket]);
        }
        for (source, slot, holder, bucket) in restores {
            boa.finish_replica_restore(source.slot, slot, source.address, holder, [bucket]);
        }
        completed
    }

    /// Repartition and complete transfers until nothing changes.
    ///
    /// Returns the number of rounds that emitted commands.
    ///
    /// # Panics
    ///
    /// Panics if the table has not settled within the round limit.
    pub fn converge(&self, boa: &mut BucketOwnershipAssignment) -> usize {
        for round in 0..self.max_rounds {
            let commands = boa.repartition();
            let completed = self.drain(boa);
            debug!(round, commands = commands.len(), completed, "Converge round");
            if commands.is_empty() && completed == 0 && boa.is_quiescent() {
                return round;
            }
        }
        panic!(
            "assignment did not converge within {} rounds: {:?}",
            self.max_rounds, boa
        );
    }
}

/// Finish every transfer and restore that `commands` started.
#[doc(hidden)]
pub fn finish_all(boa: &mut BucketOwnershipAssignment, commands: &[BucketCommand]) {
    TransferDriver::new().finish(boa, commands);
}

/// Repartition and complete transfers until nothing changes.
#[doc(hidden)]
pub fn converge(boa: &mut BucketOwnershipAssignment) -> usize {
    TransferDriver::new().converge(boa)
}
