//! Assignment coordinator.
//!
//! The assignment has no internal locking, so every mutation must happen in
//! one execution context. The coordinator is that context: a tokio task
//! that owns the assignment and applies requests from a channel strictly in
//! arrival order. Readers never queue behind it; after each mutation the
//! task publishes an immutable [`OwnershipSnapshot`].
//!
//! Membership events pushed through [`MemberEventListener`] travel on their
//! own unbounded channel, since the feed calls back synchronously and an
//! event must never be dropped. The task drains that channel first.
//!
//! ```text
//! membership feed ───────▶ AssignmentHandle ──unbounded──┐
//! transport ───────┐             │                        ▼
//! listeners ───────┴──────▶      │ ────────mpsc──▶ coordinator task
//!                                │ snapshot()             │ owns BOA
//!                                ◀── RwLock<Arc<OwnershipSnapshot>> ◀─┘
//! ```

use crate::cluster::{MemberEvent, MemberEventListener};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::partitioning::{BucketOwnershipAssignment, OwnershipSnapshot};
use crate::rebalancing::command::BucketCommand;
use crate::types::{Address, BucketNumber, StorageSlot};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which completion notice a [`Request::Complete`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Transfer,
    ReplicaRestore,
    Reject,
}

/// Work item processed by the coordinator task.
enum Request {
    AddOwner {
        addr: Address,
        tx: oneshot::Sender<bool>,
    },
    BeginLeave {
        addr: Address,
        tx: oneshot::Sender<bool>,
    },
    RemoveOwners {
        addrs: Vec<Address>,
        tx: oneshot::Sender<Vec<BucketCommand>>,
    },
    Repartition {
        tx: oneshot::Sender<Vec<BucketCommand>>,
    },
    Complete {
        completion: Completion,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        source: Address,
        destination: Address,
        buckets: Vec<BucketNumber>,
        tx: oneshot::Sender<Vec<BucketCommand>>,
    },
    Member {
        event: MemberEvent,
        tx: Option<oneshot::Sender<Vec<BucketCommand>>>,
    },
    Shutdown,
}

/// Single task that serializes every mutation of an assignment.
pub struct AssignmentCoordinator {
    boa: BucketOwnershipAssignment,
    config: CoordinatorConfig,
    rx: mpsc::Receiver<Request>,
    events: mpsc::UnboundedReceiver<MemberEvent>,
    snapshot: Arc<RwLock<Arc<OwnershipSnapshot>>>,
}

impl AssignmentCoordinator {
    /// Start a coordinator task owning `boa`.
    ///
    /// The returned join handle yields the assignment back once the task
    /// stops, either after [`AssignmentHandle::shutdown`] or when every
    /// handle has been dropped.
    pub fn spawn(
        boa: BucketOwnershipAssignment,
        config: CoordinatorConfig,
    ) -> (AssignmentHandle, JoinHandle<BucketOwnershipAssignment>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (events_tx, events) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(Arc::new(boa.snapshot())));

        let handle = AssignmentHandle {
            tx,
            events: events_tx,
            snapshot: snapshot.clone(),
        };

        info!(
            cache = %boa.cache_name(),
            auto_repartition = config.auto_repartition,
            "Starting assignment coordinator"
        );

        let coordinator = Self {
            boa,
            config,
            rx,
            events,
            snapshot,
        };
        let join = tokio::spawn(coordinator.run());

        (handle, join)
    }

    async fn run(mut self) -> BucketOwnershipAssignment {
        loop {
            // Events queued before a request are applied before it.
            let request = tokio::select! {
                biased;
                Some(event) = self.events.recv() => Request::Member { event, tx: None },
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if matches!(request, Request::Shutdown) {
                break;
            }
            self.handle(request);
            self.publish();
        }

        info!(cache = %self.boa.cache_name(), "Assignment coordinator stopped");
        self.boa
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::AddOwner { addr, tx } => {
                let _ = tx.send(self.boa.add_owner(addr));
            }
            Request::BeginLeave { addr, tx } => {
                let _ = tx.send(self.boa.begin_leave(addr));
            }
            Request::RemoveOwners { addrs, tx } => {
                let _ = tx.send(self.boa.remove_owners(addrs));
            }
            Request::Repartition { tx } => {
                let _ = tx.send(self.boa.repartition());
            }
            Request::Complete {
                completion,
                source_slot,
                destination_slot,
                source,
                destination,
                buckets,
                tx,
            } => {
                let commands = match completion {
                    Completion::Transfer => self.boa.finish_transfer(
                        source_slot,
                        destination_slot,
                        source,
                        destination,
                        buckets,
                    ),
                    Completion::ReplicaRestore => self.boa.finish_replica_restore(
                        source_slot,
                        destination_slot,
                        source,
                        destination,
                        buckets,
                    ),
                    Completion::Reject => self.boa.reject_transfer(
                        source_slot,
                        destination_slot,
                        source,
                        destination,
                        buckets,
                    ),
                };
                let _ = tx.send(commands);
            }
            Request::Member { event, tx } => {
                let commands = self.apply_member_event(event);
                if let Some(tx) = tx {
                    let _ = tx.send(commands);
                }
            }
            Request::Shutdown => {}
        }
    }

    fn apply_member_event(&mut self, event: MemberEvent) -> Vec<BucketCommand> {
        debug!(cache = %self.boa.cache_name(), ?event, "Applying membership event");

        let mut commands = match event {
            MemberEvent::Joined { addr } => {
                self.boa.add_owner(addr);
                Vec::new()
            }
            MemberEvent::Leaving { addr } => {
                self.boa.begin_leave(addr);
                Vec::new()
            }
            MemberEvent::Left { addr } | MemberEvent::Failed { addr } => {
                self.boa.remove_owners([addr])
            }
        };

        if self.config.auto_repartition {
            commands.extend(self.boa.repartition());
        }
        commands
    }

    fn publish(&self) {
        *self.snapshot.write() = Arc::new(self.boa.snapshot());
    }
}

/// Cloneable handle to a running [`AssignmentCoordinator`].
///
/// Every mutating call is queued and applied in order. Commands produced by
/// a call are delivered to the assignment's listeners and also returned.
#[derive(Clone)]
pub struct AssignmentHandle {
    tx: mpsc::Sender<Request>,
    events: mpsc::UnboundedSender<MemberEvent>,
    snapshot: Arc<RwLock<Arc<OwnershipSnapshot>>>,
}

impl AssignmentHandle {
    /// Latest published ownership snapshot.
    pub fn snapshot(&self) -> Arc<OwnershipSnapshot> {
        self.snapshot.read().clone()
    }

    /// Whether the coordinator task is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Register a new owner.
    pub async fn add_owner(&self, addr: Address) -> Result<bool> {
        self.call(|tx| Request::AddOwner { addr, tx }).await
    }

    /// Flag an owner as leaving.
    pub async fn begin_leave(&self, addr: Address) -> Result<bool> {
        self.call(|tx| Request::BeginLeave { addr, tx }).await
    }

    /// Remove owners.
    pub async fn remove_owners<I>(&self, addrs: I) -> Result<Vec<BucketCommand>>
    where
        I: IntoIterator<Item = Address>,
    {
        let addrs = addrs.into_iter().collect();
        self.call(|tx| Request::RemoveOwners { addrs, tx }).await
    }

    /// Rebalance toward the target shares.
    pub async fn repartition(&self) -> Result<Vec<BucketCommand>> {
        self.call(|tx| Request::Repartition { tx }).await
    }

    /// Report a completed transfer.
    pub async fn finish_transfer<I>(
        &self,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        old_owner: Address,
        new_owner: Address,
        buckets: I,
    ) -> Result<Vec<BucketCommand>>
    where
        I: IntoIterator<Item = BucketNumber>,
    {
        self.complete(
            Completion::Transfer,
            source_slot,
            destination_slot,
            old_owner,
            new_owner,
            buckets,
        )
        .await
    }

    /// Report a completed replica restore.
    pub async fn finish_replica_restore<I>(
        &self,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        source: Address,
        destination: Address,
        buckets: I,
    ) -> Result<Vec<BucketCommand>>
    where
        I: IntoIterator<Item = BucketNumber>,
    {
        self.complete(
            Completion::ReplicaRestore,
            source_slot,
            destination_slot,
            source,
            destination,
            buckets,
        )
        .await
    }

    /// Report a failed transfer or restore.
    pub async fn reject_transfer<I>(
        &self,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        old_owner: Address,
        new_owner: Address,
        buckets: I,
    ) -> Result<Vec<BucketCommand>>
    where
        I: IntoIterator<Item = BucketNumber>,
    {
        self.complete(
            Completion::Reject,
            source_slot,
            destination_slot,
            old_owner,
            new_owner,
            buckets,
        )
        .await
    }

    /// Apply a membership event and wait for the resulting commands.
    pub async fn apply_member_event(&self, event: MemberEvent) -> Result<Vec<BucketCommand>> {
        self.call(|tx| Request::Member {
            event,
            tx: Some(tx),
        })
        .await
    }

    /// Stop the coordinator task after already queued requests.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Request::Shutdown)
            .await
            .map_err(|_| Error::CoordinatorStopped)
    }

    async fn complete<I>(
        &self,
        completion: Completion,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        source: Address,
        destination: Address,
        buckets: I,
    ) -> Result<Vec<BucketCommand>>
    where
        I: IntoIterator<Item = BucketNumber>,
    {
        let buckets: Vec<BucketNumber> = buckets.into_iter().collect();
        self.check_range(source_slot, destination_slot, &buckets)?;

        self.call(|tx| Request::Complete {
            completion,
            source_slot,
            destination_slot,
            source,
            destination,
            buckets,
            tx,
        })
        .await
    }

    /// Reject completion notices that could never match this cache.
    fn check_range(
        &self,
        source_slot: StorageSlot,
        destination_slot: StorageSlot,
        buckets: &[BucketNumber],
    ) -> Result<()> {
        let snapshot = self.snapshot();
        for slot in [source_slot, destination_slot] {
            if slot > snapshot.replica_count {
                return Err(Error::InvalidSlot {
                    slot,
                    replica_count: snapshot.replica_count,
                });
            }
        }
        if let Some(&bucket) = buckets.iter().find(|b| **b >= snapshot.bucket_count) {
            return Err(Error::InvalidBucket {
                bucket,
                bucket_count: snapshot.bucket_count,
            });
        }
        Ok(())
    }

    async fn call<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Request,
    {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| Error::CoordinatorStopped)?;
        rx.await.map_err(|_| Error::CoordinatorStopped)
    }
}

impl MemberEventListener for AssignmentHandle {
    /// Queue the event without waiting. Used when the membership feed calls
    /// back synchronously. Never blocks and never drops the event while the
    /// coordinator runs.
    fn on_event(&self, event: MemberEvent) {
        if self.events.send(event).is_err() {
            warn!(?event, "Membership event after coordinator stopped");
        }
    }
}

impl std::fmt::Debug for AssignmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentHandle")
            .field("running", &self.is_running())
            .finish()
    }
}
