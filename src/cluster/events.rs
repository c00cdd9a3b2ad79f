//! Cluster membership events.
//!
//! The membership feed reports members by address. Each event maps onto one
//! ownership change: joins add an owner, graceful leaves drain it first,
//! and departures remove it outright.

use crate::types::Address;

/// Events related to cluster membership changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEvent {
    /// A member joined and can own buckets.
    Joined {
        /// The member's address.
        addr: Address,
    },

    /// A member announced it will leave; its buckets should be drained.
    Leaving {
        /// The member's address.
        addr: Address,
    },

    /// A member left the cluster.
    Left {
        /// The member's address.
        addr: Address,
    },

    /// A member has been confirmed as failed.
    Failed {
        /// The member's address.
        addr: Address,
    },
}

impl MemberEvent {
    /// Get the address associated with this event.
    pub fn addr(&self) -> Address {
        match self {
            MemberEvent::Joined { addr }
            | MemberEvent::Leaving { addr }
            | MemberEvent::Left { addr }
            | MemberEvent::Failed { addr } => *addr,
        }
    }

    /// Check if this is a join-type event.
    pub fn is_join(&self) -> bool {
        matches!(self, MemberEvent::Joined { .. })
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(self, MemberEvent::Left { .. } | MemberEvent::Failed { .. })
    }
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: MemberEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl MemberEventListener for LoggingEventListener {
    fn on_event(&self, event: MemberEvent) {
        match event {
            MemberEvent::Joined { addr } => {
                tracing::info!(%addr, "Member joined cluster");
            }
            MemberEvent::Leaving { addr } => {
                tracing::info!(%addr, "Member leaving cluster");
            }
            MemberEvent::Left { addr } => {
                tracing::info!(%addr, "Member left cluster");
            }
            MemberEvent::Failed { addr } => {
                tracing::error!(%addr, "Member confirmed failed");
            }
        }
    }
}
