//! Cluster membership feed.

pub mod events;

pub use events::{LoggingEventListener, MemberEvent, MemberEventListener};
