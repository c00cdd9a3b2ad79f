//! Configuration types for bucket ownership assignment.

use crate::error::{Error, Result};
use crate::types::{StorageSlot, DEFAULT_BUCKET_COUNT};
use serde::{Deserialize, Serialize};

/// Construction parameters of a bucket ownership assignment.
///
/// All three values are fixed for the lifetime of the assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Name of the cache. Used for diagnostics and stamped on every command.
    pub cache_name: String,

    /// Number of buckets the keyspace is divided into.
    pub bucket_count: u32,

    /// Number of replica copies per bucket. 0 disables replication.
    pub replica_count: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            replica_count: 0,
        }
    }
}

impl AssignmentConfig {
    /// Create a configuration for the named cache with default sizing.
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    /// Set the bucket count.
    pub fn with_bucket_count(mut self, bucket_count: u32) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    /// Set the replica count.
    pub fn with_replica_count(mut self, replica_count: u32) -> Self {
        self.replica_count = replica_count;
        self
    }

    /// Total number of storage slots (primary plus replicas).
    pub fn slot_count(&self) -> usize {
        self.replica_count as usize + 1
    }

    /// Check whether `slot` is within `[0, replica_count]`.
    pub fn is_valid_slot(&self, slot: StorageSlot) -> bool {
        slot <= self.replica_count
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::Config("bucket count must be positive".into()));
        }
        if self.cache_name.is_empty() {
            return Err(Error::Config("cache name must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration for the assignment coordinator task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Capacity of the request channel feeding the coordinator. Membership
    /// events pushed through the event listener are not bounded by it.
    pub channel_capacity: usize,

    /// Whether membership events trigger a repartition automatically.
    pub auto_repartition: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            auto_repartition: true,
        }
    }
}

impl CoordinatorConfig {
    /// Set the request channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Enable or disable repartition after membership events.
    pub fn with_auto_repartition(mut self, enabled: bool) -> Self {
        self.auto_repartition = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AssignmentConfig::default();
        assert_eq!(config.bucket_count, 2051);
        assert_eq!(config.replica_count, 0);
        assert_eq!(config.slot_count(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = AssignmentConfig::new("sessions")
            .with_bucket_count(64)
            .with_replica_count(2);

        assert_eq!(config.cache_name, "sessions");
        assert_eq!(config.bucket_count, 64);
        assert_eq!(config.slot_count(), 3);
        assert!(config.is_valid_slot(2));
        assert!(!config.is_valid_slot(3));
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let config = AssignmentConfig::new("c").with_bucket_count(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_name_rejected() {
        let config = AssignmentConfig::new("");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_coordinator_config() {
        let config = CoordinatorConfig::default()
            .with_channel_capacity(0)
            .with_auto_repartition(false);
        assert_eq!(config.channel_capacity, 1);
        assert!(!config.auto_repartition);
    }
}
