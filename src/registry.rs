//! Per-aggregate-type registry of stores, handlers, and policies.
//!
//! A [`StreamRegistry`] is assembled once at startup and shared by `Arc`
//! with every engine, handle, and cache for that aggregate type.

use std::fmt;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::applicator::EventApplicator;
use crate::config::{EngineConfig, PoliciesConfig};
use crate::error::StreamError;
use crate::projection::ProjectionRouter;
use crate::snapshot::FileSnapshotStore;
use crate::storage::{EventLog, FileEventLog, SnapshotStore, StreamLayout};

/// Everything an engine needs besides its stream id.
pub struct StreamRegistry<A: Aggregate> {
    pub(crate) event_log: Arc<dyn EventLog>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) applicator: Option<EventApplicator<A>>,
    pub(crate) projections: ProjectionRouter<A>,
    pub(crate) policies: PoliciesConfig,
}

// Manual `Debug` because the store trait objects are not `Debug`.
impl<A: Aggregate> fmt::Debug for StreamRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("applicator", &self.applicator)
            .field("projections", &self.projections)
            .field("policies", &self.policies)
            .finish()
    }
}

impl<A: Aggregate> StreamRegistry<A> {
    /// Start assembling a registry.
    pub fn builder() -> StreamRegistryBuilder<A> {
        StreamRegistryBuilder::default()
    }

    /// The policies handles and caches fall back to.
    pub fn policies(&self) -> &PoliciesConfig {
        &self.policies
    }

    /// The event log engines append to.
    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }

    /// The snapshot store engines write to.
    pub fn snapshot_store(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }
}

/// Builder for [`StreamRegistry`].
pub struct StreamRegistryBuilder<A: Aggregate> {
    event_log: Option<Arc<dyn EventLog>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    applicator: Option<EventApplicator<A>>,
    projections: ProjectionRouter<A>,
    policies: PoliciesConfig,
}

impl<A: Aggregate> Default for StreamRegistryBuilder<A> {
    fn default() -> Self {
        Self {
            event_log: None,
            snapshots: None,
            applicator: None,
            projections: ProjectionRouter::new(),
            policies: PoliciesConfig::default(),
        }
    }
}

impl<A: Aggregate> StreamRegistryBuilder<A> {
    /// A builder with file-backed stores and policies taken from `config`.
    ///
    /// The stores live under `config.database.connection`, with the two
    /// table names as subdirectories.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if `config` fails validation.
    pub fn from_config(config: &EngineConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let db = &config.database;
        let layout = StreamLayout::new(&db.connection, &db.event_table, &db.snapshot_table);
        Ok(Self::default()
            .event_log(Arc::new(FileEventLog::new(layout.clone())))
            .snapshot_store(Arc::new(FileSnapshotStore::new(layout)))
            .policies(config.policies.clone()))
    }

    /// Set the event log.
    pub fn event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    /// Set the snapshot store.
    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Set the event applicator. Engines refuse to initialize without one.
    pub fn applicator(mut self, applicator: EventApplicator<A>) -> Self {
        self.applicator = Some(applicator);
        self
    }

    /// Set the projection router. Defaults to an empty router.
    pub fn projections(mut self, projections: ProjectionRouter<A>) -> Self {
        self.projections = projections;
        self
    }

    /// Set the policy defaults.
    pub fn policies(mut self, policies: PoliciesConfig) -> Self {
        self.policies = policies;
        self
    }

    /// Finish the registry.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if either store is missing or
    /// the policies are invalid.
    pub fn build(self) -> Result<StreamRegistry<A>, StreamError> {
        let event_log = self
            .event_log
            .ok_or_else(|| StreamError::Configuration("no event log configured".into()))?;
        let snapshots = self
            .snapshots
            .ok_or_else(|| StreamError::Configuration("no snapshot store configured".into()))?;
        self.policies.validate()?;

        if self.applicator.is_none() {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                "registry built without an event applicator; engines will not initialize"
            );
        }

        Ok(StreamRegistry {
            event_log,
            snapshots,
            applicator: self.applicator,
            projections: self.projections,
            policies: self.policies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Customer, customer_applicator};
    use crate::config::SnapshotPolicy;
    use crate::memory::{MemoryEventLog, MemorySnapshotStore};

    #[test]
    fn missing_event_log_is_a_configuration_error() {
        let result = StreamRegistry::<Customer>::builder()
            .snapshot_store(Arc::new(MemorySnapshotStore::new()))
            .applicator(customer_applicator())
            .build();
        assert!(
            matches!(result, Err(StreamError::Configuration(ref m)) if m.contains("event log"))
        );
    }

    #[test]
    fn missing_snapshot_store_is_a_configuration_error() {
        let result = StreamRegistry::<Customer>::builder()
            .event_log(Arc::new(MemoryEventLog::new()))
            .build();
        assert!(
            matches!(result, Err(StreamError::Configuration(ref m)) if m.contains("snapshot store"))
        );
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let result = StreamRegistry::<Customer>::builder()
            .event_log(Arc::new(MemoryEventLog::new()))
            .snapshot_store(Arc::new(MemorySnapshotStore::new()))
            .policies(PoliciesConfig {
                snapshot_policy: SnapshotPolicy::AfterIntervalDeltas(0),
                ..PoliciesConfig::default()
            })
            .build();
        assert!(matches!(result, Err(StreamError::Configuration(_))));
    }

    #[test]
    fn from_config_carries_policies() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = EngineConfig::default();
        config.database.connection = dir.path().display().to_string();
        config.policies.default_queue_size = 3;

        let registry = StreamRegistryBuilder::<Customer>::from_config(&config)
            .expect("builder should open")
            .applicator(customer_applicator())
            .build()
            .expect("registry should build");
        assert_eq!(registry.policies().default_queue_size, 3);
    }

    #[test]
    fn from_config_validates() {
        let mut config = EngineConfig::default();
        config.database.connection.clear();
        let result = StreamRegistryBuilder::<Customer>::from_config(&config);
        assert!(matches!(result, Err(StreamError::Configuration(_))));
    }
}
