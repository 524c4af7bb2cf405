//! Collaborator contracts consumed by the engine
//!
//! This module provides:
//! - Traits for packages, rules, run records, alert publishing and state
//! - Filesystem-backed implementations used by the engine binary
//! - In-memory implementations used by tests

mod fs;
pub mod memory;
mod publisher;
mod state;

pub use fs::{
    select_latest_version, DirectoryPackageRepository, FileRunRecordStore, FsBlobStore,
    JsonRuleStore, StaticResourceInventory,
};
pub use publisher::{AlertEvent, BlobAlertPublisher, LogEventSink};
pub use state::{
    FileStateRepository, FileStateRepositoryFactory, StateError, StateRepository,
    StateRepositoryExt, StateRepositoryFactory, MAX_STATE_VALUE_BYTES,
};

use crate::models::{
    AlertRule, CanonicalAlert, DetectorManifest, DetectorPackage, QueryRunInfo,
    ResourceIdentifier, ResourceType, RunRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Persistence failure of a collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Source of detector packages
#[async_trait]
pub trait PackageRepository: Send + Sync {
    async fn get_manifest(&self, detector_id: &str) -> Result<DetectorManifest, StoreError>;

    async fn get_package(&self, detector_id: &str) -> Result<DetectorPackage, StoreError>;
}

/// Alert rule storage; scheduling only reads from it
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<AlertRule>, StoreError>;

    async fn upsert(&self, rule: AlertRule) -> Result<(), StoreError>;
}

/// Last-successful-run records, one per rule.
///
/// Implementations make each upsert atomic; concurrent writers to the same
/// record resolve as last-writer-wins.
#[async_trait]
pub trait RunRecordStore: Send + Sync {
    async fn get(&self, rule_id: &str) -> Result<Option<RunRecord>, StoreError>;

    async fn upsert(&self, record: RunRecord) -> Result<(), StoreError>;
}

/// Publishes canonical alerts; an empty batch is a no-op
#[async_trait]
pub trait AlertPublisher: Send + Sync {
    async fn publish(&self, detector_id: &str, alerts: &[CanonicalAlert])
        -> Result<(), StoreError>;
}

/// Opaque blob storage keyed by path
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

/// Sink for per-alert notification events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: AlertEvent) -> Result<(), StoreError>;
}

/// Lists resources for scope expansion
#[async_trait]
pub trait ResourceInventory: Send + Sync {
    async fn resource_groups(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<ResourceIdentifier>, StoreError>;

    /// Leaf resources of the given types in a subscription, optionally
    /// restricted to one resource group
    async fn resources(
        &self,
        subscription_id: &str,
        resource_group: Option<&str>,
        types: &[ResourceType],
    ) -> Result<Vec<ResourceIdentifier>, StoreError>;
}

/// Resolves where chart and query fields of a run execute
#[async_trait]
pub trait QueryRunInfoProvider: Send + Sync {
    async fn query_run_info(
        &self,
        detector_id: &str,
        resources: &[ResourceIdentifier],
    ) -> Result<HashMap<ResourceIdentifier, QueryRunInfo>, StoreError>;
}

/// Provider that never resolves a query context
#[derive(Debug, Default, Clone, Copy)]
pub struct NullQueryRunInfoProvider;

#[async_trait]
impl QueryRunInfoProvider for NullQueryRunInfoProvider {
    async fn query_run_info(
        &self,
        _detector_id: &str,
        _resources: &[ResourceIdentifier],
    ) -> Result<HashMap<ResourceIdentifier, QueryRunInfo>, StoreError> {
        Ok(HashMap::new())
    }
}

/// Provider resolving every leaf resource to its own metrics
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceMetricsQueryRunInfoProvider;

#[async_trait]
impl QueryRunInfoProvider for ResourceMetricsQueryRunInfoProvider {
    async fn query_run_info(
        &self,
        _detector_id: &str,
        resources: &[ResourceIdentifier],
    ) -> Result<HashMap<ResourceIdentifier, QueryRunInfo>, StoreError> {
        Ok(resources
            .iter()
            .filter(|r| !r.resource_type().is_container())
            .map(|r| {
                let info = QueryRunInfo {
                    kind: crate::models::TelemetryKind::Metrics,
                    resource_ids: vec![r.to_string()],
                };
                (r.clone(), info)
            })
            .collect())
    }
}
