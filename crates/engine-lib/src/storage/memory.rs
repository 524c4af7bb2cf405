//! In-memory collaborators for tests and single-process runs

use super::state::{check_key, check_size};
use super::{
    AlertEvent, AlertPublisher, BlobStore, EventSink, PackageRepository, RuleStore,
    RunRecordStore, StateError, StateRepository, StateRepositoryFactory, StoreError,
    MAX_STATE_VALUE_BYTES,
};
use crate::models::{AlertRule, CanonicalAlert, DetectorManifest, DetectorPackage, RunRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryStateRepository {
    values: DashMap<String, Vec<u8>>,
    limit: usize,
}

impl MemoryStateRepository {
    pub fn new() -> Self {
        Self::with_limit(MAX_STATE_VALUE_BYTES)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            values: DashMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for MemoryStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateRepository for MemoryStateRepository {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StateError> {
        check_key(key)?;
        check_size(value.len(), self.limit)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        check_key(key)?;
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        check_key(key)?;
        self.values.remove(key);
        Ok(())
    }
}

/// Hands out one shared in-memory repository per detector id
#[derive(Default)]
pub struct MemoryStateRepositoryFactory {
    repositories: DashMap<String, Arc<MemoryStateRepository>>,
}

impl MemoryStateRepositoryFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateRepositoryFactory for MemoryStateRepositoryFactory {
    fn for_detector(&self, detector_id: &str) -> Arc<dyn StateRepository> {
        let repository = self
            .repositories
            .entry(detector_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStateRepository::new()))
            .clone();
        repository
    }
}

#[derive(Default)]
pub struct MemoryPackageRepository {
    packages: DashMap<String, DetectorPackage>,
}

impl MemoryPackageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_package(self, package: DetectorPackage) -> Self {
        self.insert(package);
        self
    }

    pub fn insert(&self, package: DetectorPackage) {
        self.packages.insert(package.manifest.id.clone(), package);
    }

    fn not_found(detector_id: &str) -> StoreError {
        StoreError::NotFound {
            kind: "detector package",
            id: detector_id.to_string(),
        }
    }
}

#[async_trait]
impl PackageRepository for MemoryPackageRepository {
    async fn get_manifest(&self, detector_id: &str) -> Result<DetectorManifest, StoreError> {
        self.packages
            .get(detector_id)
            .map(|p| p.manifest.clone())
            .ok_or_else(|| Self::not_found(detector_id))
    }

    async fn get_package(&self, detector_id: &str) -> Result<DetectorPackage, StoreError> {
        self.packages
            .get(detector_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| Self::not_found(detector_id))
    }
}

/// Rules in insertion order
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<Vec<AlertRule>>,
}

impl MemoryRuleStore {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules: Mutex::new(rules),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get_all(&self) -> Result<Vec<AlertRule>, StoreError> {
        Ok(lock(&self.rules).clone())
    }

    async fn upsert(&self, rule: AlertRule) -> Result<(), StoreError> {
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRunRecordStore {
    records: DashMap<String, RunRecord>,
    upserts: AtomicUsize,
    failing_reads: Mutex<HashSet<String>>,
}

impl MemoryRunRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, record: RunRecord) -> Self {
        self.records.insert(record.rule_id.clone(), record);
        self
    }

    /// Make reads of one rule's record fail
    pub fn fail_reads_for(&self, rule_id: &str) {
        lock(&self.failing_reads).insert(rule_id.to_string());
    }

    pub fn record(&self, rule_id: &str) -> Option<RunRecord> {
        self.records.get(rule_id).map(|r| r.value().clone())
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunRecordStore for MemoryRunRecordStore {
    async fn get(&self, rule_id: &str) -> Result<Option<RunRecord>, StoreError> {
        if lock(&self.failing_reads).contains(rule_id) {
            return Err(StoreError::InvalidData(format!(
                "run record for '{}' is unreadable",
                rule_id
            )));
        }
        Ok(self.record(rule_id))
    }

    async fn upsert(&self, record: RunRecord) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.records.insert(record.rule_id.clone(), record);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
    writes: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.get(path).map(|b| b.value().clone())
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.blobs.insert(path.to_string(), bytes);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        lock(&self.events).clone()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: AlertEvent) -> Result<(), StoreError> {
        lock(&self.events).push(event);
        Ok(())
    }
}

/// Publisher that keeps every batch it receives
#[derive(Default)]
pub struct RecordingPublisher {
    batches: Mutex<Vec<(String, Vec<CanonicalAlert>)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishing for one detector fail
    pub fn fail_for(&self, detector_id: &str) {
        lock(&self.failing).insert(detector_id.to_string());
    }

    pub fn batches(&self) -> Vec<(String, Vec<CanonicalAlert>)> {
        lock(&self.batches).clone()
    }

    pub fn published_detectors(&self) -> Vec<String> {
        lock(&self.batches).iter().map(|(d, _)| d.clone()).collect()
    }
}

#[async_trait]
impl AlertPublisher for RecordingPublisher {
    async fn publish(
        &self,
        detector_id: &str,
        alerts: &[CanonicalAlert],
    ) -> Result<(), StoreError> {
        if lock(&self.failing).contains(detector_id) {
            return Err(StoreError::InvalidData(format!(
                "publishing for '{}' is unavailable",
                detector_id
            )));
        }
        lock(&self.batches).push((detector_id.to_string(), alerts.to_vec()));
        Ok(())
    }
}
