//! Filesystem-backed collaborators
//!
//! Layout below the storage root:
//! - `packages/<detector id>/<semver>/manifest.json` plus one file per module
//! - `rules.json`
//! - `runs/<rule id>.json`
//! - `alerts/...` blobs
//! - `inventory.json`

use super::{BlobStore, PackageRepository, ResourceInventory, RuleStore, RunRecordStore, StoreError};
use crate::models::{
    AlertRule, DetectorManifest, DetectorPackage, ResourceIdentifier, ResourceType, RunRecord,
};
use async_trait::async_trait;
use semver::Version;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::io::Write;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "manifest.json";

/// Write a file atomically via a uniquely named sibling temp file and rename.
///
/// Concurrent writers to the same path each get their own temp file, so the
/// last rename wins and readers never see a partial file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || persist_atomic(&path, &bytes))
        .await
        .map_err(std::io::Error::other)?
}

fn persist_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Rejects names that would escape their directory
fn safe_file_name(kind: &str, name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidData(format!(
            "{} '{}' is not usable as a file name",
            kind, name
        )))
    }
}

/// Pick the highest semantic version among candidate names.
///
/// Names that do not parse as a version are ignored.
pub fn select_latest_version<'a, I>(candidates: I) -> Option<(Version, &'a str)>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .filter_map(|name| {
            let trimmed = name.strip_prefix('v').unwrap_or(name);
            Version::parse(trimmed).ok().map(|v| (v, name))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
}

/// Detector packages stored as versioned directories
pub struct DirectoryPackageRepository {
    dir: PathBuf,
}

impl DirectoryPackageRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn latest_dir(&self, detector_id: &str) -> Result<PathBuf, StoreError> {
        safe_file_name("detector id", detector_id)?;
        let detector_dir = self.dir.join(detector_id);
        let not_found = || StoreError::NotFound {
            kind: "detector package",
            id: detector_id.to_string(),
        };

        let mut entries = match tokio::fs::read_dir(&detector_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }

        let (version, name) =
            select_latest_version(names.iter().map(String::as_str)).ok_or_else(not_found)?;
        debug!(detector_id = %detector_id, version = %version, "Selected package version");
        Ok(detector_dir.join(name))
    }

    /// Module name of a package file: the file name without a `.json` suffix
    fn module_name(file_name: &str) -> &str {
        file_name.strip_suffix(".json").unwrap_or(file_name)
    }

    /// Read a package from a single version directory
    pub async fn read_package_dir(dir: &Path) -> Result<DetectorPackage, StoreError> {
        let manifest_bytes = tokio::fs::read(dir.join(MANIFEST_FILE)).await?;
        let manifest: DetectorManifest = serde_json::from_slice(&manifest_bytes)?;

        let mut content = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!(path = %entry.path().display(), "Skipping non UTF-8 package file");
                continue;
            };
            if file_name == MANIFEST_FILE {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            content.insert(Self::module_name(file_name).to_string(), bytes);
        }

        Ok(DetectorPackage { manifest, content })
    }
}

#[async_trait]
impl PackageRepository for DirectoryPackageRepository {
    async fn get_manifest(&self, detector_id: &str) -> Result<DetectorManifest, StoreError> {
        let dir = self.latest_dir(detector_id).await?;
        let bytes = tokio::fs::read(dir.join(MANIFEST_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_package(&self, detector_id: &str) -> Result<DetectorPackage, StoreError> {
        let dir = self.latest_dir(detector_id).await?;
        Self::read_package_dir(&dir).await
    }
}

/// Alert rules kept in a single JSON array file
pub struct JsonRuleStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RuleStore for JsonRuleStore {
    async fn get_all(&self) -> Result<Vec<AlertRule>, StoreError> {
        match read_optional(&self.path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn upsert(&self, rule: AlertRule) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut rules = self.get_all().await?;
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }

        let bytes = serde_json::to_vec_pretty(&rules)?;
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

/// One JSON file per rule id
pub struct FileRunRecordStore {
    dir: PathBuf,
}

impl FileRunRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, rule_id: &str) -> Result<PathBuf, StoreError> {
        safe_file_name("rule id", rule_id)?;
        Ok(self.dir.join(format!("{}.json", rule_id)))
    }
}

#[async_trait]
impl RunRecordStore for FileRunRecordStore {
    async fn get(&self, rule_id: &str) -> Result<Option<RunRecord>, StoreError> {
        match read_optional(&self.path_for(rule_id)?).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: RunRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.rule_id)?;
        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomic(&path, &bytes).await?;
        Ok(())
    }
}

/// Blob store rooted at a directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(StoreError::InvalidData(format!(
                "blob path '{}' must be relative and stay below the store root",
                path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        write_atomic(&full, &bytes).await?;
        Ok(())
    }
}

/// Resource inventory backed by a fixed list of leaf and container ids
#[derive(Debug, Clone, Default)]
pub struct StaticResourceInventory {
    resources: BTreeSet<ResourceIdentifier>,
}

impl StaticResourceInventory {
    pub fn new(resources: impl IntoIterator<Item = ResourceIdentifier>) -> Self {
        Self {
            resources: resources.into_iter().collect(),
        }
    }

    /// Load a JSON array of resource id strings; a missing file is empty
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        match read_optional(path).await? {
            Some(bytes) => {
                let resources: Vec<ResourceIdentifier> = serde_json::from_slice(&bytes)?;
                Ok(Self::new(resources))
            }
            None => {
                warn!(path = %path.display(), "Inventory file missing, scope expansion will be empty");
                Ok(Self::default())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[async_trait]
impl ResourceInventory for StaticResourceInventory {
    async fn resource_groups(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<ResourceIdentifier>, StoreError> {
        // Groups listed explicitly plus the groups that own listed resources
        let groups: BTreeSet<ResourceIdentifier> = self
            .resources
            .iter()
            .filter(|r| r.subscription_id().eq_ignore_ascii_case(subscription_id))
            .filter(|r| r.resource_type() != ResourceType::Subscription)
            .map(|r| ResourceIdentifier::resource_group(r.subscription_id(), r.resource_group_name()))
            .collect();
        Ok(groups.into_iter().collect())
    }

    async fn resources(
        &self,
        subscription_id: &str,
        resource_group: Option<&str>,
        types: &[ResourceType],
    ) -> Result<Vec<ResourceIdentifier>, StoreError> {
        Ok(self
            .resources
            .iter()
            .filter(|r| !r.resource_type().is_container())
            .filter(|r| types.contains(&r.resource_type()))
            .filter(|r| r.subscription_id().eq_ignore_ascii_case(subscription_id))
            .filter(|r| {
                resource_group.map_or(true, |rg| r.resource_group_name().eq_ignore_ascii_case(rg))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::high_cpu_package;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn vm(sub: &str, rg: &str, name: &str) -> ResourceIdentifier {
        ResourceIdentifier::resource(ResourceType::VirtualMachine, sub, rg, name).unwrap()
    }

    async fn write_package(root: &Path, version: &str) {
        let package = high_cpu_package();
        let dir = root.join(&package.manifest.id).join(version);
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut manifest = package.manifest.clone();
        manifest.version = Version::parse(version.trim_start_matches('v')).unwrap();
        tokio::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(&manifest).unwrap())
            .await
            .unwrap();
        for (module, bytes) in &package.content {
            tokio::fs::write(dir.join(format!("{}.json", module)), bytes)
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_select_latest_version_ignores_unparseable() {
        let names = ["1.2.0", "latest", "1.10.0", "v1.9.3", "1.10.0-beta.1", "0.9"];
        let (version, name) = select_latest_version(names).unwrap();
        assert_eq!(version, Version::new(1, 10, 0));
        assert_eq!(name, "1.10.0");

        assert!(select_latest_version(["latest", "dev"]).is_none());
    }

    #[tokio::test]
    async fn test_package_repository_picks_latest() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "1.0.0").await;
        write_package(dir.path(), "1.4.2").await;
        tokio::fs::create_dir_all(dir.path().join("builtin-high-cpu/scratch"))
            .await
            .unwrap();

        let repo = DirectoryPackageRepository::new(dir.path());
        let manifest = repo.get_manifest("builtin-high-cpu").await.unwrap();
        assert_eq!(manifest.version, Version::new(1, 4, 2));

        let package = repo.get_package("builtin-high-cpu").await.unwrap();
        assert!(package.content.contains_key(&package.manifest.assembly_ref));
    }

    #[tokio::test]
    async fn test_package_repository_missing_detector() {
        let dir = TempDir::new().unwrap();
        let repo = DirectoryPackageRepository::new(dir.path());

        let err = repo.get_package("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(repo.get_package("../etc").await.is_err());
    }

    #[tokio::test]
    async fn test_rule_store_upsert_replaces_by_id() {
        let dir = TempDir::new().unwrap();
        let store = JsonRuleStore::new(dir.path().join("rules.json"));
        assert!(store.get_all().await.unwrap().is_empty());

        let mut rule = AlertRule {
            id: "r1".to_string(),
            name: "cpu".to_string(),
            description: String::new(),
            detector_id: "builtin-high-cpu".to_string(),
            resource_id: "/subscriptions/s".to_string(),
            cadence: Duration::from_secs(300),
            email_recipients: Vec::new(),
        };
        store.upsert(rule.clone()).await.unwrap();
        rule.cadence = Duration::from_secs(900);
        store.upsert(rule.clone()).await.unwrap();

        let rules = store.get_all().await.unwrap();
        assert_eq!(rules, vec![rule]);
    }

    #[tokio::test]
    async fn test_run_record_store() {
        let dir = TempDir::new().unwrap();
        let store = FileRunRecordStore::new(dir.path());
        assert!(store.get("r1").await.unwrap().is_none());

        let record = RunRecord {
            rule_id: "r1".to_string(),
            detector_id: "cpu".to_string(),
            last_successful_execution_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        store.upsert(record.clone()).await.unwrap();
        assert_eq!(store.get("r1").await.unwrap(), Some(record));

        assert!(store.get("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_of_one_record_all_succeed() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(FileRunRecordStore::new(dir.path()));
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut writers = tokio::task::JoinSet::new();
        for minute in 0..64 {
            let store = store.clone();
            writers.spawn(async move {
                store
                    .upsert(RunRecord {
                        rule_id: "r1".to_string(),
                        detector_id: "cpu".to_string(),
                        last_successful_execution_time: base + chrono::Duration::minutes(minute),
                    })
                    .await
            });
        }
        while let Some(result) = writers.join_next().await {
            result.unwrap().unwrap();
        }

        let stored = store.get("r1").await.unwrap().unwrap();
        assert!(stored.last_successful_execution_time >= base);

        // Only the record itself remains, no stray temp files
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        let only = entries.next().unwrap().unwrap();
        assert_eq!(only.file_name(), "r1.json");
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_blob_store_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.put("alerts/cpu/x.json", b"{}".to_vec()).await.unwrap();
        assert!(dir.path().join("alerts/cpu/x.json").exists());

        assert!(store.put("../x.json", Vec::new()).await.is_err());
        assert!(store.put("/abs.json", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_static_inventory_listing() {
        let inventory = StaticResourceInventory::new([
            vm("s1", "rg1", "a"),
            vm("s1", "rg2", "b"),
            vm("s2", "rg1", "c"),
            ResourceIdentifier::resource_group("s1", "empty"),
        ]);

        let groups = inventory.resource_groups("s1").await.unwrap();
        assert_eq!(
            groups,
            vec![
                ResourceIdentifier::resource_group("s1", "empty"),
                ResourceIdentifier::resource_group("s1", "rg1"),
                ResourceIdentifier::resource_group("s1", "rg2"),
            ]
        );

        let in_rg1 = inventory
            .resources("s1", Some("rg1"), &[ResourceType::VirtualMachine])
            .await
            .unwrap();
        assert_eq!(in_rg1, vec![vm("s1", "rg1", "a")]);

        let apps = inventory
            .resources("s1", None, &[ResourceType::AppService])
            .await
            .unwrap();
        assert!(apps.is_empty());
    }

    #[tokio::test]
    async fn test_static_inventory_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.json");
        assert!(StaticResourceInventory::load(&path).await.unwrap().is_empty());

        tokio::fs::write(&path, serde_json::to_vec(&[vm("s", "g", "v").to_string()]).unwrap())
            .await
            .unwrap();
        assert_eq!(StaticResourceInventory::load(&path).await.unwrap().len(), 1);
    }
}
