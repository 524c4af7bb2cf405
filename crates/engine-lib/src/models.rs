//! Core data models for the detector engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kinds of cloud resources a detector can be scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Subscription,
    ResourceGroup,
    VirtualMachine,
    VirtualMachineScaleSet,
    AppService,
    LogAnalyticsWorkspace,
    ApplicationInsights,
    KubernetesService,
    SqlDatabase,
    StorageAccount,
}

impl ResourceType {
    /// Leaf kinds, in declaration order
    pub const LEAF_TYPES: [ResourceType; 8] = [
        ResourceType::VirtualMachine,
        ResourceType::VirtualMachineScaleSet,
        ResourceType::AppService,
        ResourceType::LogAnalyticsWorkspace,
        ResourceType::ApplicationInsights,
        ResourceType::KubernetesService,
        ResourceType::SqlDatabase,
        ResourceType::StorageAccount,
    ];

    /// Returns true for `Subscription` and `ResourceGroup`
    pub fn is_container(&self) -> bool {
        matches!(self, ResourceType::Subscription | ResourceType::ResourceGroup)
    }

    /// Provider path segment (`namespace/type`) for leaf kinds
    pub fn provider_path(&self) -> Option<&'static str> {
        match self {
            ResourceType::Subscription | ResourceType::ResourceGroup => None,
            ResourceType::VirtualMachine => Some("Microsoft.Compute/virtualMachines"),
            ResourceType::VirtualMachineScaleSet => {
                Some("Microsoft.Compute/virtualMachineScaleSets")
            }
            ResourceType::AppService => Some("Microsoft.Web/sites"),
            ResourceType::LogAnalyticsWorkspace => Some("Microsoft.OperationalInsights/workspaces"),
            ResourceType::ApplicationInsights => Some("Microsoft.Insights/components"),
            ResourceType::KubernetesService => Some("Microsoft.ContainerService/managedClusters"),
            ResourceType::SqlDatabase => Some("Microsoft.Sql/databases"),
            ResourceType::StorageAccount => Some("Microsoft.Storage/storageAccounts"),
        }
    }

    fn from_provider_path(path: &str) -> Option<Self> {
        Self::LEAF_TYPES
            .iter()
            .copied()
            .find(|t| t.provider_path().is_some_and(|p| p.eq_ignore_ascii_case(path)))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error returned when a resource id string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource id '{id}': {reason}")]
pub struct InvalidResourceId {
    pub id: String,
    pub reason: String,
}

impl InvalidResourceId {
    fn new(id: &str, reason: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Identifies a subscription, resource group or leaf resource.
///
/// Container identifiers keep their lower-level fields empty; the
/// constructors are the only way to build one outside this module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentifier {
    resource_type: ResourceType,
    subscription_id: String,
    resource_group: String,
    resource_name: String,
}

impl ResourceIdentifier {
    pub fn subscription(subscription_id: impl Into<String>) -> Self {
        Self {
            resource_type: ResourceType::Subscription,
            subscription_id: subscription_id.into(),
            resource_group: String::new(),
            resource_name: String::new(),
        }
    }

    pub fn resource_group(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: ResourceType::ResourceGroup,
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            resource_name: String::new(),
        }
    }

    /// Build a leaf resource identifier. Container kinds are rejected.
    pub fn resource(
        resource_type: ResourceType,
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        resource_name: impl Into<String>,
    ) -> Result<Self, InvalidResourceId> {
        let id = Self {
            resource_type,
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            resource_name: resource_name.into(),
        };
        if resource_type.is_container() {
            return Err(InvalidResourceId::new(
                &id.to_string(),
                "container kinds cannot carry a resource name",
            ));
        }
        Ok(id)
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group_name(&self) -> &str {
        &self.resource_group
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/subscriptions/{}", self.subscription_id)?;
        if self.resource_type == ResourceType::Subscription {
            return Ok(());
        }
        write!(f, "/resourceGroups/{}", self.resource_group)?;
        match self.resource_type.provider_path() {
            Some(provider) => write!(f, "/providers/{}/{}", provider, self.resource_name),
            None => Ok(()),
        }
    }
}

impl FromStr for ResourceIdentifier {
    type Err = InvalidResourceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.trim().split('/').filter(|seg| !seg.is_empty()).collect();

        let keyword = |index: usize, expected: &str| {
            segments
                .get(index)
                .is_some_and(|seg| seg.eq_ignore_ascii_case(expected))
        };

        if !keyword(0, "subscriptions") || segments.len() < 2 {
            return Err(InvalidResourceId::new(s, "expected /subscriptions/{id} prefix"));
        }
        let subscription = segments[1];

        match segments.len() {
            2 => Ok(Self::subscription(subscription)),
            4 if keyword(2, "resourceGroups") => {
                Ok(Self::resource_group(subscription, segments[3]))
            }
            8 if keyword(2, "resourceGroups") && keyword(4, "providers") => {
                let provider = format!("{}/{}", segments[5], segments[6]);
                let resource_type = ResourceType::from_provider_path(&provider).ok_or_else(|| {
                    InvalidResourceId::new(s, format!("unsupported resource provider {}", provider))
                })?;
                Self::resource(resource_type, subscription, segments[3], segments[7])
            }
            _ => Err(InvalidResourceId::new(s, "unexpected number of path segments")),
        }
    }
}

impl Serialize for ResourceIdentifier {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde helpers encoding durations as whole minutes
pub mod minutes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    fn from_minutes<E: Error>(mins: u64) -> Result<Duration, E> {
        mins.checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| E::custom(format!("cadence of {} minutes is out of range", mins)))
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs() / 60)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        from_minutes(u64::deserialize(deserializer)?)
    }

    pub mod set {
        use super::from_minutes;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::collections::BTreeSet;
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &BTreeSet<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(value.iter().map(|d| d.as_secs() / 60))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<BTreeSet<Duration>, D::Error> {
            let mins = Vec::<u64>::deserialize(deserializer)?;
            mins.into_iter().map(from_minutes::<D::Error>).collect()
        }
    }
}

/// Static metadata describing a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: semver::Version,
    pub assembly_ref: String,
    pub entry_point_ref: String,
    pub supported_resource_types: BTreeSet<ResourceType>,
    #[serde(with = "minutes::set")]
    pub supported_cadences: BTreeSet<Duration>,
}

impl DetectorManifest {
    pub fn supports(&self, resource_type: ResourceType) -> bool {
        self.supported_resource_types.contains(&resource_type)
    }
}

/// A detector manifest plus its module contents keyed by module name
#[derive(Debug, Clone)]
pub struct DetectorPackage {
    pub manifest: DetectorManifest,
    pub content: HashMap<String, Vec<u8>>,
}

/// A scheduled binding of a detector to a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub detector_id: String,
    pub resource_id: String,
    #[serde(with = "minutes")]
    pub cadence: Duration,
    #[serde(default)]
    pub email_recipients: Vec<String>,
}

/// A scheduling decision for one rule, made fresh on every tick
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionInfo {
    pub rule: AlertRule,
    pub current_execution_time: DateTime<Utc>,
    pub last_execution_time: Option<DateTime<Utc>>,
}

/// Last successful run of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub rule_id: String,
    pub detector_id: String,
    pub last_successful_execution_time: DateTime<Utc>,
}

/// Request sent from the dispatcher to the orchestrator endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub resource_ids: Vec<String>,
    pub detector_id: String,
    #[serde(with = "minutes")]
    pub cadence: Duration,
    pub data_end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_rule_resource_id: Option<String>,
}

/// Display sections for presentation fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertySection {
    Property,
    Analysis,
    Chart,
    AdditionalQuery,
}

impl PropertySection {
    /// Chart and query sections need a resolved query execution context
    pub fn requires_query_run_info(&self) -> bool {
        matches!(self, PropertySection::Chart | PropertySection::AdditionalQuery)
    }
}

/// A rendered presentation field of a canonical alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertProperty {
    pub section: PropertySection,
    pub name: String,
    pub title: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    pub order: u32,
}

/// Telemetry backends a chart or query can run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TelemetryKind {
    LogAnalytics,
    ApplicationInsights,
    Metrics,
}

/// Where chart and additional-query fields of an alert are executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRunInfo {
    pub kind: TelemetryKind,
    pub resource_ids: Vec<String>,
}

/// Canonical, deduplicatable alert record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalAlert {
    pub id: String,
    pub title: String,
    pub resource_id: ResourceIdentifier,
    pub correlation_hash: String,
    pub detector_id: String,
    pub detector_name: String,
    pub analysis_timestamp: DateTime<Utc>,
    pub analysis_window_minutes: u64,
    pub properties: Vec<AlertProperty>,
    pub raw_properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_run_info: Option<QueryRunInfo>,
}
