//! Conversion of raw detector output into canonical alerts
//!
//! The engine:
//! - Builds a field metadata table once per alert type and caches it
//! - Renders field values and collects raw, predicate and presentation fields
//! - Derives the per-instance alert id and the predicate correlation hash

mod schema;

pub use schema::{
    AlertRecord, FieldSchema, FieldValue, PresentationSpec, RawAlert, TIMESTAMP_FORMAT,
};

use crate::models::{
    AlertProperty, CanonicalAlert, ExecutionRequest, PropertySection, QueryRunInfo,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Separator used when joining hash inputs
const HASH_SEPARATOR: &str = "##";

/// Errors raised while converting a raw alert
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PresentationError {
    /// Chart or query field present but no query execution context resolved
    #[error("alert type {alert_type} field {field} in section {section:?} requires query run info")]
    MissingQueryRunInfo {
        alert_type: String,
        field: String,
        section: PropertySection,
    },

    /// Request or alert could not be serialized for hashing
    #[error("failed to serialize {alert_type}: {message}")]
    Serialization { alert_type: String, message: String },
}

/// Field metadata of one alert type, keyed by field name
#[derive(Debug)]
pub struct FieldTable {
    fields: HashMap<&'static str, FieldSchema>,
}

impl FieldTable {
    fn build(schema: &'static [FieldSchema]) -> Self {
        Self {
            fields: schema.iter().map(|f| (f.name, *f)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Hex-encoded SHA-256 of the UTF-8 input
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Correlation hash over predicate fields, ordered by field name
pub fn correlation_hash(predicates: &BTreeMap<String, String>) -> String {
    let joined = predicates
        .iter()
        .map(|(k, v)| format!("{}|{}", k, v))
        .collect::<Vec<_>>()
        .join(HASH_SEPARATOR);
    sha256_hex(&joined)
}

/// Replace `{FieldName}` placeholders with rendered field values.
/// Unknown placeholders are left as written.
pub fn interpolate(template: &str, values: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Converts raw alerts into canonical alerts
#[derive(Default)]
pub struct PresentationEngine {
    tables: DashMap<&'static str, Arc<FieldTable>>,
}

impl PresentationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field table for the alert's type, built on first use
    pub fn field_table(&self, raw: &dyn RawAlert) -> Arc<FieldTable> {
        self.tables
            .entry(raw.type_name())
            .or_insert_with(|| Arc::new(FieldTable::build(raw.schema())))
            .clone()
    }

    /// Number of alert types with a cached table
    pub fn cached_types(&self) -> usize {
        self.tables.len()
    }

    pub fn to_canonical(
        &self,
        raw: &dyn RawAlert,
        request: &ExecutionRequest,
        detector_name: &str,
        query_run_info: Option<&QueryRunInfo>,
    ) -> Result<CanonicalAlert, PresentationError> {
        let alert_type = raw.type_name();
        let table = self.field_table(raw);

        let rendered: Vec<(&'static str, String)> = raw
            .fields()
            .into_iter()
            .map(|(name, value)| (name, value.render()))
            .collect();
        let lookup: HashMap<&str, String> = rendered
            .iter()
            .map(|(name, value)| (*name, value.clone()))
            .collect();

        let mut raw_properties = BTreeMap::new();
        let mut predicates = BTreeMap::new();
        let mut properties = Vec::new();

        for (name, value) in &rendered {
            if value.is_empty() {
                continue;
            }
            raw_properties.insert(name.to_string(), value.clone());

            let Some(schema) = table.get(name) else {
                continue;
            };

            if schema.predicate {
                predicates.insert(name.to_string(), value.clone());
            }

            if let Some(spec) = schema.presentation {
                if spec.section.requires_query_run_info() && query_run_info.is_none() {
                    return Err(PresentationError::MissingQueryRunInfo {
                        alert_type: alert_type.to_string(),
                        field: name.to_string(),
                        section: spec.section,
                    });
                }

                properties.push(AlertProperty {
                    section: spec.section,
                    name: name.to_string(),
                    title: interpolate(spec.title, &lookup),
                    value: value.clone(),
                    info: spec.info.map(|info| interpolate(info, &lookup)),
                    order: spec.order,
                });
            }
        }

        properties.sort_by(|a, b| {
            (a.section, a.order, &a.name).cmp(&(b.section, b.order, &b.name))
        });

        let serialization_error = |e: serde_json::Error| PresentationError::Serialization {
            alert_type: alert_type.to_string(),
            message: e.to_string(),
        };
        let request_json = serde_json::to_string(request).map_err(serialization_error)?;
        let alert_json = raw.serialized().map_err(serialization_error)?;
        let id = sha256_hex(&[alert_type, &request_json, &alert_json].join(HASH_SEPARATOR));

        Ok(CanonicalAlert {
            id,
            title: raw.title(),
            resource_id: raw.resource_identifier().clone(),
            correlation_hash: correlation_hash(&predicates),
            detector_id: request.detector_id.clone(),
            detector_name: detector_name.to_string(),
            analysis_timestamp: request.data_end_time,
            analysis_window_minutes: request.cadence.as_secs() / 60,
            properties,
            raw_properties,
            query_run_info: query_run_info.cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceIdentifier, ResourceType, TelemetryKind};
    use chrono::{TimeZone, Utc};
    use serde::Serialize;
    use std::time::Duration;

    #[derive(Serialize)]
    struct DiskAlert {
        resource: ResourceIdentifier,
        disk: String,
        free_percent: f64,
        observed_at: Option<chrono::DateTime<Utc>>,
    }

    impl AlertRecord for DiskAlert {
        const TYPE_NAME: &'static str = "Tests.DiskAlert";

        fn title(&self) -> String {
            format!("Low disk space on {}", self.disk)
        }

        fn resource_identifier(&self) -> &ResourceIdentifier {
            &self.resource
        }

        fn schema() -> &'static [FieldSchema] {
            const SCHEMA: &[FieldSchema] = &[
                FieldSchema::predicate("Disk"),
                FieldSchema::presented(
                    "FreePercent",
                    PropertySection::Property,
                    "Free space on {Disk}",
                    1,
                ),
                FieldSchema::presented("ObservedAt", PropertySection::Analysis, "Observed", 2)
                    .with_info("Last sample for {Disk} at {ObservedAt}"),
            ];
            SCHEMA
        }

        fn fields(&self) -> Vec<(&'static str, FieldValue)> {
            vec![
                ("Disk", self.disk.clone().into()),
                ("FreePercent", self.free_percent.into()),
                ("ObservedAt", self.observed_at.into()),
            ]
        }
    }

    #[derive(Serialize)]
    struct ChartAlert {
        resource: ResourceIdentifier,
        query: String,
    }

    impl AlertRecord for ChartAlert {
        const TYPE_NAME: &'static str = "Tests.ChartAlert";

        fn title(&self) -> String {
            "Chart".to_string()
        }

        fn resource_identifier(&self) -> &ResourceIdentifier {
            &self.resource
        }

        fn schema() -> &'static [FieldSchema] {
            const SCHEMA: &[FieldSchema] = &[FieldSchema::presented(
                "Query",
                PropertySection::Chart,
                "CPU over time",
                1,
            )];
            SCHEMA
        }

        fn fields(&self) -> Vec<(&'static str, FieldValue)> {
            vec![("Query", self.query.clone().into())]
        }
    }

    fn vm() -> ResourceIdentifier {
        ResourceIdentifier::resource(ResourceType::VirtualMachine, "s", "g", "vm1").unwrap()
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            resource_ids: vec![vm().to_string()],
            detector_id: "disk".to_string(),
            cadence: Duration::from_secs(3600),
            data_end_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            alert_rule_resource_id: None,
        }
    }

    fn disk_alert(disk: &str, free: f64) -> DiskAlert {
        DiskAlert {
            resource: vm(),
            disk: disk.to_string(),
            free_percent: free,
            observed_at: None,
        }
    }

    #[test]
    fn test_same_predicates_share_correlation_but_not_id() {
        let engine = PresentationEngine::new();
        let a = engine
            .to_canonical(&disk_alert("C:", 4.0), &request(), "Disk", None)
            .unwrap();
        let b = engine
            .to_canonical(&disk_alert("C:", 7.5), &request(), "Disk", None)
            .unwrap();

        assert_eq!(a.correlation_hash, b.correlation_hash);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_different_predicates_change_correlation() {
        let engine = PresentationEngine::new();
        let a = engine
            .to_canonical(&disk_alert("C:", 4.0), &request(), "Disk", None)
            .unwrap();
        let b = engine
            .to_canonical(&disk_alert("D:", 4.0), &request(), "Disk", None)
            .unwrap();

        assert_ne!(a.correlation_hash, b.correlation_hash);
    }

    #[test]
    fn test_conversion_is_deterministic() {
        let engine = PresentationEngine::new();
        let a = engine
            .to_canonical(&disk_alert("C:", 4.0), &request(), "Disk", None)
            .unwrap();
        let b = PresentationEngine::new()
            .to_canonical(&disk_alert("C:", 4.0), &request(), "Disk", None)
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.id.len(), 64);
        assert_eq!(
            a.correlation_hash,
            sha256_hex("Disk|C:"),
            "correlation hash covers predicate fields only"
        );
    }

    #[test]
    fn test_null_fields_are_skipped_and_titles_interpolated() {
        let engine = PresentationEngine::new();
        let alert = engine
            .to_canonical(&disk_alert("C:", 4.0), &request(), "Disk", None)
            .unwrap();

        assert!(!alert.raw_properties.contains_key("ObservedAt"));
        assert_eq!(alert.raw_properties["FreePercent"], "4");
        assert_eq!(alert.properties.len(), 1);
        assert_eq!(alert.properties[0].title, "Free space on C:");
        assert_eq!(alert.analysis_window_minutes, 60);
        assert_eq!(alert.detector_id, "disk");
        assert_eq!(alert.title, "Low disk space on C:");
    }

    #[test]
    fn test_properties_sorted_by_section() {
        let engine = PresentationEngine::new();
        let mut raw = disk_alert("C:", 4.0);
        raw.observed_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 55, 0).unwrap());

        let alert = engine.to_canonical(&raw, &request(), "Disk", None).unwrap();

        let sections: Vec<_> = alert.properties.iter().map(|p| p.section).collect();
        assert_eq!(sections, vec![PropertySection::Property, PropertySection::Analysis]);
        assert_eq!(
            alert.properties[1].info.as_deref(),
            Some("Last sample for C: at 2024-01-01 11:55:00Z")
        );
    }

    #[test]
    fn test_chart_requires_query_run_info() {
        let engine = PresentationEngine::new();
        let raw = ChartAlert {
            resource: vm(),
            query: "Perf | where CounterName == 'cpu'".to_string(),
        };

        let err = engine
            .to_canonical(&raw, &request(), "Cpu", None)
            .unwrap_err();
        assert!(matches!(
            err,
            PresentationError::MissingQueryRunInfo { section: PropertySection::Chart, .. }
        ));

        let info = QueryRunInfo {
            kind: TelemetryKind::LogAnalytics,
            resource_ids: vec!["/subscriptions/s/resourceGroups/g/providers/Microsoft.OperationalInsights/workspaces/w".to_string()],
        };
        let alert = engine
            .to_canonical(&raw, &request(), "Cpu", Some(&info))
            .unwrap();
        assert_eq!(alert.query_run_info, Some(info));
    }

    #[test]
    fn test_field_table_cached_per_type() {
        let engine = PresentationEngine::new();
        engine
            .to_canonical(&disk_alert("C:", 1.0), &request(), "Disk", None)
            .unwrap();
        engine
            .to_canonical(&disk_alert("D:", 2.0), &request(), "Disk", None)
            .unwrap();

        assert_eq!(engine.cached_types(), 1);
        let first = engine.field_table(&disk_alert("C:", 1.0));
        let second = engine.field_table(&disk_alert("E:", 3.0));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_interpolate_leaves_unknown_placeholders() {
        let mut values = HashMap::new();
        values.insert("Name", "vm1".to_string());

        assert_eq!(interpolate("Host {Name}", &values), "Host vm1");
        assert_eq!(interpolate("{Missing} {Name}", &values), "{Missing} vm1");
        assert_eq!(interpolate("open {Name", &values), "open {Name");
    }
}
