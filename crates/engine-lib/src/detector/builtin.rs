//! Detectors shipped with the engine
//!
//! The high-CPU detector averages `Percentage CPU` over the analysis window
//! for every target resource and raises an alert above a threshold. It keeps
//! a per-resource count of consecutive breaching windows in its state store.

use super::{AnalysisContext, AnalysisRequest, Detector, ModuleError};
use crate::loader::{DetectorCatalog, ModuleImage, TypeExport, SDK_MODULE};
use crate::models::{
    DetectorManifest, DetectorPackage, PropertySection, ResourceIdentifier, ResourceType,
};
use crate::presentation::{AlertRecord, FieldSchema, FieldValue, RawAlert};
use crate::storage::StateRepositoryExt;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

/// Module name of the builtin detectors
pub const BUILTIN_MODULE: &str = "Detector.Engine.Builtin";

/// Exported type name of [`HighCpuDetector`]
pub const HIGH_CPU_TYPE: &str = "Detector.Engine.Builtin.HighCpuDetector";

const CPU_METRIC: &str = "Percentage CPU";
const DEFAULT_THRESHOLD_PERCENT: f64 = 80.0;

/// Alert raised when average CPU exceeds the threshold
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HighCpuAlert {
    pub resource: ResourceIdentifier,
    pub metric: String,
    pub average_percent: f64,
    pub max_percent: f64,
    pub threshold_percent: f64,
    pub consecutive_breaches: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub chart_query: String,
}

impl AlertRecord for HighCpuAlert {
    const TYPE_NAME: &'static str = "Detector.Engine.Builtin.HighCpuAlert";

    fn title(&self) -> String {
        format!("High CPU on {}", self.resource.resource_name())
    }

    fn resource_identifier(&self) -> &ResourceIdentifier {
        &self.resource
    }

    fn schema() -> &'static [FieldSchema] {
        const SCHEMA: &[FieldSchema] = &[
            FieldSchema::predicate("ResourceId"),
            FieldSchema::predicate("Metric"),
            FieldSchema::presented(
                "AveragePercent",
                PropertySection::Property,
                "Average {Metric}",
                1,
            ),
            FieldSchema::presented("MaxPercent", PropertySection::Property, "Peak {Metric}", 2),
            FieldSchema::presented(
                "ConsecutiveBreaches",
                PropertySection::Analysis,
                "Consecutive windows above {ThresholdPercent}%",
                1,
            )
            .with_info("Counted from {WindowStart} to {WindowEnd}"),
            FieldSchema::presented("ChartQuery", PropertySection::Chart, "{Metric} over time", 1),
            FieldSchema::plain("ThresholdPercent"),
            FieldSchema::plain("WindowStart"),
            FieldSchema::plain("WindowEnd"),
        ];
        SCHEMA
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("ResourceId", self.resource.to_string().into()),
            ("Metric", self.metric.as_str().into()),
            ("AveragePercent", round2(self.average_percent).into()),
            ("MaxPercent", round2(self.max_percent).into()),
            ("ConsecutiveBreaches", self.consecutive_breaches.into()),
            ("ChartQuery", self.chart_query.as_str().into()),
            ("ThresholdPercent", self.threshold_percent.into()),
            ("WindowStart", self.window_start.into()),
            ("WindowEnd", self.window_end.into()),
        ]
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Raises [`HighCpuAlert`]s for resources whose average CPU is too high
pub struct HighCpuDetector {
    threshold_percent: f64,
}

impl Default for HighCpuDetector {
    fn default() -> Self {
        Self {
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
        }
    }
}

impl HighCpuDetector {
    pub fn with_threshold(threshold_percent: f64) -> Self {
        Self { threshold_percent }
    }

    fn breach_key(resource: &ResourceIdentifier) -> String {
        format!("breaches:{}", resource)
    }
}

#[async_trait]
impl Detector for HighCpuDetector {
    async fn analyze(
        &self,
        request: AnalysisRequest,
        ctx: AnalysisContext,
    ) -> Result<Vec<Box<dyn RawAlert>>, ModuleError> {
        let start = request.data_start_time();
        let end = request.data_end_time;
        let mut alerts: Vec<Box<dyn RawAlert>> = Vec::new();

        for resource in &request.target_resources {
            if ctx.cancellation.is_cancelled() {
                break;
            }

            let samples = ctx
                .services
                .query_metric(resource, CPU_METRIC, start, end)
                .await?;
            let key = Self::breach_key(resource);

            if samples.is_empty() {
                debug!(resource = %resource, "No CPU samples in window");
                continue;
            }

            let average = samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64;
            let max = samples.iter().map(|s| s.value).fold(f64::MIN, f64::max);

            if average <= self.threshold_percent {
                ctx.state.delete(&key).await?;
                continue;
            }

            let previous: u32 = ctx.state.get_json(&key).await?.unwrap_or(0);
            let breaches = previous + 1;
            ctx.state.store_json(&key, &breaches).await?;

            alerts.push(Box::new(HighCpuAlert {
                resource: resource.clone(),
                metric: CPU_METRIC.to_string(),
                average_percent: average,
                max_percent: max,
                threshold_percent: self.threshold_percent,
                consecutive_breaches: breaches,
                window_start: start,
                window_end: end,
                chart_query: format!(
                    "metric('{}') | where resource == '{}' | summarize avg(value) by bin(timestamp, 1m)",
                    CPU_METRIC, resource
                ),
            }));
        }

        Ok(alerts)
    }
}

/// Catalog of the builtin detector types
pub fn builtin_catalog() -> DetectorCatalog {
    let mut catalog = DetectorCatalog::new();
    catalog
        .register::<HighCpuDetector>(HIGH_CPU_TYPE)
        .unwrap_or_else(|e| tracing::warn!(error = %e, "Builtin detector registered twice"));
    catalog
}

/// Module image describing the builtin detectors
pub fn builtin_module_image() -> ModuleImage {
    ModuleImage {
        name: BUILTIN_MODULE.to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        exports: vec![TypeExport::concrete(HIGH_CPU_TYPE, DetectorCatalog::CAPABILITY)],
        references: vec![SDK_MODULE.to_string()],
    }
}

/// Self-contained package for the high-CPU detector
pub fn high_cpu_package() -> DetectorPackage {
    let manifest = DetectorManifest {
        id: "builtin-high-cpu".to_string(),
        name: "High CPU".to_string(),
        description: "Average CPU above threshold over the analysis window".to_string(),
        version: semver::Version::new(1, 0, 0),
        assembly_ref: BUILTIN_MODULE.to_string(),
        entry_point_ref: HIGH_CPU_TYPE.to_string(),
        supported_resource_types: BTreeSet::from([
            ResourceType::VirtualMachine,
            ResourceType::VirtualMachineScaleSet,
        ]),
        supported_cadences: [5u64, 15, 60]
            .into_iter()
            .map(|m| Duration::from_secs(m * 60))
            .collect(),
    };
    let mut content = HashMap::new();
    content.insert(BUILTIN_MODULE.to_string(), builtin_module_image().to_bytes());
    DetectorPackage { manifest, content }
}
