//! Detector module contract
//!
//! Detectors are pluggable analysis modules. The engine hands each one the
//! resolved resource scope, the analysis window and a few service handles,
//! and gets back raw alerts for the presentation engine.

mod builtin;

pub use builtin::{
    builtin_catalog, builtin_module_image, high_cpu_package, HighCpuAlert, HighCpuDetector,
    BUILTIN_MODULE, HIGH_CPU_TYPE,
};

use crate::models::ResourceIdentifier;
use crate::presentation::RawAlert;
use crate::storage::StateRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Request handed to a detector's analyze entry point
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub target_resources: Vec<ResourceIdentifier>,
    pub data_end_time: DateTime<Utc>,
    pub cadence: Duration,
    pub alert_rule_resource_id: Option<String>,
}

impl AnalysisRequest {
    /// Start of the analysis window
    pub fn data_start_time(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.cadence).unwrap_or(chrono::Duration::zero());
        self.data_end_time - window
    }
}

/// Handles passed to a detector for one invocation
#[derive(Clone)]
pub struct AnalysisContext {
    pub services: Arc<dyn AnalysisServices>,
    pub state: Arc<dyn StateRepository>,
    /// Cancelled when the run is abandoned; detectors may ignore it
    pub cancellation: CancellationToken,
}

/// A single metric sample returned by telemetry queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Telemetry query failure
#[derive(Debug, Error)]
#[error("telemetry query failed: {0}")]
pub struct TelemetryError(pub String);

/// Telemetry services available to detectors.
///
/// Concrete log and metrics clients live outside this crate.
#[async_trait]
pub trait AnalysisServices: Send + Sync {
    async fn query_metric(
        &self,
        resource: &ResourceIdentifier,
        metric: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, TelemetryError>;
}

/// Services with no telemetry backend; every query returns no samples
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnalysisServices;

#[async_trait]
impl AnalysisServices for NullAnalysisServices {
    async fn query_metric(
        &self,
        _resource: &ResourceIdentifier,
        _metric: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, TelemetryError> {
        Ok(Vec::new())
    }
}

/// Error raised by detector code.
///
/// Converts from any error type with `?` and keeps the source type's name
/// as a string, so it can be reported where that type is unknown.
pub struct ModuleError {
    type_name: String,
    message: String,
}

impl ModuleError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Error with a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("ModuleError", message)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl<E> From<E> for ModuleError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(std::any::type_name::<E>(), error.to_string())
    }
}

impl fmt::Debug for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleError")
            .field("type_name", &self.type_name)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// A pluggable analysis module
#[async_trait]
pub trait Detector: Send + Sync {
    async fn analyze(
        &self,
        request: AnalysisRequest,
        ctx: AnalysisContext,
    ) -> Result<Vec<Box<dyn RawAlert>>, ModuleError>;
}

/// Creates the analysis services handle for one run
pub trait AnalysisServicesFactory: Send + Sync {
    fn create(
        &self,
        detector_id: &str,
        resources: &[ResourceIdentifier],
    ) -> Arc<dyn AnalysisServices>;
}

/// Factory handing out the same services instance to every run
pub struct SharedAnalysisServices(pub Arc<dyn AnalysisServices>);

impl AnalysisServicesFactory for SharedAnalysisServices {
    fn create(
        &self,
        _detector_id: &str,
        _resources: &[ResourceIdentifier],
    ) -> Arc<dyn AnalysisServices> {
        self.0.clone()
    }
}

impl Default for SharedAnalysisServices {
    fn default() -> Self {
        Self(Arc::new(NullAnalysisServices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("quota exhausted")]
    struct QuotaError;

    fn failing() -> Result<(), ModuleError> {
        Err::<(), _>(QuotaError)?;
        Ok(())
    }

    #[test]
    fn test_module_error_keeps_source_type_name() {
        let err = failing().unwrap_err();
        assert!(err.type_name().ends_with("QuotaError"));
        assert_eq!(err.message(), "quota exhausted");
    }

    #[test]
    fn test_data_start_time() {
        let end = Utc::now();
        let request = AnalysisRequest {
            target_resources: Vec::new(),
            data_end_time: end,
            cadence: Duration::from_secs(600),
            alert_rule_resource_id: None,
        };
        assert_eq!(end - request.data_start_time(), chrono::Duration::minutes(10));
    }
}
