//! Detector execution
//!
//! This module provides:
//! - The [`AnalysisRunner`] seam shared by the in-process and isolated paths
//! - [`ExecutionOrchestrator`]: package fetch, load, scope resolution,
//!   module invocation under cancellation and alert canonicalization
//! - The orchestrator error taxonomy and its serializable [`FaultDescriptor`]

mod fault;
mod scope;


pub use fault::{ErrorResponse, FaultDescriptor};
pub use scope::resolve_scope;

use crate::detector::{
    AnalysisContext, AnalysisRequest, AnalysisServicesFactory, Detector, ModuleError,
};
use crate::isolation::IsolationError;
use crate::loader::{LoadError, PluginLoader};
use crate::models::{CanonicalAlert, ExecutionRequest, ResourceIdentifier, ResourceType};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::presentation::{PresentationEngine, PresentationError, RawAlert};
use crate::storage::{
    PackageRepository, QueryRunInfoProvider, ResourceInventory, StateRepositoryFactory,
    StoreError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// Type name recorded for a detector that panicked
pub const PANIC_TYPE_NAME: &str = "panic";

/// Failure of one orchestrator run
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("no package found for detector {detector_id}")]
    PackageNotFound { detector_id: String },

    #[error("repository error: {message}")]
    Repository { message: String },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Presentation(#[from] PresentationError),

    #[error("resource {resource_id} of type {requested} is not supported (supported: {supported:?})")]
    IncompatibleResourceTypes {
        resource_id: String,
        requested: ResourceType,
        supported: Vec<ResourceType>,
    },

    #[error("alert of type {alert_type} targets {resource_id}, outside the requested scope")]
    UnidentifiedAlertResource {
        alert_type: String,
        resource_id: String,
    },

    #[error("detector module raised {type_name}: {message}")]
    ModuleFault { type_name: String, message: String },

    #[error("run canceled")]
    Canceled,

    #[error(transparent)]
    Isolation(#[from] IsolationError),
}

impl OrchestratorError {
    /// HTTP status of the error at the orchestrator endpoint.
    ///
    /// No variant maps to a status the dispatcher retries.
    pub fn status_code(&self) -> u16 {
        match self {
            OrchestratorError::InvalidRequest { .. }
            | OrchestratorError::IncompatibleResourceTypes { .. } => 400,
            OrchestratorError::PackageNotFound { .. } => 404,
            OrchestratorError::Load(_) => 422,
            OrchestratorError::Canceled => 499,
            OrchestratorError::Repository { .. }
            | OrchestratorError::Presentation(_)
            | OrchestratorError::UnidentifiedAlertResource { .. }
            | OrchestratorError::ModuleFault { .. }
            | OrchestratorError::Isolation(_) => 500,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, OrchestratorError::Canceled)
    }

    /// Label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidRequest { .. } => "invalid_request",
            OrchestratorError::PackageNotFound { .. } => "package_not_found",
            OrchestratorError::Repository { .. } => "repository",
            OrchestratorError::Load(_) => "load",
            OrchestratorError::Presentation(_) => "presentation",
            OrchestratorError::IncompatibleResourceTypes { .. } => "incompatible_resource_types",
            OrchestratorError::UnidentifiedAlertResource { .. } => "unidentified_alert_resource",
            OrchestratorError::ModuleFault { .. } => "module_fault",
            OrchestratorError::Canceled => "canceled",
            OrchestratorError::Isolation(_) => "isolation",
        }
    }
}

impl From<ModuleError> for OrchestratorError {
    fn from(e: ModuleError) -> Self {
        OrchestratorError::ModuleFault {
            type_name: e.type_name().to_string(),
            message: e.message().to_string(),
        }
    }
}

/// Runs one execution request to canonical alerts
#[async_trait]
pub trait AnalysisRunner: Send + Sync {
    async fn run(
        &self,
        request: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, OrchestratorError>;
}

/// Collaborators of the orchestrator
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub packages: Arc<dyn PackageRepository>,
    pub inventory: Arc<dyn ResourceInventory>,
    pub query_info: Arc<dyn QueryRunInfoProvider>,
    pub services: Arc<dyn AnalysisServicesFactory>,
    pub state: Arc<dyn StateRepositoryFactory>,
}

/// In-process execution of detector packages
pub struct ExecutionOrchestrator {
    deps: OrchestratorDeps,
    loader: PluginLoader,
    presentation: PresentationEngine,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl ExecutionOrchestrator {
    pub fn new(loader: PluginLoader, deps: OrchestratorDeps) -> Self {
        Self {
            deps,
            loader,
            presentation: PresentationEngine::new(),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("orchestrator"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn presentation(&self) -> &PresentationEngine {
        &self.presentation
    }

    fn parse_request(
        request: &ExecutionRequest,
    ) -> Result<Vec<ResourceIdentifier>, OrchestratorError> {
        let invalid = |message: String| OrchestratorError::InvalidRequest { message };

        if request.detector_id.trim().is_empty() {
            return Err(invalid("detectorId must not be empty".to_string()));
        }
        if request.resource_ids.is_empty() {
            return Err(invalid("resourceIds must not be empty".to_string()));
        }
        if request.cadence.is_zero() {
            return Err(invalid("cadence must be positive".to_string()));
        }

        request
            .resource_ids
            .iter()
            .map(|raw| raw.parse::<ResourceIdentifier>().map_err(|e| invalid(e.to_string())))
            .collect()
    }

    async fn run_inner(
        &self,
        request: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, OrchestratorError> {
        let requested = Self::parse_request(&request)?;
        let detector_id = request.detector_id.as_str();

        if token.is_cancelled() {
            return Err(OrchestratorError::Canceled);
        }

        let package = self
            .deps
            .packages
            .get_package(detector_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => OrchestratorError::PackageNotFound {
                    detector_id: detector_id.to_string(),
                },
                other => OrchestratorError::Repository {
                    message: other.to_string(),
                },
            })?;

        let loaded = self.loader.load(&package).map_err(|e| {
            self.logger
                .log_detector_load_failed(detector_id, &e.failure.to_string());
            e
        })?;
        let manifest = loaded.manifest;
        self.logger.log_detector_loaded(
            &manifest.id,
            &manifest.version.to_string(),
            &manifest.entry_point_ref,
        );

        let scope = resolve_scope(&manifest, &requested, self.deps.inventory.as_ref()).await?;
        if scope.is_empty() {
            // Supported containers with nothing in them: nothing to analyze
            debug!(detector_id = %detector_id, "Resolved scope is empty, skipping module");
            return Ok(Vec::new());
        }

        let analysis = AnalysisRequest {
            target_resources: scope.clone(),
            data_end_time: request.data_end_time,
            cadence: request.cadence,
            alert_rule_resource_id: request.alert_rule_resource_id.clone(),
        };
        let ctx = AnalysisContext {
            services: self.deps.services.create(detector_id, &scope),
            state: self.deps.state.for_detector(detector_id),
            cancellation: token.child_token(),
        };

        let raw_alerts = Self::invoke(loaded.detector, analysis, ctx, &token).await?;

        let granted: HashSet<&ResourceIdentifier> = scope.iter().collect();
        for raw in &raw_alerts {
            if !granted.contains(raw.resource_identifier()) {
                return Err(OrchestratorError::UnidentifiedAlertResource {
                    alert_type: raw.type_name().to_string(),
                    resource_id: raw.resource_identifier().to_string(),
                });
            }
        }

        let run_info = self
            .deps
            .query_info
            .query_run_info(detector_id, &scope)
            .await
            .map_err(|e| OrchestratorError::Repository {
                message: format!("query run info: {}", e),
            })?;

        let mut per_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut alerts = Vec::with_capacity(raw_alerts.len());
        for raw in &raw_alerts {
            *per_type.entry(raw.type_name()).or_default() += 1;
            let info = run_info.get(raw.resource_identifier());
            alerts.push(self.presentation.to_canonical(
                raw.as_ref(),
                &request,
                &manifest.name,
                info,
            )?);
        }

        for (alert_type, count) in per_type {
            self.metrics
                .add_alerts_emitted(detector_id, alert_type, count as u64);
            self.logger.log_alerts_emitted(detector_id, alert_type, count);
        }

        Ok(alerts)
    }

    /// Run the module on its own task so a panic is contained, racing the
    /// caller's cancellation
    async fn invoke(
        detector: Arc<dyn Detector>,
        request: AnalysisRequest,
        ctx: AnalysisContext,
        token: &CancellationToken,
    ) -> Result<Vec<Box<dyn RawAlert>>, OrchestratorError> {
        let module_token = ctx.cancellation.clone();
        let mut handle = tokio::spawn(async move { detector.analyze(request, ctx).await });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                module_token.cancel();
                handle.abort();
                Err(OrchestratorError::Canceled)
            }
            joined = &mut handle => {
                if token.is_cancelled() {
                    return Err(OrchestratorError::Canceled);
                }
                match joined {
                    Ok(result) => result.map_err(OrchestratorError::from),
                    Err(e) if e.is_panic() => Err(OrchestratorError::ModuleFault {
                        type_name: PANIC_TYPE_NAME.to_string(),
                        message: panic_message(e.into_panic()),
                    }),
                    Err(_) => Err(OrchestratorError::Canceled),
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "detector panicked".to_string()
    }
}

#[async_trait]
impl AnalysisRunner for ExecutionOrchestrator {
    async fn run(
        &self,
        request: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, OrchestratorError> {
        let detector_id = request.detector_id.clone();
        let resources = request.resource_ids.len();
        let start = Instant::now();
        let span = info_span!("orchestrator_run", detector_id = %detector_id);

        let result = self.run_inner(request, token).instrument(span).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(alerts) => {
                self.metrics.observe_run(elapsed.as_secs_f64(), "ok");
                self.logger.log_run_completed(
                    &detector_id,
                    resources,
                    alerts.len(),
                    elapsed.as_millis() as u64,
                );
            }
            Err(OrchestratorError::Canceled) => {
                self.metrics.observe_run(elapsed.as_secs_f64(), "canceled");
                self.logger.log_run_canceled(&detector_id);
            }
            Err(e) => {
                self.metrics.observe_run(elapsed.as_secs_f64(), "failed");
                if let OrchestratorError::ModuleFault { type_name, message } = e {
                    self.metrics.inc_module_faults(&detector_id);
                    self.logger.log_module_fault(&detector_id, type_name, message);
                } else {
                    debug!(detector_id = %detector_id, kind = e.kind(), error = %e, "Run failed");
                }
            }
        }

        result
    }
}
