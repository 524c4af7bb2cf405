//! Assembly of engine components from configuration

use crate::config::{DispatchMode, EngineConfig, ExecutionMode};
use anyhow::{Context, Result};
use engine_lib::detector::{builtin_catalog, SharedAnalysisServices};
use engine_lib::health::HealthRegistry;
use engine_lib::isolation::IsolatedRunner;
use engine_lib::loader::PluginLoader;
use engine_lib::observability::StructuredLogger;
use engine_lib::orchestrator::{AnalysisRunner, ExecutionOrchestrator, OrchestratorDeps};
use engine_lib::scheduler::{
    AnalysisExecuter, Dispatcher, RunTracker, RunnerExecuter, ScheduleFlow,
};
use engine_lib::storage::{
    BlobAlertPublisher, DirectoryPackageRepository, FileRunRecordStore,
    FileStateRepositoryFactory, FsBlobStore, JsonRuleStore, LogEventSink,
    ResourceMetricsQueryRunInfoProvider, StaticResourceInventory,
};
use std::sync::Arc;
use tracing::info;

/// In-process orchestrator over the storage root
pub async fn build_orchestrator(
    config: &EngineConfig,
    logger: StructuredLogger,
) -> Result<ExecutionOrchestrator> {
    let storage = &config.storage;
    let inventory = StaticResourceInventory::load(&storage.inventory_file())
        .await
        .context("Failed to load resource inventory")?;
    info!(resources = inventory.len(), "Resource inventory loaded");

    let deps = OrchestratorDeps {
        packages: Arc::new(DirectoryPackageRepository::new(storage.packages_dir())),
        inventory: Arc::new(inventory),
        query_info: Arc::new(ResourceMetricsQueryRunInfoProvider),
        services: Arc::new(SharedAnalysisServices::default()),
        state: Arc::new(FileStateRepositoryFactory::new(storage.state_dir())),
    };
    let loader = PluginLoader::with_catalog(builtin_catalog());

    Ok(ExecutionOrchestrator::new(loader, deps).with_logger(logger))
}

/// Runner selected by `execution.mode`
pub async fn build_runner(
    config: &EngineConfig,
    logger: StructuredLogger,
) -> Result<Arc<dyn AnalysisRunner>> {
    match config.execution.mode {
        ExecutionMode::InProcess => Ok(Arc::new(build_orchestrator(config, logger).await?)),
        ExecutionMode::Isolated => {
            let isolation = config.isolation_config()?;
            info!(
                host = %isolation.host_executable.display(),
                timeout_secs = isolation.run_timeout.as_secs(),
                "Detector runs are isolated"
            );
            Ok(Arc::new(IsolatedRunner::new(isolation)))
        }
    }
}

/// Executer selected by `scheduler.dispatch`
pub async fn build_executer(
    config: &EngineConfig,
    logger: StructuredLogger,
) -> Result<Arc<dyn AnalysisExecuter>> {
    match config.scheduler.dispatch {
        DispatchMode::Remote => {
            let dispatcher = Dispatcher::new(config.dispatcher.to_config())
                .context("Invalid dispatcher configuration")?
                .with_logger(logger);
            info!(url = %dispatcher.url(), "Dispatching to remote orchestrator");
            Ok(Arc::new(dispatcher))
        }
        DispatchMode::Local => {
            let runner = build_runner(config, logger).await?;
            Ok(Arc::new(RunnerExecuter::new(
                runner,
                config.dispatcher.data_end_skew(),
            )))
        }
    }
}

pub async fn build_schedule_flow(
    config: &EngineConfig,
    health: HealthRegistry,
    logger: StructuredLogger,
) -> Result<Arc<ScheduleFlow>> {
    let storage = &config.storage;
    let executer = build_executer(config, logger.clone()).await?;
    let publisher = BlobAlertPublisher::new(FsBlobStore::new(&storage.root), LogEventSink);

    let flow = ScheduleFlow::new(
        Arc::new(JsonRuleStore::new(storage.rules_file())),
        RunTracker::new(Arc::new(FileRunRecordStore::new(storage.runs_dir()))),
        executer,
        Arc::new(publisher),
        config.scheduler.to_config(),
    )
    .with_health(health)
    .with_logger(logger);

    Ok(Arc::new(flow))
}
