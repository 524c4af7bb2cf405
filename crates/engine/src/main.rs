//! Detector engine - runs detector packages and schedules alert rules
//!
//! One binary, several roles: the orchestrator endpoint, the rule
//! scheduler, and the isolation host the orchestrator spawns per run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use detector_engine::{api, config::EngineConfig, runtime};
use engine_lib::{
    detector::builtin_catalog,
    health::{components, HealthRegistry},
    isolation::run_host,
    loader::PluginLoader,
    observability::StructuredLogger,
    storage::DirectoryPackageRepository,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "detector-engine", version, about = "Detector execution and scheduling engine")]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, global = true, env = "DETECTOR_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the orchestrator endpoint
    Serve,
    /// Run the rule scheduler until interrupted
    Schedule,
    /// Run a single scheduler tick and exit
    Tick,
    /// Isolation host: one request on stdin, one result on stdout
    Host,
    /// Check that a package directory loads
    Validate {
        /// Directory holding manifest.json and the package modules
        package_dir: PathBuf,
    },
}

fn init_tracing(to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // Host mode owns stdout for the result envelope
    if to_stderr {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Token cancelled on Ctrl-C
fn shutdown_on_ctrl_c(logger: StructuredLogger) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logger.log_shutdown("SIGINT received");
        }
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Command::Host));

    let config = EngineConfig::load(cli.config.as_deref())?;
    let logger = StructuredLogger::new(&config.instance);

    match cli.command {
        Command::Serve => serve(&config, logger).await,
        Command::Schedule => schedule(&config, logger).await,
        Command::Tick => tick(&config, logger).await,
        Command::Host => host(&config, logger).await,
        Command::Validate { package_dir } => validate(&package_dir, logger).await,
    }
}

async fn serve(config: &EngineConfig, logger: StructuredLogger) -> Result<ExitCode> {
    logger.log_startup(ENGINE_VERSION, "serve");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::ORCHESTRATOR).await;

    let runner = runtime::build_runner(config, logger.clone()).await?;
    let state = Arc::new(api::AppState::new(health_registry.clone(), runner));
    health_registry.set_ready(true).await;

    let shutdown = shutdown_on_ctrl_c(logger);
    api::serve(config.server.port, api::create_router(state), shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

async fn schedule(config: &EngineConfig, logger: StructuredLogger) -> Result<ExitCode> {
    logger.log_startup(ENGINE_VERSION, "schedule");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::DISPATCHER).await;
    health_registry.register(components::PUBLISHER).await;

    let flow = runtime::build_schedule_flow(config, health_registry.clone(), logger.clone()).await?;
    health_registry.set_ready(true).await;

    let shutdown = shutdown_on_ctrl_c(logger);
    let health_server = tokio::spawn(api::serve(
        config.server.port,
        api::health_router(health_registry),
        shutdown.clone(),
    ));

    flow.run(shutdown.clone()).await;
    shutdown.cancel();

    health_server.await.context("Health server task failed")??;
    Ok(ExitCode::SUCCESS)
}

async fn tick(config: &EngineConfig, logger: StructuredLogger) -> Result<ExitCode> {
    logger.log_startup(ENGINE_VERSION, "tick");

    let flow = runtime::build_schedule_flow(config, HealthRegistry::new(), logger.clone()).await?;
    let summary = flow.tick(shutdown_on_ctrl_c(logger)).await;

    info!(
        due = summary.due,
        succeeded = summary.succeeded,
        failed = summary.failed,
        canceled = summary.canceled,
        skipped_in_flight = summary.skipped_in_flight,
        "Tick finished"
    );

    Ok(if summary.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn host(config: &EngineConfig, logger: StructuredLogger) -> Result<ExitCode> {
    let orchestrator = runtime::build_orchestrator(config, logger.clone()).await?;
    let token = shutdown_on_ctrl_c(logger);

    let succeeded = run_host(
        &orchestrator,
        tokio::io::stdin(),
        tokio::io::stdout(),
        token,
    )
    .await
    .context("Failed to exchange with the parent process")?;

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn validate(package_dir: &Path, logger: StructuredLogger) -> Result<ExitCode> {
    let package = DirectoryPackageRepository::read_package_dir(package_dir)
        .await
        .with_context(|| format!("Failed to read package at {}", package_dir.display()))?;
    let manifest = &package.manifest;

    match PluginLoader::with_catalog(builtin_catalog()).load(&package) {
        Ok(loaded) => {
            logger.log_detector_loaded(
                &manifest.id,
                &manifest.version.to_string(),
                &manifest.entry_point_ref,
            );
            println!(
                "{} {}: ok ({})",
                loaded.manifest.id, loaded.manifest.version, loaded.manifest.entry_point_ref
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            logger.log_detector_load_failed(&manifest.id, &e.to_string());
            error!(detector_id = %manifest.id, error = %e, "Package failed validation");
            println!("{} {}: {}", manifest.id, manifest.version, e);
            Ok(ExitCode::FAILURE)
        }
    }
}
