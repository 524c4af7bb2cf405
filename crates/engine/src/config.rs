//! Engine configuration
//!
//! Values come from built-in defaults, then an optional config file, then
//! environment variables such as `DETECTOR_ENGINE_SCHEDULER__TICK_INTERVAL_SECS`.

use anyhow::{bail, Context, Result};
use engine_lib::isolation::IsolationConfig;
use engine_lib::scheduler::{DispatcherConfig, SchedulerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "DETECTOR_ENGINE";

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub dispatcher: DispatcherSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Absolute path of the file this configuration was read from
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "detector-engine".to_string())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Where detector code runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    InProcess,
    Isolated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_mode")]
    pub mode: ExecutionMode,

    /// Host binary for isolated runs; defaults to the running executable
    #[serde(default)]
    pub host_executable: Option<PathBuf>,

    #[serde(default = "default_host_args")]
    pub host_args: Vec<String>,

    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Isolated
}

fn default_host_args() -> Vec<String> {
    vec!["host".to_string()]
}

fn default_run_timeout() -> u64 {
    600
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: default_execution_mode(),
            host_executable: None,
            host_args: default_host_args(),
            run_timeout_secs: default_run_timeout(),
        }
    }
}

impl ExecutionConfig {
    pub fn isolation_config(&self) -> Result<IsolationConfig> {
        let host_executable = match &self.host_executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().context("Failed to locate the engine executable")?,
        };
        Ok(IsolationConfig {
            host_executable,
            host_args: self.host_args.clone(),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,

    /// How far the analyzed window ends before the tick time
    #[serde(default = "default_data_end_skew")]
    pub data_end_skew_secs: u64,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_request_timeout() -> u64 {
    660
}

fn default_overall_timeout() -> u64 {
    900
}

fn default_data_end_skew() -> u64 {
    300
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            request_timeout_secs: default_request_timeout(),
            overall_timeout_secs: default_overall_timeout(),
            data_end_skew_secs: default_data_end_skew(),
        }
    }
}

impl DispatcherSection {
    pub fn to_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            endpoint: self.endpoint.clone(),
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_factor: self.backoff_factor,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            overall_timeout: Duration::from_secs(self.overall_timeout_secs),
            data_end_skew: self.data_end_skew(),
        }
    }

    pub fn data_end_skew(&self) -> Duration {
        Duration::from_secs(self.data_end_skew_secs)
    }
}

/// How the scheduler reaches the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// HTTP to `dispatcher.endpoint`
    Remote,
    /// Run the orchestrator inside the scheduler process
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_max_concurrent_rules")]
    pub max_concurrent_rules: usize,

    #[serde(default = "default_dispatch_mode")]
    pub dispatch: DispatchMode,
}

fn default_tick_interval() -> u64 {
    300
}

fn default_max_concurrent_rules() -> usize {
    4
}

fn default_dispatch_mode() -> DispatchMode {
    DispatchMode::Remote
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_concurrent_rules: default_max_concurrent_rules(),
            dispatch: default_dispatch_mode(),
        }
    }
}

impl SchedulerSection {
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            max_concurrent_rules: self.max_concurrent_rules,
        }
    }
}

/// Layout of the storage root
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl StorageConfig {
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    pub fn rules_file(&self) -> PathBuf {
        self.root.join("rules.json")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn inventory_file(&self) -> PathBuf {
        self.root.join("inventory.json")
    }
}

impl EngineConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut engine: Self = config
            .try_deserialize()
            .context("Invalid engine configuration")?;
        engine.validate()?;

        if let Some(path) = path {
            let absolute = std::fs::canonicalize(path)
                .with_context(|| format!("Failed to resolve {}", path.display()))?;
            engine.source_file = Some(absolute);
        }
        Ok(engine)
    }

    /// How to start the isolation host. The host re-reads the same config
    /// file, so it sees the same storage root and settings as this process.
    pub fn isolation_config(&self) -> Result<IsolationConfig> {
        let mut isolation = self.execution.isolation_config()?;
        if let Some(file) = &self.source_file {
            let file = file
                .to_str()
                .with_context(|| format!("Config path {} is not UTF-8", file.display()))?;
            isolation.host_args.push("--config".to_string());
            isolation.host_args.push(file.to_string());
        }
        Ok(isolation)
    }

    /// Reject timeout combinations under which remote runs can never finish
    fn validate(&self) -> Result<()> {
        let dispatcher = &self.dispatcher;
        if self.scheduler.dispatch == DispatchMode::Remote
            && dispatcher.request_timeout_secs <= self.execution.run_timeout_secs
        {
            bail!(
                "dispatcher.request_timeout_secs ({}) must exceed execution.run_timeout_secs ({})",
                dispatcher.request_timeout_secs,
                self.execution.run_timeout_secs
            );
        }
        if dispatcher.overall_timeout_secs < dispatcher.request_timeout_secs {
            bail!(
                "dispatcher.overall_timeout_secs ({}) must be at least request_timeout_secs ({})",
                dispatcher.overall_timeout_secs,
                dispatcher.request_timeout_secs
            );
        }
        Ok(())
    }
}
