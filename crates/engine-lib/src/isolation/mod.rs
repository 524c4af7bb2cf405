//! Child-process isolation of detector runs
//!
//! The parent serializes an [`ExecutionRequest`] to the child's stdin and
//! reads one [`HostResponse`] envelope from its stdout. The child is the
//! engine binary in host mode, which runs the in-process orchestrator.
//! Cancellation and the run timeout kill the child.

use crate::models::{CanonicalAlert, ExecutionRequest};
use crate::orchestrator::{AnalysisRunner, FaultDescriptor, OrchestratorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest stderr excerpt kept in a [`IsolationError::ChildProcess`]
const STDERR_EXCERPT_BYTES: usize = 4096;

/// Failure of the isolation boundary itself
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IsolationError {
    /// Host executable missing or not startable
    #[error("failed to start isolation host: {message}")]
    Setup { message: String },

    #[error("isolation host exited with {exit_code:?}: {stderr}")]
    ChildProcess {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("unreadable isolation host response: {message}")]
    Protocol { message: String },

    #[error("isolation host did not finish within {after_secs}s")]
    TimedOut { after_secs: u64 },
}

/// Envelope written by the host to stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostResponse {
    Ok { alerts: Vec<CanonicalAlert> },
    Fault { fault: FaultDescriptor },
}

impl HostResponse {
    pub fn into_result(self) -> Result<Vec<CanonicalAlert>, OrchestratorError> {
        match self {
            HostResponse::Ok { alerts } => Ok(alerts),
            HostResponse::Fault { fault } => Err(fault.into_error()),
        }
    }
}

impl From<Result<Vec<CanonicalAlert>, OrchestratorError>> for HostResponse {
    fn from(result: Result<Vec<CanonicalAlert>, OrchestratorError>) -> Self {
        match result {
            Ok(alerts) => HostResponse::Ok { alerts },
            Err(e) => HostResponse::Fault { fault: e.into() },
        }
    }
}

/// How to start the isolation host
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub host_executable: PathBuf,
    pub host_args: Vec<String>,
    pub run_timeout: Duration,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            host_executable: PathBuf::from("detector-engine"),
            host_args: vec!["host".to_string()],
            run_timeout: Duration::from_secs(600),
        }
    }
}

impl IsolationConfig {
    /// Host running the current executable with the `host` subcommand
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            host_executable: std::env::current_exe()?,
            ..Self::default()
        })
    }
}

/// Runs every request in a fresh host process
pub struct IsolatedRunner {
    config: IsolationConfig,
}

impl IsolatedRunner {
    pub fn new(config: IsolationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    async fn exchange(&self, payload: Vec<u8>) -> Result<std::process::Output, IsolationError> {
        let mut child = Command::new(&self.config.host_executable)
            .args(&self.config.host_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IsolationError::Setup {
                message: format!("{}: {}", self.config.host_executable.display(), e),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| IsolationError::Setup {
            message: "failed to capture host stdin".to_string(),
        })?;
        // A host that exits early closes its stdin; its exit status tells why
        if let Err(e) = stdin.write_all(&payload).await {
            warn!(error = %e, "Failed to write request to isolation host");
        }
        drop(stdin);

        child
            .wait_with_output()
            .await
            .map_err(|e| IsolationError::Setup {
                message: format!("failed to wait for isolation host: {}", e),
            })
    }

    fn interpret(output: std::process::Output) -> Result<Vec<CanonicalAlert>, OrchestratorError> {
        let parsed = serde_json::from_slice::<HostResponse>(&output.stdout);

        match parsed {
            Ok(response) => response.into_result(),
            Err(_) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let excerpt: String = stderr.chars().take(STDERR_EXCERPT_BYTES).collect();
                Err(IsolationError::ChildProcess {
                    exit_code: output.status.code(),
                    stderr: excerpt.trim().to_string(),
                }
                .into())
            }
            Err(e) => Err(IsolationError::Protocol {
                message: e.to_string(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl AnalysisRunner for IsolatedRunner {
    async fn run(
        &self,
        request: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, OrchestratorError> {
        let payload = serde_json::to_vec(&request).map_err(|e| IsolationError::Protocol {
            message: format!("failed to serialize request: {}", e),
        })?;

        debug!(
            detector_id = %request.detector_id,
            host = %self.config.host_executable.display(),
            "Starting isolation host"
        );

        // Dropping the exchange future drops the child, which kills it
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(OrchestratorError::Canceled),
            _ = tokio::time::sleep(self.config.run_timeout) => {
                Err(IsolationError::TimedOut {
                    after_secs: self.config.run_timeout.as_secs(),
                }
                .into())
            }
            output = self.exchange(payload) => Self::interpret(output?),
        }
    }
}

/// Serve one request in host mode: read a request from `input`, run it and
/// write the response envelope to `output`.
///
/// Returns whether the run succeeded.
pub async fn run_host<R, I, O>(
    runner: &R,
    mut input: I,
    mut output: O,
    token: CancellationToken,
) -> std::io::Result<bool>
where
    R: AnalysisRunner + ?Sized,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut payload = Vec::new();
    input.read_to_end(&mut payload).await?;

    let result = match serde_json::from_slice::<ExecutionRequest>(&payload) {
        Ok(request) => runner.run(request, token).await,
        Err(e) => Err(OrchestratorError::InvalidRequest {
            message: format!("malformed execution request: {}", e),
        }),
    };
    let succeeded = result.is_ok();

    let response = HostResponse::from(result);
    let bytes = serde_json::to_vec(&response)?;
    output.write_all(&bytes).await?;
    output.flush().await?;
    Ok(succeeded)
}

#[cfg(test)]
mod tests;
