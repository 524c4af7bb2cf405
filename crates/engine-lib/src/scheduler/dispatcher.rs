//! Remote execution of due rules
//!
//! The dispatcher turns an [`ExecutionInfo`] into an [`ExecutionRequest`]
//! and posts it to the orchestrator endpoint. Only the transport is retried:
//! connection failures and gateway-style statuses back off exponentially,
//! while orchestrator verdicts such as incompatible resource types come back
//! on the first attempt.

use crate::models::{CanonicalAlert, ExecutionInfo, ExecutionRequest};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::orchestrator::{AnalysisRunner, ErrorResponse, FaultDescriptor};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Route of the orchestrator endpoint
pub const ANALYSIS_PATH: &str = "/api/v1/analysis";

/// Statuses worth another attempt
const RETRYABLE_STATUSES: [u16; 5] = [408, 429, 502, 503, 504];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatcher setup: {0}")]
    Setup(String),

    #[error("transport failure after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },

    /// The orchestrator may still be running the module, so this is not retried
    #[error("orchestrator did not answer attempt {attempt} within {after:?}")]
    RequestTimedOut { attempt: u32, after: Duration },

    #[error("orchestrator returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
        fault: Option<FaultDescriptor>,
    },

    #[error("failed to decode orchestrator response: {0}")]
    Decode(String),

    #[error("dispatch canceled")]
    Canceled,

    #[error("dispatch did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

impl DispatchError {
    /// Canceled locally or reported canceled by the orchestrator
    pub fn is_canceled(&self) -> bool {
        match self {
            DispatchError::Canceled => true,
            DispatchError::Status {
                fault: Some(fault), ..
            } => fault.is_canceled(),
            _ => false,
        }
    }

    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Setup(_) => "setup",
            DispatchError::Transport { .. } => "transport",
            DispatchError::RequestTimedOut { .. } => "request_timeout",
            DispatchError::Status { .. } => "status",
            DispatchError::Decode(_) => "decode",
            DispatchError::Canceled => "canceled",
            DispatchError::DeadlineExceeded(_) => "deadline",
        }
    }
}

/// Runs a due rule against a set of resources
#[async_trait]
pub trait AnalysisExecuter: Send + Sync {
    async fn execute(
        &self,
        info: &ExecutionInfo,
        resource_ids: &[String],
        token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, DispatchError>;
}

/// Request for a due rule. The data end time lags the tick time by `skew`
/// so the telemetry backend has ingested the window being analyzed.
pub fn build_request(
    info: &ExecutionInfo,
    resource_ids: &[String],
    skew: Duration,
) -> ExecutionRequest {
    let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
    ExecutionRequest {
        resource_ids: resource_ids.to_vec(),
        detector_id: info.rule.detector_id.clone(),
        cadence: info.rule.cadence,
        data_end_time: info.current_execution_time - skew,
        alert_rule_resource_id: Some(info.rule.id.clone()),
    }
}

/// Configuration for the HTTP dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Orchestrator base URL (e.g., "http://detector-engine:8080")
    pub endpoint: String,
    /// Attempts per request, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Timeout of a single attempt; keep it above the orchestrator's run timeout
    pub request_timeout: Duration,
    /// Deadline across all attempts and backoff sleeps
    pub overall_timeout: Duration,
    pub data_end_skew: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(660),
            overall_timeout: Duration::from_secs(900),
            data_end_skew: Duration::from_secs(5 * 60),
        }
    }
}

fn next_backoff(current: Duration, factor: f64, max: Duration) -> Duration {
    current.mul_f64(factor.max(1.0)).min(max)
}

/// Outcome of one attempt
enum AttemptError {
    Retryable(DispatchError),
    Fatal(DispatchError),
}

/// HTTP client for the orchestrator endpoint
pub struct Dispatcher {
    config: DispatcherConfig,
    url: Url,
    client: Client,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatchError> {
        if config.max_attempts == 0 {
            return Err(DispatchError::Setup(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let url = Url::parse(&config.endpoint)
            .and_then(|base| base.join(ANALYSIS_PATH))
            .map_err(|e| {
                DispatchError::Setup(format!("invalid endpoint {}: {}", config.endpoint, e))
            })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DispatchError::Setup(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            url,
            client,
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("dispatcher"),
        })
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Full URL requests are posted to
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn attempt(
        &self,
        request: &ExecutionRequest,
        attempt: u32,
    ) -> Result<Vec<CanonicalAlert>, AttemptError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Fatal(DispatchError::RequestTimedOut {
                        attempt,
                        after: self.config.request_timeout,
                    })
                } else {
                    AttemptError::Retryable(DispatchError::Transport {
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Vec<CanonicalAlert>>()
                .await
                .map_err(|e| AttemptError::Fatal(DispatchError::Decode(e.to_string())));
        }

        let body = response.text().await.unwrap_or_default();
        let fault = serde_json::from_str::<ErrorResponse>(&body)
            .ok()
            .and_then(|r| r.fault);
        let error = DispatchError::Status {
            status: status.as_u16(),
            body,
            fault,
        };

        if is_retryable(status) {
            Err(AttemptError::Retryable(error))
        } else {
            Err(AttemptError::Fatal(error))
        }
    }

    async fn send_with_retry(
        &self,
        request: &ExecutionRequest,
    ) -> Result<Vec<CanonicalAlert>, DispatchError> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.metrics.inc_dispatch_attempts();

            let error = match self.attempt(request, attempt).await {
                Ok(alerts) => return Ok(alerts),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable(e)) => e,
            };

            if attempt >= self.config.max_attempts {
                return Err(error);
            }

            self.logger.log_dispatch_retry(
                &request.detector_id,
                attempt,
                backoff.as_millis() as u64,
                &error.to_string(),
            );
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, self.config.backoff_factor, self.config.max_backoff);
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

#[async_trait]
impl AnalysisExecuter for Dispatcher {
    async fn execute(
        &self,
        info: &ExecutionInfo,
        resource_ids: &[String],
        token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, DispatchError> {
        let request = build_request(info, resource_ids, self.config.data_end_skew);
        debug!(
            rule_id = %info.rule.id,
            detector_id = %request.detector_id,
            url = %self.url,
            "Posting execution request"
        );

        let deadline = self.config.overall_timeout;
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DispatchError::Canceled),
            outcome = tokio::time::timeout(deadline, self.send_with_retry(&request)) => {
                outcome.unwrap_or(Err(DispatchError::DeadlineExceeded(deadline)))
            }
        };

        if let Err(e) = &result {
            if !e.is_canceled() {
                self.metrics.inc_dispatch_failures(e.kind());
            }
        }
        result
    }
}

/// Builder for [`Dispatcher`]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.config.overall_timeout = timeout;
        self
    }

    pub fn data_end_skew(mut self, skew: Duration) -> Self {
        self.config.data_end_skew = skew;
        self
    }

    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        Dispatcher::new(self.config)
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes rules against an in-process runner, skipping the network.
///
/// Orchestrator errors surface as [`DispatchError::Status`] with the fault
/// attached, the same shape the HTTP path produces.
pub struct RunnerExecuter {
    runner: Arc<dyn AnalysisRunner>,
    data_end_skew: Duration,
}

impl RunnerExecuter {
    pub fn new(runner: Arc<dyn AnalysisRunner>, data_end_skew: Duration) -> Self {
        Self {
            runner,
            data_end_skew,
        }
    }
}

#[async_trait]
impl AnalysisExecuter for RunnerExecuter {
    async fn execute(
        &self,
        info: &ExecutionInfo,
        resource_ids: &[String],
        token: CancellationToken,
    ) -> Result<Vec<CanonicalAlert>, DispatchError> {
        let request = build_request(info, resource_ids, self.data_end_skew);
        self.runner.run(request, token).await.map_err(|e| {
            let fault = FaultDescriptor::from(&e);
            DispatchError::Status {
                status: fault.status,
                body: fault.message.clone(),
                fault: Some(fault),
            }
        })
    }
}
