//! Observability infrastructure for the detector engine
//!
//! Provides:
//! - Prometheus metrics (run latency, alerts per type, dispatch retries, tick outcomes)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for run and tick durations (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    run_duration_seconds: Histogram,
    runs_total: IntCounterVec,
    alerts_emitted: IntCounterVec,
    module_faults: IntCounterVec,
    dispatch_attempts: IntCounter,
    dispatch_failures: IntCounterVec,
    tick_duration_seconds: Histogram,
    rules_due: IntCounter,
    rules_succeeded: IntCounter,
    rules_failed: IntCounter,
    rules_canceled: IntCounter,
    rules_skipped_in_flight: IntCounter,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            run_duration_seconds: register_histogram!(
                "detector_engine_run_duration_seconds",
                "Time spent in one orchestrator run, load to canonical alerts",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register run_duration_seconds"),

            runs_total: register_int_counter_vec!(
                "detector_engine_runs_total",
                "Orchestrator runs by outcome",
                &["outcome"]
            )
            .expect("Failed to register runs_total"),

            alerts_emitted: register_int_counter_vec!(
                "detector_engine_alerts_emitted_total",
                "Alerts returned by detectors, per detector and alert type",
                &["detector_id", "alert_type"]
            )
            .expect("Failed to register alerts_emitted"),

            module_faults: register_int_counter_vec!(
                "detector_engine_module_faults_total",
                "Faults raised by detector module code",
                &["detector_id"]
            )
            .expect("Failed to register module_faults"),

            dispatch_attempts: register_int_counter!(
                "detector_engine_dispatch_attempts_total",
                "HTTP attempts made by the dispatcher, retries included"
            )
            .expect("Failed to register dispatch_attempts"),

            dispatch_failures: register_int_counter_vec!(
                "detector_engine_dispatch_failures_total",
                "Dispatches that ended in an error, by kind",
                &["kind"]
            )
            .expect("Failed to register dispatch_failures"),

            tick_duration_seconds: register_histogram!(
                "detector_engine_tick_duration_seconds",
                "Time spent in one scheduler tick",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            rules_due: register_int_counter!(
                "detector_engine_rules_due_total",
                "Rules found due across all ticks"
            )
            .expect("Failed to register rules_due"),

            rules_succeeded: register_int_counter!(
                "detector_engine_rules_succeeded_total",
                "Rules dispatched, published and marked successful"
            )
            .expect("Failed to register rules_succeeded"),

            rules_failed: register_int_counter!(
                "detector_engine_rules_failed_total",
                "Rules whose dispatch or publish failed"
            )
            .expect("Failed to register rules_failed"),

            rules_canceled: register_int_counter!(
                "detector_engine_rules_canceled_total",
                "Rules abandoned because of cancellation"
            )
            .expect("Failed to register rules_canceled"),

            rules_skipped_in_flight: register_int_counter!(
                "detector_engine_rules_skipped_in_flight_total",
                "Due rules skipped because a previous tick still runs them"
            )
            .expect("Failed to register rules_skipped_in_flight"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    /// Record a finished orchestrator run; `outcome` is `ok`, `failed` or `canceled`
    pub fn observe_run(&self, duration_secs: f64, outcome: &str) {
        self.inner().run_duration_seconds.observe(duration_secs);
        self.inner().runs_total.with_label_values(&[outcome]).inc();
    }

    pub fn add_alerts_emitted(&self, detector_id: &str, alert_type: &str, count: u64) {
        self.inner()
            .alerts_emitted
            .with_label_values(&[detector_id, alert_type])
            .inc_by(count);
    }

    pub fn inc_module_faults(&self, detector_id: &str) {
        self.inner()
            .module_faults
            .with_label_values(&[detector_id])
            .inc();
    }

    pub fn inc_dispatch_attempts(&self) {
        self.inner().dispatch_attempts.inc();
    }

    pub fn inc_dispatch_failures(&self, kind: &str) {
        self.inner().dispatch_failures.with_label_values(&[kind]).inc();
    }

    /// Record the outcome counts of one scheduler tick
    pub fn observe_tick(
        &self,
        duration_secs: f64,
        due: u64,
        succeeded: u64,
        failed: u64,
        canceled: u64,
        skipped_in_flight: u64,
    ) {
        let inner = self.inner();
        inner.tick_duration_seconds.observe(duration_secs);
        inner.rules_due.inc_by(due);
        inner.rules_succeeded.inc_by(succeeded);
        inner.rules_failed.inc_by(failed);
        inner.rules_canceled.inc_by(canceled);
        inner.rules_skipped_in_flight.inc_by(skipped_in_flight);
    }
}

/// Structured logger for engine events
///
/// Provides consistent JSON-formatted logging for detector runs,
/// scheduling decisions, and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log engine startup
    pub fn log_startup(&self, version: &str, mode: &str) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            engine_version = %version,
            mode = %mode,
            "Detector engine started"
        );
    }

    /// Log engine shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Detector engine shutting down"
        );
    }

    /// Log a detector package that passed validation
    pub fn log_detector_loaded(&self, detector_id: &str, version: &str, entry_point: &str) {
        info!(
            event = "detector_loaded",
            instance = %self.instance,
            detector_id = %detector_id,
            version = %version,
            entry_point = %entry_point,
            "Detector loaded"
        );
    }

    /// Log a detector package that failed validation
    pub fn log_detector_load_failed(&self, detector_id: &str, reason: &str) {
        error!(
            event = "detector_load_failed",
            instance = %self.instance,
            detector_id = %detector_id,
            reason = %reason,
            "Detector failed to load"
        );
    }

    /// Log a completed orchestrator run
    pub fn log_run_completed(
        &self,
        detector_id: &str,
        resources: usize,
        alerts: usize,
        elapsed_ms: u64,
    ) {
        info!(
            event = "run_completed",
            instance = %self.instance,
            detector_id = %detector_id,
            resources = resources,
            alerts = alerts,
            elapsed_ms = elapsed_ms,
            "Detector run completed"
        );
    }

    /// Log the per-type alert count of a run
    pub fn log_alerts_emitted(&self, detector_id: &str, alert_type: &str, count: usize) {
        info!(
            event = "alerts_emitted",
            instance = %self.instance,
            detector_id = %detector_id,
            alert_type = %alert_type,
            count = count,
            "Detector emitted alerts"
        );
    }

    /// Log a fault raised by module code
    pub fn log_module_fault(&self, detector_id: &str, type_name: &str, message: &str) {
        error!(
            event = "module_fault",
            instance = %self.instance,
            detector_id = %detector_id,
            type_name = %type_name,
            message = %message,
            "Detector module faulted"
        );
    }

    /// Log a run abandoned because of cancellation
    pub fn log_run_canceled(&self, detector_id: &str) {
        info!(
            event = "run_canceled",
            instance = %self.instance,
            detector_id = %detector_id,
            "Detector run canceled"
        );
    }

    /// Log the start of a scheduler tick
    pub fn log_tick_started(&self, rules: usize, due: usize) {
        info!(
            event = "tick_started",
            instance = %self.instance,
            rules = rules,
            due = due,
            "Scheduler tick started"
        );
    }

    /// Log the outcome of a scheduler tick
    pub fn log_tick_completed(
        &self,
        succeeded: usize,
        failed: usize,
        canceled: usize,
        skipped_in_flight: usize,
        elapsed_ms: u64,
    ) {
        if failed > 0 {
            warn!(
                event = "tick_completed",
                instance = %self.instance,
                succeeded = succeeded,
                failed = failed,
                canceled = canceled,
                skipped_in_flight = skipped_in_flight,
                elapsed_ms = elapsed_ms,
                "Scheduler tick completed with failures"
            );
        } else {
            info!(
                event = "tick_completed",
                instance = %self.instance,
                succeeded = succeeded,
                failed = failed,
                canceled = canceled,
                skipped_in_flight = skipped_in_flight,
                elapsed_ms = elapsed_ms,
                "Scheduler tick completed"
            );
        }
    }

    /// Log a rule handed to the dispatcher
    pub fn log_rule_dispatched(&self, rule_id: &str, detector_id: &str, resource_id: &str) {
        info!(
            event = "rule_dispatched",
            instance = %self.instance,
            rule_id = %rule_id,
            detector_id = %detector_id,
            resource_id = %resource_id,
            "Dispatching rule"
        );
    }

    /// Log the alerts of a rule reaching the publisher
    pub fn log_alerts_published(&self, rule_id: &str, detector_id: &str, count: usize) {
        info!(
            event = "alerts_published",
            instance = %self.instance,
            rule_id = %rule_id,
            detector_id = %detector_id,
            count = count,
            "Published rule alerts"
        );
    }

    /// Log a failed rule; it is retried on the next tick
    pub fn log_rule_failed(&self, rule_id: &str, detector_id: &str, stage: &str, error: &str) {
        error!(
            event = "rule_failed",
            instance = %self.instance,
            rule_id = %rule_id,
            detector_id = %detector_id,
            stage = %stage,
            error = %error,
            "Rule failed, will retry on next tick"
        );
    }

    /// Log a rule abandoned because of cancellation
    pub fn log_rule_canceled(&self, rule_id: &str, detector_id: &str) {
        warn!(
            event = "rule_canceled",
            instance = %self.instance,
            rule_id = %rule_id,
            detector_id = %detector_id,
            "Rule canceled"
        );
    }

    /// Log a transport retry of the dispatcher
    pub fn log_dispatch_retry(&self, detector_id: &str, attempt: u32, delay_ms: u64, error: &str) {
        warn!(
            event = "dispatch_retry",
            instance = %self.instance,
            detector_id = %detector_id,
            attempt = attempt,
            delay_ms = delay_ms,
            error = %error,
            "Dispatch attempt failed, retrying"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_creation() {
        let metrics = EngineMetrics::new();

        metrics.observe_run(0.2, "ok");
        metrics.add_alerts_emitted("cpu", "HighCpuAlert", 3);
        metrics.inc_module_faults("cpu");
        metrics.inc_dispatch_attempts();
        metrics.inc_dispatch_failures("status");
        metrics.observe_tick(1.5, 2, 1, 1, 0, 0);

        // Handles share the global registration
        let again = EngineMetrics::new();
        again.observe_run(0.1, "canceled");
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-instance");
        assert_eq!(logger.instance, "test-instance");
    }
}
