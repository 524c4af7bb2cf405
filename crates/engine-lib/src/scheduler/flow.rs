//! Tick-driven scheduling of alert rules
//!
//! Each tick reads every rule, asks the [`RunTracker`] which are due and runs
//! dispatch, publish and mark-success for each of them. Failures stay with
//! the rule that caused them: the rule keeps its previous run record and is
//! picked up again on the next tick.

use super::dispatcher::AnalysisExecuter;
use super::tracker::RunTracker;
use crate::health::{components, HealthRegistry};
use crate::models::ExecutionInfo;
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::storage::{AlertPublisher, RuleStore};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default interval between ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Rules processed concurrently within one tick; 1 is sequential
    pub max_concurrent_rules: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_concurrent_rules: 4,
        }
    }
}

/// Counts of one tick. `due` includes rules skipped because an earlier tick
/// still had them in flight, or completed them after this tick read their
/// records. A record that fails its re-read after the claim also counts as
/// skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
    pub skipped_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureStage {
    Dispatch,
    Publish,
    MarkSuccess,
}

impl FailureStage {
    fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Dispatch => "dispatch",
            FailureStage::Publish => "publish",
            FailureStage::MarkSuccess => "mark_success",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOutcome {
    Succeeded,
    Failed(FailureStage),
    Canceled,
    AlreadyRun,
}

/// Membership of a rule in the in-flight set, released on drop
struct InFlightGuard {
    set: Arc<DashSet<String>>,
    rule_id: String,
}

impl InFlightGuard {
    fn claim(set: &Arc<DashSet<String>>, rule_id: &str) -> Option<Self> {
        set.insert(rule_id.to_string()).then(|| Self {
            set: Arc::clone(set),
            rule_id: rule_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.rule_id);
    }
}

pub struct ScheduleFlow {
    rules: Arc<dyn RuleStore>,
    tracker: RunTracker,
    executer: Arc<dyn AnalysisExecuter>,
    publisher: Arc<dyn AlertPublisher>,
    config: SchedulerConfig,
    in_flight: Arc<DashSet<String>>,
    health: Option<HealthRegistry>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl ScheduleFlow {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        tracker: RunTracker,
        executer: Arc<dyn AnalysisExecuter>,
        publisher: Arc<dyn AlertPublisher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            rules,
            tracker,
            executer,
            publisher,
            config,
            in_flight: Arc::new(DashSet::new()),
            health: None,
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new("scheduler"),
        }
    }

    /// Report tick outcomes to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Rules currently being processed by any tick
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run one pass over all rules. Per-rule failures are logged and counted,
    /// never returned.
    pub async fn tick(self: &Arc<Self>, token: CancellationToken) -> TickSummary {
        let start = Instant::now();

        let rules = match self.rules.get_all().await {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "Failed to read alert rules, skipping tick");
                if let Some(health) = &self.health {
                    let message = format!("rule store unavailable: {}", e);
                    health.set_degraded(components::SCHEDULER, message).await;
                }
                return TickSummary::default();
            }
        };

        let due = self.tracker.get_due(&rules).await;
        self.logger.log_tick_started(rules.len(), due.len());

        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_rules.max(1)));
        let mut tasks = JoinSet::new();

        for info in due {
            let Some(guard) = InFlightGuard::claim(&self.in_flight, &info.rule.id) else {
                debug!(rule_id = %info.rule.id, "Rule still in flight, skipping");
                summary.skipped_in_flight += 1;
                continue;
            };

            let flow = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let rule_token = token.child_token();
            tasks.spawn(async move {
                let _guard = guard;
                // The due entry may predate a run another tick just finished
                match flow.tracker.is_still_due(&info).await {
                    Ok(true) => {}
                    Ok(false) => return RuleOutcome::AlreadyRun,
                    Err(e) => {
                        warn!(
                            rule_id = %info.rule.id,
                            error = %e,
                            "Failed to re-read run record, skipping rule"
                        );
                        return RuleOutcome::AlreadyRun;
                    }
                }
                let _permit = tokio::select! {
                    biased;
                    _ = rule_token.cancelled() => return RuleOutcome::Canceled,
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return RuleOutcome::Canceled,
                    },
                };
                flow.process_rule(info, rule_token).await
            });
        }

        let mut dispatch_failures = 0;
        let mut publish_failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RuleOutcome::Succeeded) => summary.succeeded += 1,
                Ok(RuleOutcome::Canceled) => summary.canceled += 1,
                Ok(RuleOutcome::AlreadyRun) => {
                    debug!("Rule completed by an overlapping tick, skipping");
                    summary.skipped_in_flight += 1;
                }
                Ok(RuleOutcome::Failed(stage)) => {
                    summary.failed += 1;
                    match stage {
                        FailureStage::Dispatch => dispatch_failures += 1,
                        FailureStage::Publish => publish_failures += 1,
                        FailureStage::MarkSuccess => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Rule task aborted");
                    summary.failed += 1;
                }
            }
        }

        let elapsed = start.elapsed();
        self.metrics.observe_tick(
            elapsed.as_secs_f64(),
            summary.due as u64,
            summary.succeeded as u64,
            summary.failed as u64,
            summary.canceled as u64,
            summary.skipped_in_flight as u64,
        );
        self.logger.log_tick_completed(
            summary.succeeded,
            summary.failed,
            summary.canceled,
            summary.skipped_in_flight,
            elapsed.as_millis() as u64,
        );
        self.report_health(&summary, dispatch_failures, publish_failures)
            .await;

        summary
    }

    async fn process_rule(&self, info: ExecutionInfo, token: CancellationToken) -> RuleOutcome {
        let rule = &info.rule;
        self.logger
            .log_rule_dispatched(&rule.id, &rule.detector_id, &rule.resource_id);

        let resource_ids = [rule.resource_id.clone()];
        let alerts = match self.executer.execute(&info, &resource_ids, token).await {
            Ok(alerts) => alerts,
            Err(e) if e.is_canceled() => {
                self.logger.log_rule_canceled(&rule.id, &rule.detector_id);
                return RuleOutcome::Canceled;
            }
            Err(e) => {
                return self.fail(&info, FailureStage::Dispatch, &e.to_string());
            }
        };

        if let Err(e) = self.publisher.publish(&rule.detector_id, &alerts).await {
            return self.fail(&info, FailureStage::Publish, &e.to_string());
        }
        self.logger
            .log_alerts_published(&rule.id, &rule.detector_id, alerts.len());

        if let Err(e) = self.tracker.mark_success(&info).await {
            return self.fail(&info, FailureStage::MarkSuccess, &e.to_string());
        }

        RuleOutcome::Succeeded
    }

    fn fail(&self, info: &ExecutionInfo, stage: FailureStage, error: &str) -> RuleOutcome {
        self.logger
            .log_rule_failed(&info.rule.id, &info.rule.detector_id, stage.as_str(), error);
        RuleOutcome::Failed(stage)
    }

    async fn report_health(
        &self,
        summary: &TickSummary,
        dispatch_failures: usize,
        publish_failures: usize,
    ) {
        let Some(health) = &self.health else {
            return;
        };

        let stages = [
            (components::SCHEDULER, summary.failed, "rule(s) failed in last tick"),
            (components::DISPATCHER, dispatch_failures, "dispatch failure(s) in last tick"),
            (components::PUBLISHER, publish_failures, "publish failure(s) in last tick"),
        ];
        for (component, failures, what) in stages {
            if failures > 0 {
                health
                    .set_degraded(component, format!("{} {}", failures, what))
                    .await;
            } else {
                health.set_healthy(component).await;
            }
        }
    }

    /// Tick on an interval until `shutdown` fires.
    ///
    /// Ticks run as their own tasks, so a slow tick does not hold back the
    /// next one; rules still in flight are skipped by the later tick.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            max_concurrent_rules = self.config.max_concurrent_rules,
            "Starting schedule flow"
        );

        let mut ticker = interval(self.config.tick_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down schedule flow");
                    break;
                }
                _ = ticker.tick() => {
                    let flow = Arc::clone(&self);
                    let token = shutdown.child_token();
                    ticks.spawn(async move { flow.tick(token).await });
                }
                Some(_) = ticks.join_next(), if !ticks.is_empty() => {}
            }
        }

        while ticks.join_next().await.is_some() {}
    }
}
