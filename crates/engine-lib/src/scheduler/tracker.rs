//! Cadence bookkeeping against persisted run records

use crate::models::{AlertRule, ExecutionInfo, RunRecord};
use crate::storage::{RunRecordStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides which rules are due and records successful runs
pub struct RunTracker {
    records: Arc<dyn RunRecordStore>,
}

impl RunTracker {
    pub fn new(records: Arc<dyn RunRecordStore>) -> Self {
        Self { records }
    }

    /// Rules due now
    pub async fn get_due(&self, rules: &[AlertRule]) -> Vec<ExecutionInfo> {
        self.get_due_at(rules, Utc::now()).await
    }

    /// Rules due at `now`.
    ///
    /// A rule without a record has never run and is due immediately. Rules
    /// with a zero cadence or an unreadable record are skipped.
    pub async fn get_due_at(&self, rules: &[AlertRule], now: DateTime<Utc>) -> Vec<ExecutionInfo> {
        let mut due = Vec::new();

        for rule in rules {
            let Some(cadence) = positive_cadence(rule) else {
                warn!(
                    rule_id = %rule.id,
                    cadence_secs = rule.cadence.as_secs(),
                    "Skipping rule with invalid cadence"
                );
                continue;
            };

            let last = match self.records.get(&rule.id).await {
                Ok(record) => record.map(|r| r.last_successful_execution_time),
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        error = %e,
                        "Failed to read run record, skipping rule"
                    );
                    continue;
                }
            };

            if is_due(last, cadence, now) {
                due.push(ExecutionInfo {
                    rule: rule.clone(),
                    current_execution_time: now,
                    last_execution_time: last,
                });
            } else {
                debug!(rule_id = %rule.id, "Rule not due");
            }
        }

        due
    }

    /// Whether the rule of `info` is still due at its execution time, judged
    /// against the record as it is now. Another tick may have completed the
    /// rule since `info` was computed.
    pub async fn is_still_due(&self, info: &ExecutionInfo) -> Result<bool, StoreError> {
        let Some(cadence) = positive_cadence(&info.rule) else {
            return Ok(false);
        };
        let last = self
            .records
            .get(&info.rule.id)
            .await?
            .map(|r| r.last_successful_execution_time);
        Ok(is_due(last, cadence, info.current_execution_time))
    }

    /// Record that the run described by `info` completed
    pub async fn mark_success(&self, info: &ExecutionInfo) -> Result<(), StoreError> {
        self.records
            .upsert(RunRecord {
                rule_id: info.rule.id.clone(),
                detector_id: info.rule.detector_id.clone(),
                last_successful_execution_time: info.current_execution_time,
            })
            .await
    }
}

fn positive_cadence(rule: &AlertRule) -> Option<chrono::Duration> {
    if rule.cadence.is_zero() {
        return None;
    }
    chrono::Duration::from_std(rule.cadence).ok()
}

/// A rule that never ran is due at once
fn is_due(last: Option<DateTime<Utc>>, cadence: chrono::Duration, now: DateTime<Utc>) -> bool {
    last.unwrap_or(DateTime::<Utc>::MIN_UTC)
        .checked_add_signed(cadence)
        .is_some_and(|next| next <= now)
}
