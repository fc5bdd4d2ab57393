//! Skip policy.
//!
//! Decides whether a trigger warrants a full analysis by comparing the
//! current snapshot's figures with the last recorded run (of either kind)
//! and by classifying the trigger's own magnitude.

use serde::Serialize;
use watchkeeper_types::{Run, RunSummary, Severity, Snapshot, TriggerKind};

use crate::config::SkipPolicyConfig;

pub const REASON_BELOW_THRESHOLD: &str = "delta below threshold";
pub const REASON_NO_MATERIAL_CHANGE: &str = "no material change";

/// What the policy knows about the trigger being evaluated.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerContext {
    pub kind: TriggerKind,
    pub reason: String,
    pub changes_detected: usize,
    pub new_amount: f64,
}

/// Policy outcome. Both arms carry a human-readable reason.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Skip { reason: String, severity: Severity },
    Analyze { reason: String, severity: Severity },
}

impl Verdict {
    pub fn is_skip(&self) -> bool {
        matches!(self, Verdict::Skip { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Verdict::Skip { reason, .. } | Verdict::Analyze { reason, .. } => reason,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Verdict::Skip { severity, .. } | Verdict::Analyze { severity, .. } => *severity,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkipPolicy {
    config: SkipPolicyConfig,
}

impl SkipPolicy {
    pub fn new(config: SkipPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SkipPolicyConfig {
        &self.config
    }

    /// Severity of a trigger from its row-change count and aggregate amount.
    pub fn classify(&self, changes_detected: usize, new_amount: f64) -> Severity {
        let amount = new_amount.abs();
        if amount >= self.config.critical_amount {
            Severity::Critical
        } else if amount >= self.config.high_amount {
            Severity::High
        } else if changes_detected >= self.config.change_count_medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Figures read straight from the snapshot payload.
    ///
    /// Returns `None` without a numeric balance. A risk field holding an
    /// array counts its elements.
    pub fn derive_summary(&self, snapshot: &Snapshot) -> Option<RunSummary> {
        let data = &snapshot.data;
        let balance = data.pointer(&self.config.balance_pointer)?.as_f64()?;
        let runway_days = data
            .pointer(&self.config.runway_pointer)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let risk_count = match data.pointer(&self.config.risk_pointer) {
            Some(serde_json::Value::Array(items)) => items.len() as u32,
            Some(value) => value.as_u64().unwrap_or(0) as u32,
            None => 0,
        };

        Some(RunSummary {
            balance,
            runway_days,
            risk_count,
            action_count: 0,
        })
    }

    pub fn evaluate(
        &self,
        trigger: &TriggerContext,
        current: Option<&RunSummary>,
        last_run: Option<&Run>,
    ) -> Verdict {
        let severity = self.classify(trigger.changes_detected, trigger.new_amount);
        let analyze = |reason: String| Verdict::Analyze { reason, severity };

        match trigger.kind {
            TriggerKind::Manual => return analyze("manual trigger".into()),
            TriggerKind::FirstObservation => return analyze("first observation".into()),
            TriggerKind::Scheduled | TriggerKind::SourceChange => {}
        }

        let Some(last) = last_run else {
            return analyze("no previous run".into());
        };
        let Some(current) = current else {
            return analyze("snapshot summary unavailable".into());
        };

        if severity >= self.config.severity_floor {
            return analyze(format!("{severity} severity change"));
        }

        let balance_delta = current.balance - last.summary.balance;
        if balance_delta.abs() >= self.config.balance_delta_threshold {
            return analyze(format!("balance moved by {balance_delta:.2}"));
        }

        let runway_delta = current.runway_days - last.summary.runway_days;
        if runway_delta.abs() >= self.config.runway_delta_threshold_days {
            return analyze(format!("runway moved by {runway_delta:.1} days"));
        }

        let risk_delta = current.risk_count.abs_diff(last.summary.risk_count);
        if risk_delta >= self.config.risk_delta_threshold.max(1) {
            return analyze(format!("risk count moved by {risk_delta}"));
        }

        let unchanged = trigger.changes_detected == 0
            && balance_delta == 0.0
            && runway_delta == 0.0
            && risk_delta == 0;
        let reason = if unchanged {
            REASON_NO_MATERIAL_CHANGE
        } else {
            REASON_BELOW_THRESHOLD
        };

        Verdict::Skip {
            reason: reason.into(),
            severity,
        }
    }
}
