use crate::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Outcome class of a run. Both kinds live in the same history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Complete,
    Skipped,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Complete => "complete",
            RunKind::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "complete" => Some(RunKind::Complete),
            "skipped" => Some(RunKind::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric facts of a run.
///
/// Supplied by the analysis provider for complete runs and derived from the
/// snapshot for skips. The kernel only diffs these, it never computes them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub runway_days: f64,
    #[serde(default)]
    pub risk_count: u32,
    #[serde(default)]
    pub action_count: u32,
}

/// Magnitude tag attached to triggers and skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What the trigger looked like when the skip was decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipContext {
    pub trigger_type: String,
    pub changes_detected: usize,
    pub new_amount: f64,
}

/// Extra fields carried by a run with `kind = skipped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipDetails {
    pub reason: String,
    pub severity: Severity,
    pub context_summary: SkipContext,
}

/// An immutable evaluation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// Insertion order assigned by storage; breaks timestamp ties.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub trigger_reason: String,
    pub kind: RunKind,
    pub summary: RunSummary,
    #[serde(default)]
    pub deliverables: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipDetails>,
}

impl Run {
    pub fn is_skip(&self) -> bool {
        self.kind == RunKind::Skipped
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.skip.as_ref().map(|s| s.reason.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_magnitude() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::High.to_string(), "high");
    }

    #[test]
    fn run_kind_round_trips_through_str() {
        for kind in [RunKind::Complete, RunKind::Skipped] {
            assert_eq!(RunKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RunKind::parse("partial"), None);
    }

    #[test]
    fn skip_fields_are_omitted_for_complete_runs() {
        let run = Run {
            id: RunId::new("run-1"),
            sequence: 1,
            timestamp: Utc::now(),
            trigger_reason: "manual".into(),
            kind: RunKind::Complete,
            summary: RunSummary::default(),
            deliverables: Value::Null,
            skip: None,
        };
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["kind"], "complete");
        assert!(json.get("skip").is_none());
    }

    #[test]
    fn older_rows_without_new_fields_deserialize() {
        let json = serde_json::json!({
            "id": "run-legacy",
            "sequence": 3,
            "timestamp": "2024-01-01T00:00:00Z",
            "trigger_reason": "scheduled",
            "kind": "skipped",
            "summary": {"balance": 12.5}
        });
        let run: Run = serde_json::from_value(json).unwrap();
        assert_eq!(run.summary.balance, 12.5);
        assert_eq!(run.summary.risk_count, 0);
        assert!(run.skip.is_none());
    }
}
