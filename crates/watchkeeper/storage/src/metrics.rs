//! Derived statistics over the audit tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use watchkeeper_types::{Run, RunKind};

/// Per-table counts and the most recent run timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total_runs: usize,
    pub complete_runs: usize,
    pub skipped_runs: usize,
    pub decisions: usize,
    pub triggers: usize,
    pub context_entries: usize,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// How often the agent chose not to act, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligenceMetrics {
    pub total_runs: usize,
    pub complete_runs: usize,
    pub skipped_runs: usize,
    /// `skipped / total * 100`, or 0 with no runs.
    pub intelligence_rate: f64,
    pub skip_reasons: BTreeMap<String, usize>,
    pub interpretation: String,
}

impl IntelligenceMetrics {
    pub fn from_runs(runs: &[Run]) -> Self {
        let mut complete_runs = 0;
        let mut skipped_runs = 0;
        let mut skip_reasons: BTreeMap<String, usize> = BTreeMap::new();

        for run in runs {
            match run.kind {
                RunKind::Complete => complete_runs += 1,
                RunKind::Skipped => {
                    skipped_runs += 1;
                    let reason = run.skip_reason().unwrap_or("unspecified").to_string();
                    *skip_reasons.entry(reason).or_default() += 1;
                }
            }
        }

        let total_runs = complete_runs + skipped_runs;
        let intelligence_rate = if total_runs == 0 {
            0.0
        } else {
            skipped_runs as f64 * 100.0 / total_runs as f64
        };

        Self {
            total_runs,
            complete_runs,
            skipped_runs,
            intelligence_rate,
            skip_reasons,
            interpretation: interpret(total_runs, intelligence_rate),
        }
    }
}

fn interpret(total: usize, rate: f64) -> String {
    let text = if total == 0 {
        "No evaluations recorded yet."
    } else if rate >= 70.0 {
        "Highly selective: most changes were judged immaterial and skipped."
    } else if rate >= 30.0 {
        "Balanced: routine changes are skipped, material ones are analysed."
    } else if rate > 0.0 {
        "Action-oriented: most changes triggered a full analysis."
    } else {
        "No skips recorded: every evaluation triggered a full analysis."
    };
    text.to_string()
}
