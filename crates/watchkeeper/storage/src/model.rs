use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use watchkeeper_types::{
    ActionId, DecisionKind, Fingerprint, RunId, RunSummary, Severity, SkipContext, TriggerKind,
};

use crate::{StorageError, StorageResult};

/// Generic query window for paged reads. `limit == 0` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn latest(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }
}

/// Complete-run append payload. Id and sequence are assigned by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAppend {
    pub timestamp: DateTime<Utc>,
    pub trigger_reason: String,
    pub summary: RunSummary,
    #[serde(default)]
    pub deliverables: Value,
}

/// Skip append payload; stored as a run with `kind = skipped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipAppend {
    pub timestamp: DateTime<Utc>,
    pub trigger_reason: String,
    pub summary: RunSummary,
    pub reason: String,
    pub severity: Severity,
    pub context_summary: SkipContext,
}

/// Decision append payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAppend {
    pub run_id: RunId,
    pub action_id: ActionId,
    pub decision: DecisionKind,
    #[serde(default)]
    pub comment: Option<String>,
    pub validated_by: String,
    pub timestamp: DateTime<Utc>,
}

/// Trigger append payload; `saved_at` is stamped by storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerAppend {
    pub kind: TriggerKind,
    pub reason: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub metadata: Value,
}

impl RunAppend {
    pub(crate) fn validate(&self) -> StorageResult<()> {
        require_non_empty("trigger_reason", &self.trigger_reason)?;
        require_finite(&self.summary)
    }
}

impl SkipAppend {
    pub(crate) fn validate(&self) -> StorageResult<()> {
        require_non_empty("trigger_reason", &self.trigger_reason)?;
        require_non_empty("reason", &self.reason)?;
        require_finite(&self.summary)
    }
}

impl DecisionAppend {
    pub(crate) fn validate(&self) -> StorageResult<()> {
        require_non_empty("validated_by", &self.validated_by)?;
        require_non_empty("action_id", self.action_id.as_str())
    }
}

fn require_non_empty(field: &str, value: &str) -> StorageResult<()> {
    if value.trim().is_empty() {
        return Err(StorageError::InvalidInput(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn require_finite(summary: &RunSummary) -> StorageResult<()> {
    if !summary.balance.is_finite() || !summary.runway_days.is_finite() {
        return Err(StorageError::InvalidInput(
            "summary figures must be finite".to_string(),
        ));
    }
    Ok(())
}
