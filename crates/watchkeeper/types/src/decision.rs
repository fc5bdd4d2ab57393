use crate::ids::{ActionId, DecisionId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Human verdict on a proposed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Validated,
    Rejected,
    /// Leaves the action pending for a later decision.
    Deferred,
}

impl DecisionKind {
    /// Validated and rejected close the action; deferred does not.
    pub fn is_final(&self) -> bool {
        !matches!(self, DecisionKind::Deferred)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Validated => "validated",
            DecisionKind::Rejected => "rejected",
            DecisionKind::Deferred => "deferred",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "validated" => Some(DecisionKind::Validated),
            "rejected" => Some(DecisionKind::Rejected),
            "deferred" => Some(DecisionKind::Deferred),
            _ => None,
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only decision record. Corrections append a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub run_id: RunId,
    pub action_id: ActionId,
    pub decision: DecisionKind,
    #[serde(default)]
    pub comment: Option<String>,
    pub validated_by: String,
    pub timestamp: DateTime<Utc>,
}

/// An action produced by analysis, awaiting human validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub action_id: ActionId,
    pub title: String,
    #[serde(default)]
    pub details: Value,
}
