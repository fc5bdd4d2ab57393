//! External analysis and narrative provider seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use watchkeeper_types::{ProposedAction, RunSummary, Snapshot};

use crate::error::AnalysisError;

/// Treasury figures reported by the analysis provider. Fields the kernel
/// does not diff are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreasurySummary {
    #[serde(default)]
    pub current_balance: f64,
    #[serde(default)]
    pub cash_runway_days: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output of one analysis call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub risks: Vec<Value>,
    #[serde(default)]
    pub actions: Vec<ProposedAction>,
    #[serde(default)]
    pub treasury_summary: TreasurySummary,
}

impl AnalysisReport {
    /// Run summary derived from the provider's figures.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            balance: self.treasury_summary.current_balance,
            runway_days: self.treasury_summary.cash_runway_days,
            risk_count: self.risks.len() as u32,
            action_count: self.actions.len() as u32,
        }
    }
}

/// Computes risks, proposed actions and a treasury summary for a snapshot.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, snapshot: &Snapshot) -> Result<AnalysisReport, AnalysisError>;
}

/// Numeric facts handed to the narrative provider.
#[derive(Debug, Clone, Serialize)]
pub struct NarrativeFacts {
    pub trigger_reason: String,
    pub summary: RunSummary,
    pub risks: Vec<Value>,
    pub actions: Vec<ProposedAction>,
}

/// Turns numeric facts into prose. Its output is never a decision input.
#[async_trait]
pub trait NarrativeProvider: Send + Sync {
    async fn narrate(&self, facts: &NarrativeFacts) -> Result<String, AnalysisError>;
}
