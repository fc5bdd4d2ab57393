use async_trait::async_trait;
use serde_json::Value;
use watchkeeper_types::{ContextEntry, Decision, Run, RunId, Trigger};

use crate::metrics::{AuditStatistics, IntelligenceMetrics};
use crate::model::{DecisionAppend, QueryWindow, RunAppend, SkipAppend, TriggerAppend};
use crate::StorageResult;

/// Durable audit memory for runs, decisions, triggers and context.
///
/// Runs, decisions and triggers are append-only. Implementations serialize
/// writes and allow concurrent reads.
#[async_trait]
pub trait AuditMemory: Send + Sync {
    /// Append a complete run and return the stored record with its id.
    async fn save_run(&self, run: RunAppend) -> StorageResult<Run>;

    /// Append a skip, stored as a run with `kind = skipped`.
    async fn save_skip(&self, skip: SkipAppend) -> StorageResult<Run>;

    /// Most recent run of either kind.
    async fn get_last_run(&self) -> StorageResult<Option<Run>>;

    /// Runs newest-first by timestamp, ties broken by insertion order.
    async fn list_runs(&self, window: QueryWindow) -> StorageResult<Vec<Run>>;

    /// The `limit` most recent runs, newest-first.
    async fn get_history(&self, limit: usize) -> StorageResult<Vec<Run>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.list_runs(QueryWindow::latest(limit)).await
    }

    async fn save_decision(&self, decision: DecisionAppend) -> StorageResult<Decision>;

    /// Decisions for one run in the order they were recorded.
    async fn get_decisions_for_run(&self, run_id: &RunId) -> StorageResult<Vec<Decision>>;

    async fn save_trigger(&self, trigger: TriggerAppend) -> StorageResult<Trigger>;

    /// Triggers newest-first.
    async fn list_triggers(&self, window: QueryWindow) -> StorageResult<Vec<Trigger>>;

    async fn upsert_context(&self, key: &str, value: Value) -> StorageResult<ContextEntry>;

    async fn get_context_entry(&self, key: &str) -> StorageResult<Option<ContextEntry>>;

    /// Context value for `key`, or `default` when unset.
    async fn get_context(&self, key: &str, default: Value) -> StorageResult<Value> {
        Ok(self
            .get_context_entry(key)
            .await?
            .map(|entry| entry.value)
            .unwrap_or(default))
    }

    async fn get_statistics(&self) -> StorageResult<AuditStatistics>;

    async fn compute_intelligence_metrics(&self) -> StorageResult<IntelligenceMetrics> {
        let runs = self.list_runs(QueryWindow::all()).await?;
        Ok(IntelligenceMetrics::from_runs(&runs))
    }

    /// Keep the `keep_last_n` most recent runs and delete the rest.
    ///
    /// Decisions and triggers are never pruned. Returns the number of runs
    /// removed.
    async fn prune(&self, keep_last_n: usize) -> StorageResult<usize>;
}
