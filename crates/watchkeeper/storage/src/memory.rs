//! In-memory reference implementation of the audit memory.
//!
//! Deterministic and test-friendly. Records are lost on restart; production
//! deployments should use a durable backend.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use watchkeeper_types::{
    ContextEntry, Decision, DecisionId, Run, RunId, RunKind, SkipDetails, Trigger, TriggerId,
};

use crate::metrics::AuditStatistics;
use crate::model::{DecisionAppend, QueryWindow, RunAppend, SkipAppend, TriggerAppend};
use crate::traits::AuditMemory;
use crate::{StorageError, StorageResult};

#[derive(Default)]
struct RunLog {
    runs: Vec<Run>,
    next_sequence: u64,
}

/// In-memory audit memory.
#[derive(Default)]
pub struct InMemoryAuditMemory {
    runs: RwLock<RunLog>,
    decisions: RwLock<Vec<Decision>>,
    triggers: RwLock<Vec<Trigger>>,
    context: RwLock<HashMap<String, ContextEntry>>,
}

impl InMemoryAuditMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, mut run: Run) -> StorageResult<Run> {
        let mut guard = self
            .runs
            .write()
            .map_err(|_| StorageError::Backend("runs lock poisoned".to_string()))?;
        if guard.runs.iter().any(|existing| existing.id == run.id) {
            return Err(StorageError::Conflict(format!("run {} already exists", run.id)));
        }
        guard.next_sequence += 1;
        run.sequence = guard.next_sequence;
        guard.runs.push(run.clone());
        Ok(run)
    }

    fn sorted_runs(&self) -> StorageResult<Vec<Run>> {
        let guard = self
            .runs
            .read()
            .map_err(|_| StorageError::Backend("runs lock poisoned".to_string()))?;
        let mut values = guard.runs.clone();
        values.sort_by(newest_first);
        Ok(values)
    }
}

#[async_trait]
impl AuditMemory for InMemoryAuditMemory {
    async fn save_run(&self, run: RunAppend) -> StorageResult<Run> {
        run.validate()?;
        self.append(Run {
            id: RunId::generate(),
            sequence: 0,
            timestamp: run.timestamp,
            trigger_reason: run.trigger_reason,
            kind: RunKind::Complete,
            summary: run.summary,
            deliverables: run.deliverables,
            skip: None,
        })
    }

    async fn save_skip(&self, skip: SkipAppend) -> StorageResult<Run> {
        skip.validate()?;
        self.append(Run {
            id: RunId::generate(),
            sequence: 0,
            timestamp: skip.timestamp,
            trigger_reason: skip.trigger_reason,
            kind: RunKind::Skipped,
            summary: skip.summary,
            deliverables: Value::Null,
            skip: Some(SkipDetails {
                reason: skip.reason,
                severity: skip.severity,
                context_summary: skip.context_summary,
            }),
        })
    }

    async fn get_last_run(&self) -> StorageResult<Option<Run>> {
        let guard = self
            .runs
            .read()
            .map_err(|_| StorageError::Backend("runs lock poisoned".to_string()))?;
        Ok(guard
            .runs
            .iter()
            .min_by(|a, b| newest_first(a, b))
            .cloned())
    }

    async fn list_runs(&self, window: QueryWindow) -> StorageResult<Vec<Run>> {
        Ok(apply_window(self.sorted_runs()?, window))
    }

    async fn save_decision(&self, decision: DecisionAppend) -> StorageResult<Decision> {
        decision.validate()?;
        let record = Decision {
            id: DecisionId::generate(),
            run_id: decision.run_id,
            action_id: decision.action_id,
            decision: decision.decision,
            comment: decision.comment,
            validated_by: decision.validated_by,
            timestamp: decision.timestamp,
        };
        let mut guard = self
            .decisions
            .write()
            .map_err(|_| StorageError::Backend("decisions lock poisoned".to_string()))?;
        guard.push(record.clone());
        Ok(record)
    }

    async fn get_decisions_for_run(&self, run_id: &RunId) -> StorageResult<Vec<Decision>> {
        let guard = self
            .decisions
            .read()
            .map_err(|_| StorageError::Backend("decisions lock poisoned".to_string()))?;
        Ok(guard
            .iter()
            .filter(|d| &d.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn save_trigger(&self, trigger: TriggerAppend) -> StorageResult<Trigger> {
        let record = Trigger {
            id: TriggerId::generate(),
            kind: trigger.kind,
            reason: trigger.reason,
            source_id: trigger.source_id,
            fingerprint: trigger.fingerprint,
            metadata: trigger.metadata,
            saved_at: Utc::now(),
        };
        let mut guard = self
            .triggers
            .write()
            .map_err(|_| StorageError::Backend("triggers lock poisoned".to_string()))?;
        guard.push(record.clone());
        Ok(record)
    }

    async fn list_triggers(&self, window: QueryWindow) -> StorageResult<Vec<Trigger>> {
        let guard = self
            .triggers
            .read()
            .map_err(|_| StorageError::Backend("triggers lock poisoned".to_string()))?;
        let values = guard.iter().rev().cloned().collect::<Vec<_>>();
        Ok(apply_window(values, window))
    }

    async fn upsert_context(&self, key: &str, value: Value) -> StorageResult<ContextEntry> {
        if key.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "context key must not be empty".to_string(),
            ));
        }
        let entry = ContextEntry {
            key: key.to_string(),
            value,
            updated_at: Utc::now(),
        };
        let mut guard = self
            .context
            .write()
            .map_err(|_| StorageError::Backend("context lock poisoned".to_string()))?;
        guard.insert(entry.key.clone(), entry.clone());
        Ok(entry)
    }

    async fn get_context_entry(&self, key: &str) -> StorageResult<Option<ContextEntry>> {
        let guard = self
            .context
            .read()
            .map_err(|_| StorageError::Backend("context lock poisoned".to_string()))?;
        Ok(guard.get(key).cloned())
    }

    async fn get_statistics(&self) -> StorageResult<AuditStatistics> {
        // Guards are held together so the counts describe one point in time.
        // Writers only ever take one lock each.
        let runs = self
            .runs
            .read()
            .map_err(|_| StorageError::Backend("runs lock poisoned".to_string()))?;
        let decisions = self
            .decisions
            .read()
            .map_err(|_| StorageError::Backend("decisions lock poisoned".to_string()))?;
        let triggers = self
            .triggers
            .read()
            .map_err(|_| StorageError::Backend("triggers lock poisoned".to_string()))?;
        let context = self
            .context
            .read()
            .map_err(|_| StorageError::Backend("context lock poisoned".to_string()))?;

        let total_runs = runs.runs.len();
        let complete_runs = runs
            .runs
            .iter()
            .filter(|run| run.kind == RunKind::Complete)
            .count();
        let last_run_at = runs
            .runs
            .iter()
            .min_by(|a, b| newest_first(a, b))
            .map(|run| run.timestamp);

        Ok(AuditStatistics {
            total_runs,
            complete_runs,
            skipped_runs: total_runs - complete_runs,
            decisions: decisions.len(),
            triggers: triggers.len(),
            context_entries: context.len(),
            last_run_at,
        })
    }

    async fn prune(&self, keep_last_n: usize) -> StorageResult<usize> {
        let mut guard = self
            .runs
            .write()
            .map_err(|_| StorageError::Backend("runs lock poisoned".to_string()))?;
        if guard.runs.len() <= keep_last_n {
            return Ok(0);
        }

        let mut ordered = guard.runs.iter().collect::<Vec<_>>();
        ordered.sort_by(|a, b| newest_first(a, b));
        let keep = ordered
            .into_iter()
            .take(keep_last_n)
            .map(|run| run.sequence)
            .collect::<HashSet<_>>();

        let before = guard.runs.len();
        guard.runs.retain(|run| keep.contains(&run.sequence));
        let removed = before - guard.runs.len();
        tracing::debug!(removed, kept = keep_last_n, "Pruned run history");
        Ok(removed)
    }
}

fn newest_first(a: &Run, b: &Run) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.sequence.cmp(&a.sequence))
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
