//! Validation gate.
//!
//! Proposed actions wait here for a human decision. A `decide` call is a
//! compare-and-set on the action's open status: the gate lock is held
//! across the audit write so two concurrent callers cannot both record a
//! final decision. The gate records intent only and never applies actions.
//!
//! Open actions live in memory. Once an action is decided it moves to a
//! short recently-resolved list; anything older is answered from the audit
//! memory, which is also how [`ValidationGate::restore`] rebuilds the open
//! set after a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use watchkeeper_storage::{AuditMemory, DecisionAppend, QueryWindow};
use watchkeeper_types::{
    ActionId, Decision, DecisionKind, EventType, LifecycleEvent, ProposedAction, Run, RunId,
};

use crate::broadcaster::EventBroadcaster;
use crate::config::GateConfig;
use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Deferred,
    Validated,
    Rejected,
}

impl ActionStatus {
    /// Open actions still accept a decision.
    pub fn is_open(&self) -> bool {
        matches!(self, ActionStatus::Pending | ActionStatus::Deferred)
    }

    fn from_decision(kind: DecisionKind) -> Self {
        match kind {
            DecisionKind::Validated => ActionStatus::Validated,
            DecisionKind::Rejected => ActionStatus::Rejected,
            DecisionKind::Deferred => ActionStatus::Deferred,
        }
    }
}

/// An action registered with the gate.
#[derive(Debug, Clone, Serialize)]
pub struct PendingAction {
    pub run_id: RunId,
    pub action: ProposedAction,
    pub status: ActionStatus,
    pub deferrals: u32,
}

#[derive(Default)]
struct Registry {
    open: HashMap<ActionId, PendingAction>,
    recent: VecDeque<(ActionId, DecisionKind)>,
}

impl Registry {
    fn recent_decision(&self, action_id: &ActionId) -> Option<DecisionKind> {
        self.recent
            .iter()
            .find(|(id, _)| id == action_id)
            .map(|(_, kind)| *kind)
    }

    fn is_known(&self, action_id: &ActionId) -> bool {
        self.open.contains_key(action_id) || self.recent_decision(action_id).is_some()
    }

    fn resolve(&mut self, action_id: &ActionId, decision: DecisionKind, capacity: usize) {
        self.open.remove(action_id);
        if capacity == 0 {
            return;
        }
        while self.recent.len() >= capacity {
            self.recent.pop_front();
        }
        self.recent.push_back((action_id.clone(), decision));
    }
}

/// One persisted action with its decision history folded in.
struct PersistedAction {
    action: ProposedAction,
    deferrals: u32,
    outcome: Option<DecisionKind>,
}

impl PersistedAction {
    fn reopen(self, run_id: RunId) -> PendingAction {
        PendingAction {
            run_id,
            status: if self.deferrals > 0 {
                ActionStatus::Deferred
            } else {
                ActionStatus::Pending
            },
            deferrals: self.deferrals,
            action: self.action,
        }
    }
}

pub struct ValidationGate {
    config: GateConfig,
    memory: Arc<dyn AuditMemory>,
    broadcaster: Arc<EventBroadcaster>,
    registry: Mutex<Registry>,
    resolved: Notify,
}

impl ValidationGate {
    pub fn new(memory: Arc<dyn AuditMemory>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self::with_config(GateConfig::default(), memory, broadcaster)
    }

    pub fn with_config(
        config: GateConfig,
        memory: Arc<dyn AuditMemory>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            config,
            memory,
            broadcaster,
            registry: Mutex::new(Registry::default()),
            resolved: Notify::new(),
        }
    }

    /// Register actions for `run_id` as pending. Ids already known to the
    /// gate are ignored. Returns the ids that were registered.
    pub async fn propose(&self, run_id: &RunId, actions: Vec<ProposedAction>) -> Vec<ActionId> {
        let mut registry = self.registry.lock().await;
        let mut registered = Vec::with_capacity(actions.len());

        for action in actions {
            if registry.is_known(&action.action_id) {
                tracing::warn!(
                    run_id = %run_id,
                    action_id = %action.action_id,
                    "Action already proposed; ignoring duplicate"
                );
                continue;
            }
            registered.push(action.action_id.clone());
            registry.open.insert(
                action.action_id.clone(),
                PendingAction {
                    run_id: run_id.clone(),
                    action,
                    status: ActionStatus::Pending,
                    deferrals: 0,
                },
            );
        }

        tracing::info!(run_id = %run_id, count = registered.len(), "Actions awaiting validation");
        registered
    }

    /// Re-register actions proposed by recent complete runs that have no
    /// final decision yet. Returns how many were added.
    pub async fn restore(&self) -> Result<usize, GateError> {
        let runs = self.recent_complete_runs().await?;
        let mut registry = self.registry.lock().await;
        let mut restored = 0;

        for run in &runs {
            for persisted in self.load_actions(run).await? {
                if persisted.outcome.is_some() || registry.is_known(&persisted.action.action_id) {
                    continue;
                }
                registry.open.insert(
                    persisted.action.action_id.clone(),
                    persisted.reopen(run.id.clone()),
                );
                restored += 1;
            }
        }

        if restored > 0 {
            tracing::info!(count = restored, "Restored pending actions from audit memory");
        }
        Ok(restored)
    }

    /// Record a human decision for an open action.
    pub async fn decide(
        &self,
        action_id: &ActionId,
        decision: DecisionKind,
        validated_by: &str,
        comment: Option<String>,
    ) -> Result<Decision, GateError> {
        let mut registry = self.registry.lock().await;

        if !registry.open.contains_key(action_id) {
            if let Some(previous) = registry.recent_decision(action_id) {
                return Err(GateError::AlreadyDecided {
                    action_id: action_id.clone(),
                    decision: previous,
                });
            }
            let (run_id, persisted) = self
                .find_persisted(action_id)
                .await?
                .ok_or_else(|| GateError::UnknownAction(action_id.clone()))?;
            if let Some(previous) = persisted.outcome {
                return Err(GateError::AlreadyDecided {
                    action_id: action_id.clone(),
                    decision: previous,
                });
            }
            registry
                .open
                .insert(action_id.clone(), persisted.reopen(run_id));
        }

        let run_id = match registry.open.get(action_id) {
            Some(entry) => entry.run_id.clone(),
            None => return Err(GateError::UnknownAction(action_id.clone())),
        };

        // Status only moves once the decision is durable.
        let stored = self
            .memory
            .save_decision(DecisionAppend {
                run_id,
                action_id: action_id.clone(),
                decision,
                comment,
                validated_by: validated_by.to_string(),
                timestamp: Utc::now(),
            })
            .await?;

        if decision.is_final() {
            registry.resolve(action_id, decision, self.config.recently_resolved);
        } else if let Some(entry) = registry.open.get_mut(action_id) {
            entry.status = ActionStatus::from_decision(decision);
            entry.deferrals += 1;
        }
        drop(registry);

        tracing::info!(
            run_id = %stored.run_id,
            action_id = %stored.action_id,
            decision = %stored.decision,
            validated_by = %stored.validated_by,
            "Decision recorded"
        );
        self.broadcaster
            .publish(LifecycleEvent::with(EventType::DecisionRecorded, &stored));

        if decision.is_final() {
            self.resolved.notify_waiters();
        }
        Ok(stored)
    }

    /// Status of an open or recently resolved action.
    pub async fn status(&self, action_id: &ActionId) -> Option<ActionStatus> {
        let registry = self.registry.lock().await;
        registry
            .open
            .get(action_id)
            .map(|a| a.status)
            .or_else(|| registry.recent_decision(action_id).map(ActionStatus::from_decision))
    }

    /// Open actions for one run.
    pub async fn pending_for_run(&self, run_id: &RunId) -> usize {
        self.registry
            .lock()
            .await
            .open
            .values()
            .filter(|a| &a.run_id == run_id)
            .count()
    }

    /// Open actions across all runs.
    pub async fn pending_count(&self) -> usize {
        self.registry.lock().await.open.len()
    }

    /// Open actions, ordered by action id.
    pub async fn list_pending(&self) -> Vec<PendingAction> {
        let mut open: Vec<PendingAction> =
            self.registry.lock().await.open.values().cloned().collect();
        open.sort_by(|a, b| a.action.action_id.as_str().cmp(b.action.action_id.as_str()));
        open
    }

    /// Resolve once every action proposed for `run_id` has a final decision.
    pub async fn wait_until_resolved(&self, run_id: &RunId) {
        loop {
            let notified = self.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_for_run(run_id).await == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn recent_complete_runs(&self) -> Result<Vec<Run>, GateError> {
        let runs = self
            .memory
            .list_runs(QueryWindow::latest(self.config.restore_window_runs))
            .await?;
        Ok(runs.into_iter().filter(|run| !run.is_skip()).collect())
    }

    async fn find_persisted(
        &self,
        action_id: &ActionId,
    ) -> Result<Option<(RunId, PersistedAction)>, GateError> {
        for run in self.recent_complete_runs().await? {
            if !proposed_actions(&run).iter().any(|a| &a.action_id == action_id) {
                continue;
            }
            let found = self
                .load_actions(&run)
                .await?
                .into_iter()
                .find(|p| &p.action.action_id == action_id);
            if let Some(persisted) = found {
                return Ok(Some((run.id, persisted)));
            }
        }
        Ok(None)
    }

    async fn load_actions(&self, run: &Run) -> Result<Vec<PersistedAction>, GateError> {
        let actions = proposed_actions(run);
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        let decisions = self.memory.get_decisions_for_run(&run.id).await?;

        Ok(actions
            .into_iter()
            .map(|action| {
                let mut deferrals = 0;
                let mut outcome = None;
                for decision in decisions.iter().filter(|d| d.action_id == action.action_id) {
                    if decision.decision.is_final() {
                        outcome = Some(decision.decision);
                        break;
                    }
                    deferrals += 1;
                }
                PersistedAction {
                    action,
                    deferrals,
                    outcome,
                }
            })
            .collect())
    }
}

/// Actions recorded in a complete run's deliverables.
fn proposed_actions(run: &Run) -> Vec<ProposedAction> {
    run.deliverables
        .get("actions")
        .cloned()
        .and_then(|actions| serde_json::from_value(actions).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;
    use watchkeeper_storage::InMemoryAuditMemory;

    fn action(id: &str) -> ProposedAction {
        ProposedAction {
            action_id: ActionId::new(id),
            title: format!("action {id}"),
            details: Value::Null,
        }
    }

    fn gate() -> (ValidationGate, Arc<InMemoryAuditMemory>) {
        let memory = Arc::new(InMemoryAuditMemory::new());
        let gate = ValidationGate::new(memory.clone(), Arc::new(EventBroadcaster::default()));
        (gate, memory)
    }

    fn gate_over(memory: Arc<InMemoryAuditMemory>, recently_resolved: usize) -> ValidationGate {
        ValidationGate::with_config(
            GateConfig {
                recently_resolved,
                ..Default::default()
            },
            memory,
            Arc::new(EventBroadcaster::default()),
        )
    }

    async fn run_with_actions(memory: &InMemoryAuditMemory, ids: &[&str]) -> RunId {
        let actions: Vec<ProposedAction> = ids.iter().map(|id| action(id)).collect();
        memory
            .save_run(watchkeeper_storage::RunAppend {
                timestamp: Utc::now(),
                trigger_reason: "balance dropped".to_string(),
                summary: watchkeeper_types::RunSummary::default(),
                deliverables: serde_json::json!({ "actions": actions }),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let (gate, _) = gate();
        let err = gate
            .decide(&ActionId::new("nope"), DecisionKind::Validated, "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UnknownAction(_)));
    }

    #[tokio::test]
    async fn second_final_decision_fails() {
        let (gate, memory) = gate();
        let run = RunId::new("run-1");
        gate.propose(&run, vec![action("a1")]).await;

        gate.decide(&ActionId::new("a1"), DecisionKind::Rejected, "ops", Some("no".into()))
            .await
            .unwrap();
        let err = gate
            .decide(&ActionId::new("a1"), DecisionKind::Validated, "cfo", None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GateError::AlreadyDecided {
                decision: DecisionKind::Rejected,
                ..
            }
        ));
        assert_eq!(memory.get_decisions_for_run(&run).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deferral_keeps_action_open() {
        let (gate, memory) = gate();
        let run = RunId::new("run-1");
        gate.propose(&run, vec![action("a1")]).await;
        let id = ActionId::new("a1");

        gate.decide(&id, DecisionKind::Deferred, "ops", None).await.unwrap();
        assert_eq!(gate.status(&id).await, Some(ActionStatus::Deferred));
        assert_eq!(gate.pending_for_run(&run).await, 1);

        gate.decide(&id, DecisionKind::Validated, "ops", None).await.unwrap();
        assert_eq!(gate.pending_count().await, 0);

        let history = memory.get_decisions_for_run(&run).await.unwrap();
        let kinds: Vec<DecisionKind> = history.iter().map(|d| d.decision).collect();
        assert_eq!(kinds, vec![DecisionKind::Deferred, DecisionKind::Validated]);
    }

    #[tokio::test]
    async fn duplicate_proposals_are_ignored() {
        let (gate, _) = gate();
        let run = RunId::new("run-1");
        assert_eq!(gate.propose(&run, vec![action("a1"), action("a2")]).await.len(), 2);
        let again = gate.propose(&RunId::new("run-2"), vec![action("a2"), action("a3")]).await;
        assert_eq!(again, vec![ActionId::new("a3")]);
        assert_eq!(gate.pending_for_run(&run).await, 2);
        assert_eq!(gate.list_pending().await.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_final_decisions_admit_exactly_one() {
        let (gate, memory) = gate();
        let gate = Arc::new(gate);
        let run = RunId::new("run-1");
        gate.propose(&run, vec![action("a1")]).await;

        let mut tasks = Vec::new();
        for who in ["alice", "bob", "carol", "dave"] {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                gate.decide(&ActionId::new("a1"), DecisionKind::Validated, who, None)
                    .await
                    .is_ok()
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(memory.get_decisions_for_run(&run).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn waiter_wakes_when_run_resolves() {
        let (gate, _) = gate();
        let gate = Arc::new(gate);
        let run = RunId::new("run-1");
        gate.propose(&run, vec![action("a1"), action("a2")]).await;

        let waiter = {
            let gate = gate.clone();
            let run = run.clone();
            tokio::spawn(async move { gate.wait_until_resolved(&run).await })
        };

        gate.decide(&ActionId::new("a1"), DecisionKind::Validated, "ops", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.decide(&ActionId::new("a2"), DecisionKind::Rejected, "ops", None)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter resolves")
            .unwrap();
    }

    #[tokio::test]
    async fn resolved_actions_leave_the_registry() {
        let memory = Arc::new(InMemoryAuditMemory::new());
        let run = run_with_actions(&memory, &["a1", "a2", "a3"]).await;
        let gate = gate_over(memory.clone(), 1);
        gate.propose(&run, vec![action("a1"), action("a2"), action("a3")])
            .await;

        gate.decide(&ActionId::new("a1"), DecisionKind::Validated, "ops", None)
            .await
            .unwrap();
        gate.decide(&ActionId::new("a2"), DecisionKind::Rejected, "ops", None)
            .await
            .unwrap();

        assert_eq!(gate.pending_count().await, 1);
        assert_eq!(gate.registry.lock().await.recent.len(), 1);
        assert_eq!(gate.status(&ActionId::new("a1")).await, None);
        assert_eq!(
            gate.status(&ActionId::new("a2")).await,
            Some(ActionStatus::Rejected)
        );

        // Evicted from memory, still answered from the audit trail.
        let err = gate
            .decide(&ActionId::new("a1"), DecisionKind::Rejected, "cfo", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::AlreadyDecided {
                decision: DecisionKind::Validated,
                ..
            }
        ));
        assert_eq!(memory.get_decisions_for_run(&run).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn restore_reopens_undecided_actions() {
        let memory = Arc::new(InMemoryAuditMemory::new());
        let run = run_with_actions(&memory, &["a1", "a2", "a3"]).await;
        {
            let first = gate_over(memory.clone(), 16);
            first
                .propose(&run, vec![action("a1"), action("a2"), action("a3")])
                .await;
            first
                .decide(&ActionId::new("a1"), DecisionKind::Validated, "ops", None)
                .await
                .unwrap();
            first
                .decide(&ActionId::new("a2"), DecisionKind::Deferred, "ops", None)
                .await
                .unwrap();
        }

        let gate = gate_over(memory.clone(), 16);
        assert_eq!(gate.restore().await.unwrap(), 2);
        assert_eq!(gate.pending_for_run(&run).await, 2);
        assert_eq!(
            gate.status(&ActionId::new("a2")).await,
            Some(ActionStatus::Deferred)
        );
        let pending = gate.list_pending().await;
        assert_eq!(pending[0].deferrals, 1);
        assert_eq!(pending[1].action.action_id, ActionId::new("a3"));

        let err = gate
            .decide(&ActionId::new("a1"), DecisionKind::Rejected, "cfo", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::AlreadyDecided { .. }));
        gate.decide(&ActionId::new("a3"), DecisionKind::Validated, "cfo", None)
            .await
            .unwrap();

        // Restoring again adds nothing already known or decided.
        assert_eq!(gate.restore().await.unwrap(), 0);
        assert_eq!(gate.pending_count().await, 1);
    }

    #[tokio::test]
    async fn decide_recovers_a_persisted_action_without_restore() {
        let memory = Arc::new(InMemoryAuditMemory::new());
        let run = run_with_actions(&memory, &["a1"]).await;

        let gate = gate_over(memory.clone(), 16);
        let decision = gate
            .decide(&ActionId::new("a1"), DecisionKind::Validated, "ops", None)
            .await
            .unwrap();

        assert_eq!(decision.run_id, run);
        assert_eq!(gate.pending_count().await, 0);
    }
}
