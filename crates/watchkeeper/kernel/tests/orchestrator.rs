//! Run orchestrator behaviour against a hand-fed event channel.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{harness, next_outcome, treasury, EchoAnalysis, FixedNarrative, SettableSource};
use serde_json::Value;
use watchkeeper_kernel::{
    AnalysisError, EvaluationOutcome, KernelConfig, LifecycleError, OrchestratorError,
    OrchestratorState,
};
use watchkeeper_storage::{
    AuditMemory, AuditStatistics, DecisionAppend, InMemoryAuditMemory, QueryWindow, RunAppend,
    SkipAppend, StorageError, StorageResult, TriggerAppend,
};
use watchkeeper_types::{
    ChangeEvent, ContextEntry, Decision, DecisionKind, EventType, Run, RunId, RunKind, Trigger,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// In-memory audit memory whose run writes can be made to fail.
#[derive(Default)]
struct FlakyMemory {
    inner: InMemoryAuditMemory,
    fail_runs: AtomicBool,
}

#[async_trait]
impl AuditMemory for FlakyMemory {
    async fn save_run(&self, run: RunAppend) -> StorageResult<Run> {
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".into()));
        }
        self.inner.save_run(run).await
    }

    async fn save_skip(&self, skip: SkipAppend) -> StorageResult<Run> {
        self.inner.save_skip(skip).await
    }

    async fn get_last_run(&self) -> StorageResult<Option<Run>> {
        self.inner.get_last_run().await
    }

    async fn list_runs(&self, window: QueryWindow) -> StorageResult<Vec<Run>> {
        self.inner.list_runs(window).await
    }

    async fn save_decision(&self, decision: DecisionAppend) -> StorageResult<Decision> {
        self.inner.save_decision(decision).await
    }

    async fn get_decisions_for_run(&self, run_id: &RunId) -> StorageResult<Vec<Decision>> {
        self.inner.get_decisions_for_run(run_id).await
    }

    async fn save_trigger(&self, trigger: TriggerAppend) -> StorageResult<Trigger> {
        self.inner.save_trigger(trigger).await
    }

    async fn list_triggers(&self, window: QueryWindow) -> StorageResult<Vec<Trigger>> {
        self.inner.list_triggers(window).await
    }

    async fn upsert_context(&self, key: &str, value: Value) -> StorageResult<ContextEntry> {
        self.inner.upsert_context(key, value).await
    }

    async fn get_context_entry(&self, key: &str) -> StorageResult<Option<ContextEntry>> {
        self.inner.get_context_entry(key).await
    }

    async fn get_statistics(&self) -> StorageResult<AuditStatistics> {
        self.inner.get_statistics().await
    }

    async fn prune(&self, keep_last_n: usize) -> StorageResult<usize> {
        self.inner.prune(keep_last_n).await
    }
}

async fn change_event(
    detector: &watchkeeper_kernel::ChangeDetector,
) -> ChangeEvent {
    detector
        .poll_once()
        .await
        .expect("fetch succeeds")
        .expect("content changed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn manual_trigger_analyzes_fresh_snapshot() {
    let memory = Arc::new(InMemoryAuditMemory::new());
    let source = SettableSource::new(treasury(12_000.0, 90.0));
    let analysis = EchoAnalysis::new();
    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        source.clone(),
        analysis.clone(),
        None,
    );

    let outcome = h.orchestrator.trigger("operator request").await.unwrap();
    let EvaluationOutcome::Completed { run, actions } = outcome else {
        panic!("manual trigger must analyze");
    };
    assert_eq!(run.trigger_reason, "operator request");
    assert_eq!(run.summary.balance, 12_000.0);
    assert!(actions.is_empty());

    // Same content again: manual triggers still analyze.
    let again = h.orchestrator.trigger("second look").await.unwrap();
    assert_eq!(again.run().kind, RunKind::Complete);
    assert_eq!(analysis.calls(), 2);

    let triggers = memory.list_triggers(QueryWindow::all()).await.unwrap();
    assert_eq!(triggers.len(), 2);
    assert!(triggers.iter().all(|t| t.fingerprint.is_some()));

    let outcome = memory
        .get_context("last_outcome", Value::Null)
        .await
        .unwrap();
    assert_eq!(outcome["run_id"], again.run().id.as_str());

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn trigger_requires_running_orchestrator() {
    let h = harness(
        KernelConfig::default(),
        Arc::new(InMemoryAuditMemory::new()),
        SettableSource::new(treasury(1.0, 1.0)),
        EchoAnalysis::new(),
        None,
    );
    h.orchestrator.stop().await.unwrap();

    assert!(matches!(
        h.orchestrator.trigger("late").await,
        Err(OrchestratorError::Lifecycle(LifecycleError::NotRunning(_)))
    ));
    assert!(matches!(
        h.orchestrator.stop().await,
        Err(LifecycleError::NotRunning(_))
    ));
}

#[tokio::test]
async fn analysis_failure_records_nothing() {
    let memory = Arc::new(InMemoryAuditMemory::new());
    let analysis = EchoAnalysis::new();
    analysis.fail(true);
    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        SettableSource::new(treasury(5_000.0, 30.0)),
        analysis.clone(),
        None,
    );

    let err = h.orchestrator.trigger("check").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Analysis(AnalysisError::Provider(_))
    ));
    assert!(memory.get_last_run().await.unwrap().is_none());
    assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);

    // The trigger itself is still part of the audit trail.
    assert_eq!(memory.list_triggers(QueryWindow::all()).await.unwrap().len(), 1);

    analysis.fail(false);
    assert!(h.orchestrator.trigger("retry").await.is_ok());
    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn slow_analysis_times_out() {
    let mut config = KernelConfig::default();
    config.orchestrator.analysis_timeout_ms = 50;
    let memory = Arc::new(InMemoryAuditMemory::new());
    let h = harness(
        config,
        memory.clone(),
        SettableSource::new(treasury(5_000.0, 30.0)),
        EchoAnalysis::with_delay(Duration::from_secs(30)),
        None,
    );

    let err = h.orchestrator.trigger("check").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Analysis(AnalysisError::Timeout(_))
    ));
    assert!(memory.get_last_run().await.unwrap().is_none());
    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn storage_failure_is_surfaced_without_ghost_run() {
    let memory = Arc::new(FlakyMemory::default());
    memory.fail_runs.store(true, Ordering::SeqCst);
    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        SettableSource::new(treasury(5_000.0, 30.0)),
        EchoAnalysis::new(),
        None,
    );
    let mut events = h.broadcaster.subscribe();

    let err = h.orchestrator.trigger("check").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Storage(_)));
    assert!(memory.get_last_run().await.unwrap().is_none());
    assert_eq!(h.gate.pending_count().await, 0);

    while let Some(event) = events.try_recv() {
        assert_ne!(event.event_type, EventType::RunCompleted);
    }
    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn narrative_lands_in_deliverables_and_failures_are_ignored() {
    let memory = Arc::new(InMemoryAuditMemory::new());
    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        SettableSource::new(treasury(5_000.0, 30.0)),
        EchoAnalysis::new(),
        Some(Arc::new(FixedNarrative(Ok("Runway is healthy.".into())))),
    );
    let outcome = h.orchestrator.trigger("brief").await.unwrap();
    assert_eq!(outcome.run().deliverables["narrative"], "Runway is healthy.");
    assert_eq!(outcome.run().deliverables["policy_reason"], "manual trigger");
    h.orchestrator.stop().await.unwrap();

    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        SettableSource::new(treasury(5_000.0, 30.0)),
        EchoAnalysis::new(),
        Some(Arc::new(FixedNarrative(Err("quota exceeded".into())))),
    );
    let outcome = h.orchestrator.trigger("brief").await.unwrap();
    assert_eq!(outcome.run().kind, RunKind::Complete);
    assert!(outcome.run().deliverables["narrative"].is_null());
    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn evaluations_are_single_flight() {
    let analysis = EchoAnalysis::with_delay(Duration::from_millis(100));
    let h = harness(
        KernelConfig::default(),
        Arc::new(InMemoryAuditMemory::new()),
        SettableSource::new(treasury(10_000.0, 60.0)),
        analysis.clone(),
        None,
    );
    let orchestrator = h.orchestrator.clone();

    let mut state = orchestrator.subscribe_state();
    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.trigger("first").await }
    });
    state
        .wait_for(|s| *s == OrchestratorState::Analyzing)
        .await
        .unwrap();

    let second = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.trigger("second").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(orchestrator.queued_triggers(), 1);
    assert!(!orchestrator.state().accepts_trigger());

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(analysis.calls(), 2);
    assert_eq!(analysis.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.queued_triggers(), 0);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn stop_drains_current_evaluation() {
    let memory = Arc::new(InMemoryAuditMemory::new());
    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        SettableSource::new(treasury(10_000.0, 60.0)),
        EchoAnalysis::with_delay(Duration::from_millis(100)),
        None,
    );
    let orchestrator = h.orchestrator.clone();
    let mut state = orchestrator.subscribe_state();

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.trigger("in flight").await }
    });
    state
        .wait_for(|s| *s == OrchestratorState::Analyzing)
        .await
        .unwrap();

    orchestrator.stop().await.unwrap();
    assert!(running.await.unwrap().is_ok());
    assert_eq!(memory.get_history(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn validation_window_returns_to_idle_with_actions_pending() {
    let mut config = KernelConfig::default();
    config.orchestrator.validation_wait_ms = Some(50);
    let memory = Arc::new(InMemoryAuditMemory::new());
    let h = harness(
        config,
        memory.clone(),
        SettableSource::new(treasury(4_000.0, 20.0)),
        EchoAnalysis::new(),
        None,
    );

    let outcome = h.orchestrator.trigger("low balance").await.unwrap();
    let EvaluationOutcome::Completed { run, actions } = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(actions.len(), 2);

    let mut state = h.orchestrator.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == OrchestratorState::Idle),
    )
    .await
    .expect("idle after the validation window")
    .unwrap();

    assert_eq!(h.gate.pending_for_run(&run.id).await, 2);
    h.gate
        .decide(&actions[0], DecisionKind::Rejected, "cfo", Some("not now".into()))
        .await
        .unwrap();
    assert_eq!(h.gate.pending_for_run(&run.id).await, 1);
    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn change_events_flow_through_policy() {
    let memory = Arc::new(InMemoryAuditMemory::new());
    let source = SettableSource::new(treasury(10_000.0, 60.0));
    let analysis = EchoAnalysis::new();
    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        source.clone(),
        analysis.clone(),
        None,
    );
    let mut events = h.broadcaster.subscribe();

    h.events.send(change_event(&h.detector).await).await.unwrap();
    assert_eq!(next_outcome(&mut events).await.event_type, EventType::RunCompleted);

    source.set(treasury(10_040.0, 58.0));
    h.events.send(change_event(&h.detector).await).await.unwrap();
    let skipped = next_outcome(&mut events).await;
    assert_eq!(skipped.event_type, EventType::RunSkipped);
    assert_eq!(skipped.payload["skip"]["reason"], "delta below threshold");
    assert_eq!(skipped.payload["skip"]["severity"], "low");
    assert_eq!(
        skipped.payload["skip"]["context_summary"]["trigger_type"],
        "source_change"
    );

    source.set(treasury(10_040.0, 40.0));
    h.events.send(change_event(&h.detector).await).await.unwrap();
    assert_eq!(next_outcome(&mut events).await.event_type, EventType::RunCompleted);
    assert_eq!(analysis.calls(), 2);

    let stats = memory.get_statistics().await.unwrap();
    assert_eq!(stats.total_runs, 3);
    assert_eq!(stats.skipped_runs, 1);
    assert_eq!(stats.triggers, 3);

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn triggers_racing_stop_always_get_an_answer() {
    let h = harness(
        KernelConfig::default(),
        Arc::new(InMemoryAuditMemory::new()),
        SettableSource::new(treasury(10_000.0, 60.0)),
        EchoAnalysis::with_delay(Duration::from_millis(20)),
        None,
    );
    let orchestrator = h.orchestrator.clone();

    let mut callers = Vec::new();
    for i in 0..16 {
        let orchestrator = orchestrator.clone();
        callers.push(tokio::spawn(async move {
            if i % 2 == 1 {
                tokio::task::yield_now().await;
            }
            orchestrator.trigger(format!("caller {i}")).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    orchestrator.stop().await.unwrap();

    for caller in callers {
        let result = tokio::time::timeout(Duration::from_secs(2), caller)
            .await
            .expect("trigger answered after stop")
            .unwrap();
        assert!(
            matches!(
                result,
                Ok(_)
                    | Err(OrchestratorError::Stopped)
                    | Err(OrchestratorError::Lifecycle(LifecycleError::NotRunning(_)))
            ),
            "unexpected trigger result: {result:?}"
        );
    }
    assert_eq!(orchestrator.queued_triggers(), 0);

    // A restart opens a fresh queue.
    let (_events, events_rx) = tokio::sync::mpsc::channel(4);
    orchestrator.start(events_rx).unwrap();
    let outcome = orchestrator.trigger("after restart").await.unwrap();
    assert_eq!(outcome.run().trigger_reason, "after restart");
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn change_events_left_at_stop_run_after_restart() {
    let memory = Arc::new(InMemoryAuditMemory::new());
    let source = SettableSource::new(treasury(10_000.0, 60.0));
    let analysis = EchoAnalysis::with_delay(Duration::from_millis(100));
    let h = harness(
        KernelConfig::default(),
        memory.clone(),
        source.clone(),
        analysis.clone(),
        None,
    );
    let mut state = h.orchestrator.subscribe_state();

    h.events.send(change_event(&h.detector).await).await.unwrap();
    state
        .wait_for(|s| *s == OrchestratorState::Analyzing)
        .await
        .unwrap();
    source.set(treasury(10_000.0, 20.0));
    h.events.send(change_event(&h.detector).await).await.unwrap();

    h.orchestrator.stop().await.unwrap();
    assert_eq!(memory.get_history(10).await.unwrap().len(), 1);
    assert_eq!(h.orchestrator.carried_over_changes(), 1);

    let mut events = h.broadcaster.subscribe();
    let (_events_tx, events_rx) = tokio::sync::mpsc::channel(4);
    h.orchestrator.start(events_rx).unwrap();

    let outcome = next_outcome(&mut events).await;
    assert_eq!(outcome.event_type, EventType::RunCompleted);
    assert_eq!(outcome.payload["summary"]["runway_days"], 20.0);
    assert_eq!(h.orchestrator.carried_over_changes(), 0);
    assert_eq!(analysis.calls(), 2);

    h.orchestrator.stop().await.unwrap();
}
