//! Run orchestrator.
//!
//! A single worker task consumes change events and manual triggers one at
//! a time:
//!
//! ```text
//! Idle -> Evaluating -> Skipped -> Idle
//!                    -> Analyzing -> [AwaitingValidation] -> Resolved -> Idle
//! ```
//!
//! Every evaluation that reaches `Skipped` or finishes `Analyzing` writes
//! exactly one run through the audit memory and publishes exactly one
//! lifecycle event. A failed analysis writes nothing and returns to `Idle`.
//! Triggers that arrive mid-evaluation wait in the queue. Change events the
//! worker has not consumed when it stops are kept and evaluated first on the
//! next start.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use watchkeeper_storage::{AuditMemory, RunAppend, SkipAppend, TriggerAppend};
use watchkeeper_types::{
    ActionId, ChangeEvent, EventType, Fingerprint, LifecycleEvent, Run, RunId, SkipContext,
    Snapshot, TriggerKind,
};

use crate::broadcaster::EventBroadcaster;
use crate::config::OrchestratorConfig;
use crate::detector::ChangeDetector;
use crate::error::{AnalysisError, LifecycleError, OrchestratorError};
use crate::gate::ValidationGate;
use crate::policy::{SkipPolicy, TriggerContext, Verdict};
use crate::provider::{AnalysisProvider, AnalysisReport, NarrativeFacts, NarrativeProvider};

/// Context keys maintained after each evaluation.
pub const CONTEXT_LAST_FINGERPRINT: &str = "last_fingerprint";
pub const CONTEXT_LAST_OUTCOME: &str = "last_outcome";
pub const CONTEXT_LAST_EVALUATED_AT: &str = "last_evaluated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Evaluating,
    Skipped,
    Analyzing,
    AwaitingValidation,
    Resolved,
}

impl OrchestratorState {
    /// States in which a new trigger may start.
    pub fn accepts_trigger(&self) -> bool {
        matches!(self, OrchestratorState::Idle | OrchestratorState::Resolved)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Evaluating => "evaluating",
            OrchestratorState::Skipped => "skipped",
            OrchestratorState::Analyzing => "analyzing",
            OrchestratorState::AwaitingValidation => "awaiting_validation",
            OrchestratorState::Resolved => "resolved",
        };
        f.write_str(name)
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub enum EvaluationOutcome {
    Skipped(Run),
    Completed { run: Run, actions: Vec<ActionId> },
}

impl EvaluationOutcome {
    pub fn run(&self) -> &Run {
        match self {
            EvaluationOutcome::Skipped(run) | EvaluationOutcome::Completed { run, .. } => run,
        }
    }
}

type Reply = oneshot::Sender<Result<EvaluationOutcome, OrchestratorError>>;

struct ManualRequest {
    reason: String,
    respond: Reply,
}

enum Input {
    Change(ChangeEvent),
    Manual(String),
}

struct Worker {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<mpsc::Receiver<ManualRequest>>,
}

pub struct RunOrchestrator {
    config: OrchestratorConfig,
    policy: SkipPolicy,
    memory: Arc<dyn AuditMemory>,
    gate: Arc<ValidationGate>,
    broadcaster: Arc<EventBroadcaster>,
    detector: Arc<ChangeDetector>,
    analysis: Arc<dyn AnalysisProvider>,
    narrative: Option<Arc<dyn NarrativeProvider>>,
    state: watch::Sender<OrchestratorState>,
    requests_tx: Mutex<mpsc::Sender<ManualRequest>>,
    requests_rx: Mutex<Option<mpsc::Receiver<ManualRequest>>>,
    backlog: Mutex<VecDeque<ChangeEvent>>,
    queued: AtomicUsize,
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        policy: SkipPolicy,
        memory: Arc<dyn AuditMemory>,
        gate: Arc<ValidationGate>,
        broadcaster: Arc<EventBroadcaster>,
        detector: Arc<ChangeDetector>,
        analysis: Arc<dyn AnalysisProvider>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Self {
            config,
            policy,
            memory,
            gate,
            broadcaster,
            detector,
            analysis,
            narrative: None,
            state,
            requests_tx: Mutex::new(requests_tx),
            requests_rx: Mutex::new(Some(requests_rx)),
            backlog: Mutex::new(VecDeque::new()),
            queued: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    pub fn with_narrative(mut self, narrative: Arc<dyn NarrativeProvider>) -> Self {
        self.narrative = Some(narrative);
        self
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Manual triggers waiting behind the current evaluation.
    pub fn queued_triggers(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Change events carried over from a previous run of the worker.
    pub fn carried_over_changes(&self) -> usize {
        lock(&self.backlog).len()
    }

    /// Spawn the worker, consuming change events from `events`.
    pub fn start(
        self: &Arc<Self>,
        events: mpsc::Receiver<ChangeEvent>,
    ) -> Result<(), LifecycleError> {
        let mut slot = lock(&self.worker);
        if slot.is_some() {
            return Err(LifecycleError::AlreadyRunning("run orchestrator"));
        }

        let requests = match lock(&self.requests_rx).take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
                *lock(&self.requests_tx) = tx;
                rx
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_loop(events, requests, shutdown_rx).await });

        *slot = Some(Worker { shutdown, task });
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the worker after the current evaluation finishes. Manual
    /// triggers still queued, or sent while stopping, fail with
    /// [`OrchestratorError::Stopped`]; the next start opens a fresh queue.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let worker = lock(&self.worker)
            .take()
            .ok_or(LifecycleError::NotRunning("run orchestrator"))?;
        self.running.store(false, Ordering::SeqCst);
        let _ = worker.shutdown.send(true);

        match worker.task.await {
            Ok(mut requests) => {
                // Closing first means every send either lands before the
                // drain below or fails.
                requests.close();
                while let Ok(request) = requests.try_recv() {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    let _ = request.respond.send(Err(OrchestratorError::Stopped));
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "Run orchestrator task panicked");
            }
        }

        self.set_state(OrchestratorState::Idle);
        Ok(())
    }

    /// Queue a manual evaluation against a freshly fetched snapshot and
    /// wait for its outcome.
    pub async fn trigger(
        &self,
        reason: impl Into<String>,
    ) -> Result<EvaluationOutcome, OrchestratorError> {
        if !self.is_running() {
            return Err(LifecycleError::NotRunning("run orchestrator").into());
        }

        let (respond, outcome) = oneshot::channel();
        let request = ManualRequest {
            reason: reason.into(),
            respond,
        };
        let sender = lock(&self.requests_tx).clone();

        self.queued.fetch_add(1, Ordering::SeqCst);
        if sender.send(request).await.is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(OrchestratorError::Stopped);
        }

        outcome.await.map_err(|_| OrchestratorError::Stopped)?
    }

    async fn run_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChangeEvent>,
        mut requests: mpsc::Receiver<ManualRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<ManualRequest> {
        tracing::info!(
            carried_over = self.carried_over_changes(),
            "Run orchestrator started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let carried = lock(&self.backlog).pop_front();
            if let Some(event) = carried {
                self.process(Input::Change(event), None, &mut shutdown).await;
                continue;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(request) = requests.recv() => {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    self.process(Input::Manual(request.reason), Some(request.respond), &mut shutdown)
                        .await;
                }
                Some(event) = events.recv() => {
                    self.process(Input::Change(event), None, &mut shutdown).await;
                }
            }
        }

        events.close();
        let mut kept = 0;
        {
            let mut backlog = lock(&self.backlog);
            while let Ok(event) = events.try_recv() {
                backlog.push_back(event);
                kept += 1;
            }
        }

        tracing::info!(kept_changes = kept, "Run orchestrator stopped");
        requests
    }

    async fn process(
        &self,
        input: Input,
        respond: Option<Reply>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let result = self.evaluate(input).await;

        let completed = match &result {
            Ok(EvaluationOutcome::Completed { run, actions }) => {
                Some((run.id.clone(), !actions.is_empty()))
            }
            Ok(EvaluationOutcome::Skipped(_)) => {
                self.set_state(OrchestratorState::Idle);
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "Evaluation failed; no run recorded");
                self.set_state(OrchestratorState::Idle);
                None
            }
        };

        if let Some(respond) = respond {
            let _ = respond.send(result);
        }

        if let Some((run_id, has_actions)) = completed {
            if has_actions {
                self.set_state(OrchestratorState::AwaitingValidation);
                self.await_validation(&run_id, shutdown).await;
            }
            self.set_state(OrchestratorState::Resolved);
            self.set_state(OrchestratorState::Idle);
        }
    }

    async fn evaluate(&self, input: Input) -> Result<EvaluationOutcome, OrchestratorError> {
        self.set_state(OrchestratorState::Evaluating);

        let (trigger, snapshot, fingerprint) = match input {
            Input::Change(event) => {
                let kind = if event.is_first_observation {
                    TriggerKind::FirstObservation
                } else {
                    TriggerKind::SourceChange
                };
                let reason = if event.is_first_observation {
                    format!("first observation of {}", event.source_id)
                } else {
                    format!(
                        "{} changed ({} rows)",
                        event.source_id, event.changes_detected
                    )
                };
                let trigger = TriggerContext {
                    kind,
                    reason,
                    changes_detected: event.changes_detected,
                    new_amount: event.new_amount,
                };
                (trigger, event.raw_snapshot, event.fingerprint)
            }
            Input::Manual(reason) => {
                let snapshot = self.detector.fetch().await?;
                let fingerprint = self.detector.fingerprinter().fingerprint(&snapshot);
                let trigger = TriggerContext {
                    kind: TriggerKind::Manual,
                    reason,
                    changes_detected: 0,
                    new_amount: 0.0,
                };
                (trigger, snapshot, fingerprint)
            }
        };

        let saved = self
            .memory
            .save_trigger(TriggerAppend {
                kind: trigger.kind,
                reason: trigger.reason.clone(),
                source_id: Some(snapshot.source_id.clone()),
                fingerprint: Some(fingerprint.clone()),
                metadata: json!({
                    "changes_detected": trigger.changes_detected,
                    "new_amount": trigger.new_amount,
                }),
            })
            .await?;

        let last_run = self.memory.get_last_run().await?;
        let current = self.policy.derive_summary(&snapshot);
        let verdict = self
            .policy
            .evaluate(&trigger, current.as_ref(), last_run.as_ref());

        tracing::debug!(
            trigger_id = %saved.id,
            kind = %trigger.kind,
            skip = verdict.is_skip(),
            reason = verdict.reason(),
            "Skip policy evaluated"
        );

        let outcome = match verdict {
            Verdict::Skip { reason, severity } => {
                self.set_state(OrchestratorState::Skipped);
                let run = self
                    .memory
                    .save_skip(SkipAppend {
                        timestamp: Utc::now(),
                        trigger_reason: trigger.reason.clone(),
                        summary: current.unwrap_or_default(),
                        reason,
                        severity,
                        context_summary: SkipContext {
                            trigger_type: trigger.kind.to_string(),
                            changes_detected: trigger.changes_detected,
                            new_amount: trigger.new_amount,
                        },
                    })
                    .await?;

                tracing::info!(
                    run_id = %run.id,
                    reason = run.skip_reason().unwrap_or_default(),
                    "Analysis skipped"
                );
                self.broadcaster
                    .publish(LifecycleEvent::with(EventType::RunSkipped, &run));
                EvaluationOutcome::Skipped(run)
            }
            Verdict::Analyze {
                reason: policy_reason,
                severity,
            } => {
                self.set_state(OrchestratorState::Analyzing);
                self.broadcaster.publish(LifecycleEvent::new(
                    EventType::RunStarted,
                    json!({
                        "trigger_id": saved.id,
                        "trigger_reason": trigger.reason,
                        "policy_reason": policy_reason,
                        "severity": severity,
                    }),
                ));

                let report = self.analyze(&snapshot).await?;
                let narrative = self.narrate(&trigger, &report).await;
                let summary = report.summary();

                let run = self
                    .memory
                    .save_run(RunAppend {
                        timestamp: Utc::now(),
                        trigger_reason: trigger.reason.clone(),
                        summary,
                        deliverables: json!({
                            "risks": report.risks,
                            "actions": report.actions,
                            "treasury_summary": report.treasury_summary,
                            "narrative": narrative,
                            "policy_reason": policy_reason,
                            "trigger_severity": severity,
                        }),
                    })
                    .await?;

                tracing::info!(
                    run_id = %run.id,
                    risks = summary.risk_count,
                    actions = summary.action_count,
                    "Analysis run recorded"
                );
                self.broadcaster
                    .publish(LifecycleEvent::with(EventType::RunCompleted, &run));

                let actions = self.gate.propose(&run.id, report.actions).await;
                EvaluationOutcome::Completed { run, actions }
            }
        };

        self.remember(&outcome, &fingerprint).await;
        Ok(outcome)
    }

    async fn analyze(&self, snapshot: &Snapshot) -> Result<AnalysisReport, AnalysisError> {
        let limit = self.config.analysis_timeout();
        timeout(limit, self.analysis.analyze(snapshot))
            .await
            .map_err(|_| AnalysisError::Timeout(limit))?
    }

    // Narrative failures never fail the run.
    async fn narrate(&self, trigger: &TriggerContext, report: &AnalysisReport) -> Option<String> {
        let provider = self.narrative.as_ref()?;
        let facts = NarrativeFacts {
            trigger_reason: trigger.reason.clone(),
            summary: report.summary(),
            risks: report.risks.clone(),
            actions: report.actions.clone(),
        };

        let limit = self.config.narrative_timeout();
        match timeout(limit, provider.narrate(&facts)).await {
            Ok(Ok(text)) => Some(text),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Narrative generation failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Narrative generation timed out");
                None
            }
        }
    }

    async fn remember(&self, outcome: &EvaluationOutcome, fingerprint: &Fingerprint) {
        let run = outcome.run();
        let entries = [
            (CONTEXT_LAST_FINGERPRINT, json!(fingerprint)),
            (
                CONTEXT_LAST_OUTCOME,
                json!({
                    "run_id": run.id,
                    "kind": run.kind,
                    "reason": run.skip_reason().unwrap_or(run.trigger_reason.as_str()),
                }),
            ),
            (CONTEXT_LAST_EVALUATED_AT, json!(run.timestamp)),
        ];

        for (key, value) in entries {
            if let Err(err) = self.memory.upsert_context(key, value).await {
                tracing::warn!(error = %err, key, "Failed to update context");
            }
        }
    }

    async fn await_validation(&self, run_id: &RunId, shutdown: &mut watch::Receiver<bool>) {
        let wait = async {
            match self.config.validation_wait() {
                Some(limit) => {
                    if timeout(limit, self.gate.wait_until_resolved(run_id)).await.is_err() {
                        tracing::info!(run_id = %run_id, "Validation window elapsed; actions stay pending");
                    }
                }
                None => self.gate.wait_until_resolved(run_id).await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                tracing::info!(run_id = %run_id, "Stopping with actions still pending");
            }
            _ = wait => {}
        }
    }

    fn set_state(&self, next: OrchestratorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Orchestrator state changed");
        }
    }
}
