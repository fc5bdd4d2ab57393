//! Lifecycle control surface.
//!
//! Each operation maps onto one orchestrator or gate call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use watchkeeper_storage::AuditMemory;
use watchkeeper_types::{ActionId, ChangeEvent, Decision, DecisionKind, Fingerprint};

use crate::broadcaster::{EventBroadcaster, Subscription};
use crate::config::KernelConfig;
use crate::detector::{ChangeDetector, DetectorHandle};
use crate::error::{AgentError, LifecycleError};
use crate::gate::ValidationGate;
use crate::orchestrator::{
    EvaluationOutcome, OrchestratorState, RunOrchestrator, CONTEXT_LAST_FINGERPRINT,
};

/// Point-in-time view of the agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub state: OrchestratorState,
    pub last_fingerprint: Option<Fingerprint>,
    pub pending_actions: usize,
    /// Manual triggers waiting for the orchestrator.
    pub queued_triggers: usize,
    /// Change events detected but not yet evaluated.
    pub queued_changes: usize,
    pub subscribers: usize,
    pub last_run_at: Option<DateTime<Utc>>,
}

struct Running {
    detector: DetectorHandle,
    events: mpsc::WeakSender<ChangeEvent>,
}

impl Running {
    fn buffered_changes(&self) -> usize {
        self.events
            .upgrade()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }
}

pub struct MonitorAgent {
    config: KernelConfig,
    memory: Arc<dyn AuditMemory>,
    broadcaster: Arc<EventBroadcaster>,
    gate: Arc<ValidationGate>,
    detector: Arc<ChangeDetector>,
    orchestrator: Arc<RunOrchestrator>,
    running: Mutex<Option<Running>>,
}

impl MonitorAgent {
    pub(crate) fn new(
        config: KernelConfig,
        memory: Arc<dyn AuditMemory>,
        broadcaster: Arc<EventBroadcaster>,
        gate: Arc<ValidationGate>,
        detector: Arc<ChangeDetector>,
        orchestrator: Arc<RunOrchestrator>,
    ) -> Self {
        Self {
            config,
            memory,
            broadcaster,
            gate,
            detector,
            orchestrator,
            running: Mutex::new(None),
        }
    }

    pub fn memory(&self) -> &Arc<dyn AuditMemory> {
        &self.memory
    }

    pub fn gate(&self) -> &Arc<ValidationGate> {
        &self.gate
    }

    pub fn orchestrator(&self) -> &Arc<RunOrchestrator> {
        &self.orchestrator
    }

    /// Rebuild open actions from the audit memory, start the orchestrator,
    /// then the detector feeding it.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut slot = self.running.lock().await;
        if slot.is_some() {
            return Err(LifecycleError::AlreadyRunning("monitor agent").into());
        }

        self.gate.restore().await?;

        let (events_tx, events_rx) = mpsc::channel(self.config.orchestrator.queue_capacity.max(1));
        let events = events_tx.downgrade();
        self.orchestrator.start(events_rx)?;

        match self.detector.start(events_tx) {
            Ok(detector) => *slot = Some(Running { detector, events }),
            Err(err) => {
                let _ = self.orchestrator.stop().await;
                return Err(err.into());
            }
        }

        tracing::info!("Monitor agent started");
        Ok(())
    }

    /// Stop polling first, then let the orchestrator finish its current
    /// evaluation.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(LifecycleError::NotRunning("monitor agent"))?;

        running.detector.stop().await;
        self.orchestrator.stop().await?;

        tracing::info!("Monitor agent stopped");
        Ok(())
    }

    pub async fn status(&self) -> Result<AgentStatus, AgentError> {
        let last_fingerprint = match self.detector.last_fingerprint().await {
            Some(fp) => Some(fp),
            None => self
                .memory
                .get_context_entry(CONTEXT_LAST_FINGERPRINT)
                .await?
                .and_then(|entry| entry.value.as_str().map(Fingerprint::new)),
        };
        let last_run_at = self.memory.get_last_run().await?.map(|run| run.timestamp);
        let (running, buffered_changes) = match self.running.lock().await.as_ref() {
            Some(active) => (true, active.buffered_changes()),
            None => (false, 0),
        };

        Ok(AgentStatus {
            running,
            state: self.orchestrator.state(),
            last_fingerprint,
            pending_actions: self.gate.pending_count().await,
            queued_triggers: self.orchestrator.queued_triggers(),
            queued_changes: buffered_changes + self.orchestrator.carried_over_changes(),
            subscribers: self.broadcaster.subscriber_count(),
            last_run_at,
        })
    }

    /// Evaluate on demand against a fresh snapshot.
    pub async fn trigger(&self, reason: impl Into<String>) -> Result<EvaluationOutcome, AgentError> {
        Ok(self.orchestrator.trigger(reason).await?)
    }

    pub async fn validate(
        &self,
        action_id: &ActionId,
        decision: DecisionKind,
        validated_by: &str,
        comment: Option<String>,
    ) -> Result<Decision, AgentError> {
        Ok(self
            .gate
            .decide(action_id, decision, validated_by, comment)
            .await?)
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }
}
