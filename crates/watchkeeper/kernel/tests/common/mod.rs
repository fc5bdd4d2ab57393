//! Shared doubles for the kernel integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use watchkeeper_kernel::{
    AnalysisError, AnalysisProvider, AnalysisReport, ChangeDetector, EventBroadcaster, FetchError,
    KernelConfig, NarrativeFacts, NarrativeProvider, RunOrchestrator, SkipPolicy, SnapshotSource,
    Subscription, TreasurySummary, ValidationGate,
};
use watchkeeper_storage::AuditMemory;
use watchkeeper_types::{ActionId, ChangeEvent, EventType, LifecycleEvent, ProposedAction, Snapshot};

// ---------------------------------------------------------------------------
// Snapshot source
// ---------------------------------------------------------------------------

/// Source whose payload the test swaps between polls.
pub struct SettableSource {
    data: Mutex<Value>,
    failing: AtomicBool,
    pub fetches: AtomicUsize,
}

impl SettableSource {
    pub fn new(data: Value) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            failing: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, data: Value) {
        *self.data.lock().unwrap() = data;
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotSource for SettableSource {
    fn source_id(&self) -> &str {
        "ledger"
    }

    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Source("ledger unavailable".into()));
        }
        let data = self.data.lock().unwrap().clone();
        Ok(Snapshot::new("ledger", data))
    }
}

pub fn treasury(balance: f64, runway_days: f64) -> Value {
    json!({
        "balance": balance,
        "runway_days": runway_days,
        "risk_count": 0,
        "polled_at": chrono::Utc::now().to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Echoes the snapshot figures back. Proposes two actions whenever the
/// balance drops under 9000.
pub struct EchoAnalysis {
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
}

impl EchoAnalysis {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay,
            failing: AtomicBool::new(false),
        })
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisProvider for EchoAnalysis {
    async fn analyze(&self, snapshot: &Snapshot) -> Result<AnalysisReport, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(AnalysisError::Provider("model endpoint returned 503".into()));
        }

        let balance = snapshot.data["balance"].as_f64().unwrap_or(0.0);
        let runway = snapshot.data["runway_days"].as_f64().unwrap_or(0.0);
        let actions = if balance < 9_000.0 {
            vec![
                ProposedAction {
                    action_id: ActionId::generate(),
                    title: "Delay discretionary spend".into(),
                    details: json!({"amount": 1500}),
                },
                ProposedAction {
                    action_id: ActionId::generate(),
                    title: "Chase overdue invoices".into(),
                    details: Value::Null,
                },
            ]
        } else {
            Vec::new()
        };

        Ok(AnalysisReport {
            risks: Vec::new(),
            actions,
            treasury_summary: TreasurySummary {
                current_balance: balance,
                cash_runway_days: runway,
                ..Default::default()
            },
        })
    }
}

pub struct FixedNarrative(pub Result<String, String>);

#[async_trait]
impl NarrativeProvider for FixedNarrative {
    async fn narrate(&self, _facts: &NarrativeFacts) -> Result<String, AnalysisError> {
        self.0.clone().map_err(AnalysisError::Provider)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Arc<RunOrchestrator>,
    pub gate: Arc<ValidationGate>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub detector: Arc<ChangeDetector>,
    pub events: mpsc::Sender<ChangeEvent>,
}

/// Orchestrator started against a hand-fed event channel; the detector is
/// constructed but never started.
pub fn harness(
    config: KernelConfig,
    memory: Arc<dyn AuditMemory>,
    source: Arc<dyn SnapshotSource>,
    analysis: Arc<dyn AnalysisProvider>,
    narrative: Option<Arc<dyn NarrativeProvider>>,
) -> Harness {
    let broadcaster = Arc::new(EventBroadcaster::new(config.broadcaster.clone()));
    let gate = Arc::new(ValidationGate::new(memory.clone(), broadcaster.clone()));
    let detector = Arc::new(ChangeDetector::new(source, config.detector.clone()));

    let mut orchestrator = RunOrchestrator::new(
        config.orchestrator.clone(),
        SkipPolicy::new(config.policy.clone()),
        memory,
        gate.clone(),
        broadcaster.clone(),
        detector.clone(),
        analysis,
    );
    if let Some(narrative) = narrative {
        orchestrator = orchestrator.with_narrative(narrative);
    }
    let orchestrator = Arc::new(orchestrator);

    let (events, events_rx) = mpsc::channel(16);
    orchestrator.start(events_rx).unwrap();

    Harness {
        orchestrator,
        gate,
        broadcaster,
        detector,
        events,
    }
}

/// Next `run_completed` or `run_skipped` event.
pub async fn next_outcome(subscription: &mut Subscription) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = subscription.recv().await.expect("subscription open");
            if matches!(
                event.event_type,
                EventType::RunCompleted | EventType::RunSkipped
            ) {
                return event;
            }
        }
    })
    .await
    .expect("outcome event within 5s")
}
