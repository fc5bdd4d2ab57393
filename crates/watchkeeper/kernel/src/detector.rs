//! Change detector.
//!
//! Polls a [`SnapshotSource`] on a fixed interval and emits a
//! [`ChangeEvent`] only when the snapshot fingerprint moves. The first
//! successful poll always emits. Fetch failures leave the remembered
//! fingerprint untouched and are retried on the next tick. A change that
//! could not be handed to the consumer clears the baseline, so the next
//! poll reports the current content again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use watchkeeper_types::{ChangeEvent, Fingerprint, Snapshot};

use crate::config::DetectorConfig;
use crate::error::{FetchError, LifecycleError};
use crate::fingerprint::Fingerprinter;
use crate::source::SnapshotSource;

#[derive(Default)]
struct DetectorState {
    last_fingerprint: Option<Fingerprint>,
    rows: BTreeMap<String, Fingerprint>,
}

/// Fingerprint-based change detector.
pub struct ChangeDetector {
    source: Arc<dyn SnapshotSource>,
    fingerprinter: Fingerprinter,
    config: DetectorConfig,
    state: Mutex<DetectorState>,
    running: AtomicBool,
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn SnapshotSource>, config: DetectorConfig) -> Self {
        let fingerprinter = Fingerprinter::new(config.volatile_fields.iter().cloned());
        Self {
            source,
            fingerprinter,
            config,
            state: Mutex::new(DetectorState::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.state.lock().await.last_fingerprint.clone()
    }

    /// Fetch one snapshot, bounded by the configured timeout.
    pub async fn fetch(&self) -> Result<Snapshot, FetchError> {
        let limit = self.config.fetch_timeout();
        timeout(limit, self.source.fetch())
            .await
            .map_err(|_| FetchError::Timeout(limit))?
    }

    /// Fetch, fingerprint and compare once.
    ///
    /// Returns `Ok(None)` when the content is unchanged.
    pub async fn poll_once(&self) -> Result<Option<ChangeEvent>, FetchError> {
        let snapshot = self.fetch().await?;
        let fingerprint = self.fingerprinter.fingerprint(&snapshot);
        let rows = self.fingerprinter.row_fingerprints(&snapshot.data);

        let mut state = self.state.lock().await;
        let is_first_observation = state.last_fingerprint.is_none();
        if state.last_fingerprint.as_ref() == Some(&fingerprint) {
            return Ok(None);
        }

        let changed = changed_rows(&state.rows, &rows);
        let new_amount = self.amount_of(&snapshot.data, &changed);

        tracing::debug!(
            source_id = %snapshot.source_id,
            fingerprint = %fingerprint.short(),
            first = is_first_observation,
            changes = changed.len(),
            "Snapshot changed"
        );

        state.last_fingerprint = Some(fingerprint.clone());
        state.rows = rows;

        Ok(Some(ChangeEvent {
            source_id: snapshot.source_id.clone(),
            fingerprint,
            observed_at: Utc::now(),
            is_first_observation,
            changes_detected: changed.len(),
            new_amount,
            raw_snapshot: snapshot,
        }))
    }

    /// Drop the remembered fingerprint and rows. The next poll is treated as
    /// a first observation.
    pub async fn reset_baseline(&self) {
        *self.state.lock().await = DetectorState::default();
    }

    /// Start the poll loop, forwarding change events to `events`.
    pub fn start(
        self: &Arc<Self>,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<DetectorHandle, LifecycleError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyRunning("change detector"));
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let detector = Arc::clone(self);
        let period = self.config.poll_interval();

        let task = tokio::spawn(async move {
            tracing::info!(
                source_id = %detector.source.source_id(),
                interval_ms = period.as_millis() as u64,
                "Change detector started"
            );

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                // An in-flight fetch is allowed to finish after stop is requested.
                match detector.poll_once().await {
                    Ok(Some(event)) => {
                        let delivered = tokio::select! {
                            biased;
                            sent = events.send(event) => sent.is_ok(),
                            _ = shutdown_rx.changed() => false,
                        };
                        if !delivered {
                            detector.reset_baseline().await;
                            tracing::warn!("Change event not delivered; baseline reset, stopping detector");
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::trace!("Snapshot unchanged");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Snapshot fetch failed; retrying next tick");
                    }
                }
            }

            detector.running.store(false, Ordering::SeqCst);
            tracing::info!("Change detector stopped");
        });

        Ok(DetectorHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    fn amount_of(&self, data: &Value, changed: &[String]) -> f64 {
        self.fingerprinter
            .rows(data)
            .into_iter()
            .filter(|(key, _)| changed.iter().any(|c| c == key))
            .map(|(_, row)| row_amount(row, &self.config.amount_field))
            .sum()
    }
}

/// Handle to a running detector loop.
pub struct DetectorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DetectorHandle {
    /// Stop polling. Waits for an in-flight poll to finish; no further poll
    /// is scheduled.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "Change detector task panicked");
        }
    }
}

/// Keys added, changed, or removed between two row sets.
fn changed_rows(
    previous: &BTreeMap<String, Fingerprint>,
    current: &BTreeMap<String, Fingerprint>,
) -> Vec<String> {
    let mut changed: Vec<String> = current
        .iter()
        .filter(|(key, fp)| previous.get(*key) != Some(*fp))
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(
        previous
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned(),
    );
    changed
}

fn row_amount(row: &Value, field: &str) -> f64 {
    match row {
        Value::Object(map) => map.get(field).and_then(Value::as_f64).unwrap_or(0.0),
        Value::Array(items) => items.iter().map(|item| row_amount(item, field)).sum(),
        _ => 0.0,
    }
}
