//! Kernel configuration.
//!
//! Every struct has a usable `Default`, so a config file only needs the
//! keys it overrides. Durations are stored in milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use watchkeeper_types::Severity;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub detector: DetectorConfig,
    pub policy: SkipPolicyConfig,
    pub orchestrator: OrchestratorConfig,
    pub gate: GateConfig,
    pub broadcaster: BroadcasterConfig,
}

/// Change detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Identifier stamped on snapshots and change events.
    pub source_id: String,

    /// Time between polls.
    pub poll_interval_ms: u64,

    /// Upper bound on a single fetch.
    pub fetch_timeout_ms: u64,

    /// Keys excluded from fingerprinting at any depth.
    pub volatile_fields: Vec<String>,

    /// Per-row field summed into `new_amount` for added or changed rows.
    pub amount_field: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            source_id: "primary".into(),
            poll_interval_ms: 60_000,
            fetch_timeout_ms: 10_000,
            volatile_fields: vec![
                "timestamp".into(),
                "fetched_at".into(),
                "polled_at".into(),
                "last_polled".into(),
            ],
            amount_field: "amount".into(),
        }
    }
}

impl DetectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Skip policy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipPolicyConfig {
    /// Absolute balance change that forces an analysis.
    pub balance_delta_threshold: f64,

    /// Absolute runway change (days) that forces an analysis.
    pub runway_delta_threshold_days: f64,

    /// Absolute risk-count change that forces an analysis.
    pub risk_delta_threshold: u32,

    /// Changes classified at or above this severity are always analyzed.
    pub severity_floor: Severity,

    /// `|new_amount|` at or above which a change is high severity.
    pub high_amount: f64,

    /// `|new_amount|` at or above which a change is critical.
    pub critical_amount: f64,

    /// Row-change count at or above which a change is at least medium.
    pub change_count_medium: usize,

    /// JSON pointers used to derive a run summary from raw snapshot data.
    pub balance_pointer: String,
    pub runway_pointer: String,
    pub risk_pointer: String,
}

impl Default for SkipPolicyConfig {
    fn default() -> Self {
        Self {
            balance_delta_threshold: 100.0,
            runway_delta_threshold_days: 7.0,
            risk_delta_threshold: 1,
            severity_floor: Severity::Medium,
            high_amount: 1_000.0,
            critical_amount: 10_000.0,
            change_count_medium: 10,
            balance_pointer: "/balance".into(),
            runway_pointer: "/runway_days".into(),
            risk_pointer: "/risk_count".into(),
        }
    }
}

/// Run orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on one analysis call.
    pub analysis_timeout_ms: u64,

    /// Upper bound on the optional narrative call.
    pub narrative_timeout_ms: u64,

    /// Capacity of the manual trigger queue.
    pub queue_capacity: usize,

    /// How long to hold in `AwaitingValidation` before returning to idle.
    /// `None` waits until every proposed action is decided.
    pub validation_wait_ms: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            analysis_timeout_ms: 120_000,
            narrative_timeout_ms: 30_000,
            queue_capacity: 64,
            validation_wait_ms: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    pub fn narrative_timeout(&self) -> Duration {
        Duration::from_millis(self.narrative_timeout_ms)
    }

    pub fn validation_wait(&self) -> Option<Duration> {
        self.validation_wait_ms.map(Duration::from_millis)
    }
}

/// Validation gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Most recent runs scanned for undecided actions on restore, and when a
    /// decision names an action the gate no longer holds.
    pub restore_window_runs: usize,

    /// Decided actions remembered in memory to answer repeat decisions.
    pub recently_resolved: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            restore_window_runs: 200,
            recently_resolved: 256,
        }
    }
}

/// Event broadcaster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Per-subscriber buffer. A subscriber whose buffer is full is dropped.
    pub subscriber_buffer: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}
