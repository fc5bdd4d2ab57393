use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A snapshot fetched from the watched source.
///
/// `data` is opaque to the kernel except for fingerprinting and the summary
/// pointers configured on the skip policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub data: Value,
}

impl Snapshot {
    pub fn new(source_id: impl Into<String>, data: Value) -> Self {
        Self {
            source_id: source_id.into(),
            fetched_at: Utc::now(),
            data,
        }
    }
}

/// Hex digest of a snapshot's change-relevant content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Emitted by the change detector when the source fingerprint moves.
///
/// Consumed once by the orchestrator and never persisted directly; its
/// effect is persisted as a Run or a skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_id: String,
    pub fingerprint: Fingerprint,
    pub observed_at: DateTime<Utc>,
    pub is_first_observation: bool,
    /// Rows added, changed or removed since the previous observation.
    #[serde(default)]
    pub changes_detected: usize,
    /// Sum of the configured amount field over added and changed rows.
    #[serde(default)]
    pub new_amount: f64,
    pub raw_snapshot: Snapshot,
}
