//! Lifecycle event stream schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connected,
    RunStarted,
    RunCompleted,
    RunSkipped,
    DecisionRecorded,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Connected => "connected",
            EventType::RunStarted => "run_started",
            EventType::RunCompleted => "run_completed",
            EventType::RunSkipped => "run_skipped",
            EventType::DecisionRecorded => "decision_recorded",
        };
        f.write_str(name)
    }
}

/// `{type, timestamp, payload}` as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl LifecycleEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Serializes `payload` into an event; falls back to `null` if the value
    /// cannot be represented as JSON.
    pub fn with<T: Serialize>(event_type: EventType, payload: &T) -> Self {
        Self::new(
            event_type,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_key() {
        let event = LifecycleEvent::new(EventType::RunSkipped, serde_json::json!({"id": "run-1"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_skipped");
        assert_eq!(json["payload"]["id"], "run-1");
        assert!(json.get("timestamp").is_some());
    }
}
