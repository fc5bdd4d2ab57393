//! Watchkeeper shared types.
//!
//! Record shapes persisted by the audit memory and the events fanned out to
//! observers:
//! - `Snapshot` / `ChangeEvent`: what the detector observed
//! - `Run`: one evaluation outcome, either a completed analysis or a skip
//! - `Decision`: a human verdict on a proposed action
//! - `Trigger` / `ContextEntry`: evaluation metadata and mutable bookkeeping
//! - `LifecycleEvent`: the `{type, timestamp, payload}` stream schema
//!
//! Records carry `#[serde(default)]` on every field added after the first
//! release so older rows keep deserializing; new fields must follow suit.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod decision;
pub mod event;
pub mod ids;
pub mod run;
pub mod snapshot;
pub mod trigger;

pub use decision::{Decision, DecisionKind, ProposedAction};
pub use event::{EventType, LifecycleEvent};
pub use ids::{ActionId, DecisionId, RunId, TriggerId};
pub use run::{Run, RunKind, RunSummary, Severity, SkipContext, SkipDetails};
pub use snapshot::{ChangeEvent, Fingerprint, Snapshot};
pub use trigger::{ContextEntry, Trigger, TriggerKind};
