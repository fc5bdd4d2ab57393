//! Watchkeeper decision kernel.
//!
//! Components, leaf-first:
//! - [`Fingerprinter`]: stable digest of a snapshot, blind to volatile fields
//! - [`ChangeDetector`]: polls a [`SnapshotSource`] and emits change events
//! - [`SkipPolicy`]: decides whether a change warrants a full analysis
//! - [`RunOrchestrator`]: single-flight state machine that records every
//!   run or skip through the audit memory
//! - [`ValidationGate`]: holds proposed actions until a human decides
//! - [`EventBroadcaster`]: fans lifecycle events out to subscribers
//!
//! [`MonitorAgent`] wires them together and exposes the lifecycle control
//! surface (`start`, `stop`, `status`, `trigger`, `validate`).

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod agent;
pub mod broadcaster;
pub mod builder;
pub mod config;
pub mod detector;
pub mod error;
pub mod fingerprint;
pub mod gate;
pub mod orchestrator;
pub mod policy;
pub mod provider;
pub mod source;

pub use agent::{AgentStatus, MonitorAgent};
pub use broadcaster::{EventBroadcaster, Subscription};
pub use builder::MonitorAgentBuilder;
pub use config::{
    BroadcasterConfig, DetectorConfig, GateConfig, KernelConfig, OrchestratorConfig,
    SkipPolicyConfig,
};
pub use detector::{ChangeDetector, DetectorHandle};
pub use error::{AgentError, AnalysisError, FetchError, GateError, LifecycleError, OrchestratorError};
pub use fingerprint::Fingerprinter;
pub use gate::{ActionStatus, PendingAction, ValidationGate};
pub use orchestrator::{EvaluationOutcome, OrchestratorState, RunOrchestrator};
pub use policy::{SkipPolicy, TriggerContext, Verdict};
pub use provider::{AnalysisProvider, AnalysisReport, NarrativeFacts, NarrativeProvider, TreasurySummary};
pub use source::SnapshotSource;
