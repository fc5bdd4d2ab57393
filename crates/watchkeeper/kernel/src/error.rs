//! Error taxonomy for the decision kernel.

use std::time::Duration;
use thiserror::Error;
use watchkeeper_storage::StorageError;
use watchkeeper_types::{ActionId, DecisionKind};

/// Snapshot fetch failed. Transient: retried on the next tick.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("snapshot source failed: {0}")]
    Source(String),

    #[error("snapshot fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// The external analysis provider failed or timed out.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis provider failed: {0}")]
    Provider(String),

    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),
}

/// Validation gate errors, returned to the caller of `decide`.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("unknown action: {0}")]
    UnknownAction(ActionId),

    #[error("action {action_id} already {decision}")]
    AlreadyDecided {
        action_id: ActionId,
        decision: DecisionKind,
    },

    #[error("failed to record decision: {0}")]
    Storage(#[from] StorageError),
}

/// Start/stop misuse.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),
}

/// Errors surfaced to the caller of `trigger`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    /// The outcome was not recorded. No run exists for this evaluation.
    #[error("audit write failed: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("orchestrator stopped before the trigger was evaluated")]
    Stopped,
}

/// Errors from the agent facade.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
}
