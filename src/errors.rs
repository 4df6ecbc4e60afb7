//! Typed error hierarchy for the session orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `WorkflowError` — phase state machine violations
//! - `SandboxError` — sandbox provisioning and reachability failures
//! - `SyncError` — version-control host and working-tree failures
//!
//! Recovery deliberately has no error enum: `recover_session` accumulates
//! failures into `RecoveryResult.errors` and never raises, since recovery is
//! itself the error-handling path.

use thiserror::Error;

/// Errors from the phase workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid project metadata: missing required field '{field}'")]
    InvalidProjectMeta { field: String },

    #[error("Cannot advance from phase {current}: {reason}")]
    InvalidPhaseTransition { current: u32, reason: String },

    #[error("Quality gate not met for phase {phase}: missing {missing:?}")]
    QualityGateNotMet { phase: u32, missing: Vec<String> },

    #[error("No workflow state for session {session_id}")]
    WorkflowNotFound { session_id: String },

    #[error("Concurrent phase update rejected for session {session_id}")]
    PhaseUpdateConflict { session_id: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Errors from the sandbox lifecycle manager.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox for session {session_id}: {reason}")]
    Provision { session_id: String, reason: String },

    #[error("Sandbox for session {session_id} is unreachable: {reason}")]
    Unreachable { session_id: String, reason: String },

    #[error("No sandbox registered for session {0}")]
    NotFound(String),

    #[error("Agent output could not be parsed: {0}")]
    MalformedAgentOutput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SandboxError {
    /// True for failures that should trigger the recovery path.
    pub fn is_recovery_trigger(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::NotFound(_))
    }
}

/// Errors from repository setup and sync operations.
///
/// Sync *conflicts* are data, not errors — `sync_from_github` reports them in
/// `PullReport.conflicts`. This enum covers the failures that abort an
/// operation outright.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("GitHub authentication failed: {0}")]
    Auth(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("GitHub API error: {0}")]
    Host(String),

    #[error("No repository linked to session {0}")]
    NoRepositoryLink(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
