//! Shared domain records for sessions, workflow state, sandboxes, snapshots,
//! recovery attempts, and repository links.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// A development session. Owned by a workspace; destroyed only by explicit
/// archival, never by recovery failure alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub status: SessionStatus,
    /// Backend-assigned id of the currently bound sandbox, if any.
    pub sandbox_id: Option<String>,
    /// Working-directory path inside the bound sandbox.
    pub workdir: Option<String>,
    pub recovery_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    AwaitingQualityGate,
    Completed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::AwaitingQualityGate => "awaiting_quality_gate",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "awaiting_quality_gate" => Ok(Self::AwaitingQualityGate),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Per-phase bookkeeping inside a `WorkflowState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseState {
    pub number: u32,
    /// Subagent role tag bound to this phase.
    pub role: String,
    pub status: PhaseStatus,
    /// Opaque structured payload supplied by the agent. Merged
    /// last-write-wins per top-level field.
    pub progress: Value,
    pub gate_passed: bool,
}

impl PhaseState {
    pub fn new(number: u32, role: &str, status: PhaseStatus) -> Self {
        Self {
            number,
            role: role.to_string(),
            status,
            progress: Value::Object(serde_json::Map::new()),
            gate_passed: false,
        }
    }
}

/// 1:1 with `Session`. `current_phase` is monotonically non-decreasing; a
/// phase cannot be completed until its quality gate has passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub session_id: String,
    pub workspace_id: String,
    pub current_phase: u32,
    pub phases: Vec<PhaseState>,
    /// Named outputs accumulated across phases.
    pub artifacts: HashMap<String, Value>,
}

impl WorkflowState {
    pub fn current(&self) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.number == self.current_phase)
    }

    pub fn current_mut(&mut self) -> Option<&mut PhaseState> {
        let n = self.current_phase;
        self.phases.iter_mut().find(|p| p.number == n)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Provisioning,
    Ready,
    Executing,
    Idle,
    Terminating,
    Terminated,
    Error,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Idle => "idle",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }
}

/// Immutable point-in-time capture of session state, used for recovery.
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub workspace_id: String,
    pub chat_history: Value,
    pub requirements: String,
    pub workflow_state: WorkflowState,
    pub artifacts: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only record of one recovery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryLog {
    pub id: i64,
    pub session_id: String,
    pub workspace_id: String,
    pub attempt: u32,
    pub session_restored: bool,
    pub sandbox_reconnected: bool,
    pub workflow_restored: bool,
    pub context_restored: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl RecoveryLog {
    /// An attempt counts as successful when the session came back with a
    /// usable workflow, regardless of whether the old sandbox survived.
    pub fn succeeded(&self) -> bool {
        self.session_restored && self.workflow_restored
    }
}

/// Association between a session and a version-control repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryLink {
    pub session_id: String,
    pub workspace_id: String,
    /// `owner/repo` slug on the host.
    pub owner_repo: String,
    pub default_branch: String,
    pub html_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            _ => Err(format!("Invalid sync direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Succeeded,
    Conflicted,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "conflicted" => Ok(Self::Conflicted),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid sync outcome: {}", s)),
        }
    }
}

/// One entry in the ring of recent sync operations for a repository link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: i64,
    pub session_id: String,
    pub workspace_id: String,
    pub direction: SyncDirection,
    pub commit_sha: Option<String>,
    pub conflicts: Vec<String>,
    pub outcome: SyncOutcome,
    pub created_at: DateTime<Utc>,
}
