//! Top-level session façade wiring the workflow engine, sandbox manager,
//! recovery manager, and sync orchestrator together.
//!
//! A "turn" is one agent invocation: the orchestrator sends the prompt into
//! the session's sandbox, folds any structured progress the agent reports
//! back into the workflow state, and transparently runs recovery when the
//! sandbox has died under the session.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::errors::{SandboxError, WorkflowError};
use crate::models::{Session, SessionStatus, WorkflowState};
use crate::phase::{default_phases, get_phase};
use crate::recovery::{RecoveryManager, RecoveryResult};
use crate::sandbox::backend::SandboxBackend;
use crate::sandbox::manager::{InvokeOptions, SeedContext};
use crate::sandbox::{AgentResult, SandboxManager};
use crate::store::DbHandle;
use crate::sync::githost::GitHost;
use crate::sync::orchestrator::{PushOptions, SyncOrchestrator};
use crate::workflow::{ProjectMeta, WorkflowEngine};

const REQUIREMENTS_PATH: &str = ".atelier/requirements.md";

/// Outcome of one conversational turn.
#[derive(Debug)]
pub struct TurnOutcome {
    pub agent: AgentResult,
    pub workflow: WorkflowState,
    /// Set when the turn only succeeded after a recovery pass.
    pub recovered: Option<RecoveryResult>,
}

/// Outcome of closing a session.
#[derive(Debug, Clone)]
pub struct CloseReport {
    /// None when no repository is linked; Some(sha) after a final push.
    pub final_commit: Option<String>,
    pub snapshot_id: Option<String>,
    pub sandbox_terminated: bool,
    pub warnings: Vec<String>,
}

pub struct SessionOrchestrator {
    store: DbHandle,
    workflow: WorkflowEngine,
    sandboxes: Arc<SandboxManager>,
    recovery: Arc<RecoveryManager>,
    sync: Option<SyncOrchestrator>,
}

impl SessionOrchestrator {
    pub fn new(store: DbHandle, backend: Arc<dyn SandboxBackend>, config: OrchestratorConfig) -> Self {
        let sandboxes = Arc::new(SandboxManager::new(backend, store.clone(), config.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            sandboxes.clone(),
            config.clone(),
        ));
        let workflow = WorkflowEngine::new(store.clone(), default_phases());
        Self {
            store,
            workflow,
            sandboxes,
            recovery,
            sync: None,
        }
    }

    /// Enable GitHub sync. Without a host, sync operations are unavailable
    /// and `close_session` skips the final push.
    pub fn with_git_host(mut self, host: Arc<dyn GitHost>, config: OrchestratorConfig) -> Self {
        self.sync = Some(SyncOrchestrator::new(
            self.store.clone(),
            self.sandboxes.clone(),
            self.recovery.clone(),
            host,
            config,
        ));
        self
    }

    pub fn workflow(&self) -> &WorkflowEngine {
        &self.workflow
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn sync(&self) -> Option<&SyncOrchestrator> {
        self.sync.as_ref()
    }

    pub fn store(&self) -> &DbHandle {
        &self.store
    }

    /// Create a session, initialize its phase-1 workflow, and provision a
    /// sandbox seeded with the project context.
    pub async fn create_session(
        &self,
        workspace_id: &str,
        meta: &ProjectMeta,
    ) -> Result<Session> {
        meta.validate().map_err(anyhow::Error::from)?;

        let wid = workspace_id.to_string();
        let name = meta.name.clone();
        let session = self
            .store
            .call(move |db| db.create_session(&wid, &name))
            .await?;

        self.workflow
            .initialize_workflow(&session.id, workspace_id, meta)
            .await
            .map_err(anyhow::Error::from)?;

        let seed = self.seed_for_phase(1, &session.name, &meta.requirements);
        self.sandboxes
            .provision(&session.id, workspace_id, &seed)
            .await
            .map_err(anyhow::Error::from)?;

        info!(session_id = %session.id, workspace_id, "session created");
        Ok(session)
    }

    /// Run one agent turn. A sandbox that died under the session triggers a
    /// recovery pass followed by a single retry.
    pub async fn handle_turn(
        &self,
        session_id: &str,
        workspace_id: &str,
        prompt: &str,
    ) -> Result<TurnOutcome, SandboxError> {
        let options = InvokeOptions::default();
        let mut recovered = None;

        let agent = match self
            .sandboxes
            .invoke_agent(session_id, workspace_id, prompt, &options)
            .await
        {
            Ok(agent) => agent,
            Err(e) if e.is_recovery_trigger() => {
                warn!(session_id, "sandbox lost mid-session, attempting recovery: {}", e);
                let result = self.recovery.recover_session(session_id, workspace_id).await;
                if !result.succeeded() || self.sandboxes.handle(session_id).await.is_err() {
                    return Err(e);
                }
                recovered = Some(result);
                self.sandboxes
                    .invoke_agent(session_id, workspace_id, prompt, &options)
                    .await?
            }
            Err(e) => return Err(e),
        };

        let workflow = self
            .apply_agent_progress(session_id, workspace_id, &agent)
            .await
            .map_err(|e| SandboxError::Other(anyhow::Error::from(e)))?;

        Ok(TurnOutcome {
            agent,
            workflow,
            recovered,
        })
    }

    /// Pass the quality gate and advance to the next phase, reseeding the
    /// sandbox with the new phase's context.
    pub async fn advance_phase(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        self.workflow.pass_quality_gate(session_id, workspace_id).await?;
        let state = self
            .workflow
            .advance_to_next_phase(session_id, workspace_id)
            .await?;

        if let Ok(handle) = self.sandboxes.handle(session_id).await {
            let requirements = self
                .sandboxes
                .backend()
                .read_file(&handle, REQUIREMENTS_PATH)
                .await
                .unwrap_or_default();
            let sid = session_id.to_string();
            let wid = workspace_id.to_string();
            let name = self
                .store
                .call(move |db| db.get_session(&sid, &wid))
                .await
                .ok()
                .flatten()
                .map(|s| s.name)
                .unwrap_or_default();
            let seed = self.seed_for_phase(state.current_phase, &name, &requirements);
            if let Err(e) = self.sandboxes.reseed_context(session_id, &seed).await {
                warn!(session_id, "context reseed after advance failed: {}", e);
            }
        }
        Ok(state)
    }

    /// Final sync (when a repository is linked), a parting snapshot, sandbox
    /// teardown, and status update. Best-effort throughout: teardown proceeds
    /// even when the sync or snapshot fails.
    pub async fn close_session(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<CloseReport> {
        let mut report = CloseReport {
            final_commit: None,
            snapshot_id: None,
            sandbox_terminated: false,
            warnings: Vec::new(),
        };

        if let Some(sync) = &self.sync {
            match sync.repository_link(session_id, workspace_id).await {
                Ok(Some(_)) => {
                    match sync
                        .sync_to_github(
                            session_id,
                            workspace_id,
                            "Final sync on session close",
                            &PushOptions::default(),
                        )
                        .await
                    {
                        Ok(push) => report.final_commit = push.commit_sha,
                        Err(e) => report.warnings.push(format!("final sync failed: {}", e)),
                    }
                }
                Ok(None) => {}
                Err(e) => report.warnings.push(format!("link lookup failed: {}", e)),
            }
        }

        match self.snapshot_before_close(session_id, workspace_id).await {
            Ok(id) => report.snapshot_id = Some(id),
            Err(e) => report.warnings.push(format!("closing snapshot failed: {:#}", e)),
        }

        report.sandbox_terminated = self.sandboxes.terminate(session_id, workspace_id).await;

        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let completed = self
            .store
            .call(move |db| db.get_workflow_state(&sid, &wid))
            .await
            .ok()
            .flatten()
            .map(|state| state.phases.iter().all(|p| p.gate_passed))
            .unwrap_or(false);
        let status = if completed {
            SessionStatus::Completed
        } else {
            SessionStatus::Paused
        };
        // Conditional on the session still being active: a session someone
        // else already closed keeps the status they gave it.
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        match self
            .store
            .call(move |db| db.update_session_status(&sid, &wid, &SessionStatus::Active, &status))
            .await
        {
            Ok(true) => {}
            Ok(false) => report
                .warnings
                .push("session was not active; status left unchanged".to_string()),
            Err(e) => report.warnings.push(format!("status update failed: {:#}", e)),
        }

        info!(session_id, terminated = report.sandbox_terminated, "session closed");
        Ok(report)
    }

    /// Startup reconciliation of the in-process registry against the store.
    pub async fn reconcile(&self, workspace_id: &str) -> Result<()> {
        self.sandboxes.reconcile(workspace_id).await
    }

    // ── internals ─────────────────────────────────────────────────────

    async fn apply_agent_progress(
        &self,
        session_id: &str,
        workspace_id: &str,
        agent: &AgentResult,
    ) -> Result<WorkflowState, WorkflowError> {
        if let Some((progress, artifacts)) = extract_progress(&agent.message) {
            return self
                .workflow
                .update_phase_progress(session_id, workspace_id, progress, artifacts)
                .await;
        }
        self.workflow.get_state(session_id, workspace_id).await
    }

    async fn snapshot_before_close(&self, session_id: &str, workspace_id: &str) -> Result<String> {
        let handle = self
            .sandboxes
            .handle(session_id)
            .await
            .context("no sandbox to snapshot from")?;
        let backend = self.sandboxes.backend();
        let chat_history = match backend.read_file(&handle, ".atelier/chat_history.json").await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or(Value::Array(vec![])),
            Err(_) => Value::Array(vec![]),
        };
        let requirements = backend
            .read_file(&handle, REQUIREMENTS_PATH)
            .await
            .unwrap_or_default();
        let snapshot = self
            .recovery
            .create_session_snapshot(session_id, workspace_id, chat_history, &requirements)
            .await?;
        Ok(snapshot.id)
    }

    fn seed_for_phase(&self, phase_number: u32, session_name: &str, requirements: &str) -> SeedContext {
        let specs = self.workflow.phase_specs();
        let phase = get_phase(specs, phase_number)
            .cloned()
            .unwrap_or_else(|| specs[0].clone());
        SeedContext {
            role_notes: phase.briefing(),
            phase,
            session_name: session_name.to_string(),
            requirements: requirements.to_string(),
        }
    }
}

/// Structured progress in the agent's terminal message: a JSON object with
/// optional `progress` and `artifacts` keys. Anything else is treated as
/// plain conversation with no workflow effect.
fn extract_progress(message: &str) -> Option<(Value, HashMap<String, Value>)> {
    let value: Value = serde_json::from_str(message.trim()).ok()?;
    let obj = value.as_object()?;
    let progress = obj.get("progress")?.clone();
    if !progress.is_object() {
        return None;
    }
    let artifacts = obj
        .get("artifacts")
        .and_then(|v| v.as_object())
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    Some((progress, artifacts))
}
