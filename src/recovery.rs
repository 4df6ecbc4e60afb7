//! Session recovery: snapshots and best-effort restoration.
//!
//! `recover_session` is the one entry point that must not raise. Every step
//! is attempted independently; failures accumulate into the returned
//! `RecoveryResult` and the append-only recovery log. Partial recovery is a
//! valid outcome — a session with a restored workflow but no live sandbox is
//! still usable, it just needs a fresh provision on the next turn.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::models::{RecoveryLog, SessionStatus, Snapshot, WorkflowState};
use crate::phase::{PhaseSpec, default_phases, get_phase};
use crate::sandbox::SandboxManager;
use crate::sandbox::manager::SeedContext;
use crate::store::{DbHandle, RecoveryStats};

const CHAT_HISTORY_PATH: &str = ".atelier/chat_history.json";

/// Outcome of one `recover_session` call. Inspect the flags, not a Result:
/// recovery reports what it managed to bring back instead of raising.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub session_id: String,
    pub session_restored: bool,
    pub sandbox_reconnected: bool,
    pub workflow_restored: bool,
    pub context_restored: bool,
    /// Set when a replacement sandbox was provisioned.
    pub new_sandbox_id: Option<String>,
    /// The snapshot state was restored from, when one was used.
    pub restored_from: Option<Snapshot>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl RecoveryResult {
    fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            session_restored: false,
            sandbox_reconnected: false,
            workflow_restored: false,
            context_restored: false,
            new_sandbox_id: None,
            restored_from: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.session_restored && self.workflow_restored
    }
}

pub struct RecoveryManager {
    store: DbHandle,
    sandboxes: Arc<SandboxManager>,
    config: OrchestratorConfig,
    phases: Vec<PhaseSpec>,
}

impl RecoveryManager {
    pub fn new(store: DbHandle, sandboxes: Arc<SandboxManager>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            sandboxes,
            config,
            phases: default_phases(),
        }
    }

    /// Capture the session's current state as an immutable snapshot.
    /// All-or-nothing: any failure leaves no snapshot row behind.
    pub async fn create_session_snapshot(
        &self,
        session_id: &str,
        workspace_id: &str,
        chat_history: Value,
        requirements: &str,
    ) -> Result<Snapshot> {
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let state = self
            .store
            .call(move |db| db.get_workflow_state(&sid, &wid))
            .await?
            .with_context(|| format!("no workflow state for session {}", session_id))?;

        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            chat_history,
            requirements: requirements.to_string(),
            artifacts: state.artifacts.clone(),
            workflow_state: state,
            created_at: Utc::now(),
        };

        let stored = snapshot.clone();
        self.store.call(move |db| db.insert_snapshot(&stored)).await?;
        info!(session_id, snapshot_id = %snapshot.id, "snapshot created");
        Ok(snapshot)
    }

    /// Bring a session back after a process restart or sandbox loss.
    ///
    /// Steps, each best-effort: load the session row, probe the existing
    /// sandbox, fall back to the latest snapshot for re-provisioning within
    /// the recovery window, restore workflow state, then log the attempt.
    pub async fn recover_session(&self, session_id: &str, workspace_id: &str) -> RecoveryResult {
        let started = Instant::now();
        let mut result = RecoveryResult::empty(session_id);

        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let session = match self.store.call(move |db| db.get_session(&sid, &wid)).await {
            Ok(Some(session)) => {
                result.session_restored = true;
                Some(session)
            }
            Ok(None) => {
                result
                    .errors
                    .push(format!("session {} not found in workspace", session_id));
                None
            }
            Err(e) => {
                result.errors.push(format!("session lookup failed: {:#}", e));
                None
            }
        };

        if let Some(session) = &session {
            // Step 1: is the old sandbox still alive?
            if self.sandboxes.reconnect(session_id).await.is_some() {
                result.sandbox_reconnected = true;
                result.context_restored = true;
            }

            // Step 2: workflow state.
            let sid = session_id.to_string();
            let wid = workspace_id.to_string();
            let workflow = match self.store.call(move |db| db.get_workflow_state(&sid, &wid)).await
            {
                Ok(state) => state,
                Err(e) => {
                    result.errors.push(format!("workflow lookup failed: {:#}", e));
                    None
                }
            };
            result.workflow_restored = workflow.is_some();
            if workflow.is_none() {
                result
                    .warnings
                    .push("no workflow state persisted for session".to_string());
            }

            // Step 3: no live sandbox — try to rebuild one from a snapshot.
            if !result.sandbox_reconnected {
                let age = Utc::now() - session.last_activity_at;
                if age > chrono::Duration::days(self.config.recovery_window_days) {
                    result.warnings.push(format!(
                        "last activity {} days ago exceeds the {}-day recovery window; not re-provisioning",
                        age.num_days(),
                        self.config.recovery_window_days
                    ));
                } else {
                    self.reprovision_from_snapshot(session_id, workspace_id, &session.name, &mut result)
                        .await;
                }
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        self.finish_attempt(session_id, workspace_id, &mut result).await;
        info!(
            session_id,
            session = result.session_restored,
            sandbox = result.sandbox_reconnected,
            workflow = result.workflow_restored,
            context = result.context_restored,
            errors = result.errors.len(),
            "recovery attempt finished"
        );
        result
    }

    async fn reprovision_from_snapshot(
        &self,
        session_id: &str,
        workspace_id: &str,
        session_name: &str,
        result: &mut RecoveryResult,
    ) {
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let snapshot = match self.store.call(move |db| db.latest_snapshot(&sid, &wid)).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                result
                    .errors
                    .push("sandbox unreachable and no snapshot available".to_string());
                return;
            }
            Err(e) => {
                result.errors.push(format!("snapshot lookup failed: {:#}", e));
                return;
            }
        };

        // Drop the dead registry entry so provision builds a fresh sandbox.
        self.sandboxes.terminate(session_id, workspace_id).await;

        let seed = self.seed_for(&snapshot, session_name);
        match self.sandboxes.provision(session_id, workspace_id, &seed).await {
            Ok(handle) => {
                result.new_sandbox_id = Some(handle.id.clone());
                match self.write_chat_history(session_id, &snapshot).await {
                    Ok(()) => result.context_restored = true,
                    Err(e) => result
                        .warnings
                        .push(format!("chat history reseed failed: {:#}", e)),
                }
            }
            Err(e) => {
                result
                    .errors
                    .push(format!("replacement provisioning failed: {}", e));
            }
        }

        // Persisted workflow may have been lost with the process; the
        // snapshot's copy is authoritative when nothing newer exists.
        if !result.workflow_restored {
            let restored: WorkflowState = snapshot.workflow_state.clone();
            match self.store.call(move |db| db.restore_workflow_state(&restored)).await {
                Ok(()) => result.workflow_restored = true,
                Err(e) => result
                    .errors
                    .push(format!("workflow restore failed: {:#}", e)),
            }
        }
        result.restored_from = Some(snapshot);
    }

    async fn write_chat_history(&self, session_id: &str, snapshot: &Snapshot) -> Result<()> {
        let handle = self.sandboxes.handle(session_id).await?;
        let history = serde_json::to_string_pretty(&snapshot.chat_history)?;
        self.sandboxes
            .backend()
            .write_file(&handle, CHAT_HISTORY_PATH, &history)
            .await
    }

    async fn finish_attempt(
        &self,
        session_id: &str,
        workspace_id: &str,
        result: &mut RecoveryResult,
    ) {
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let attempt = match self
            .store
            .call(move |db| db.increment_recovery_count(&sid, &wid))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                if result.session_restored {
                    result
                        .warnings
                        .push(format!("recovery counter update failed: {:#}", e));
                }
                0
            }
        };

        if result.succeeded() {
            let sid = session_id.to_string();
            let wid = workspace_id.to_string();
            if let Err(e) = self
                .store
                .call(move |db| db.set_session_status(&sid, &wid, &SessionStatus::Active))
                .await
            {
                result
                    .warnings
                    .push(format!("session status reset failed: {:#}", e));
            }
        }

        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let flags = (
            result.session_restored,
            result.sandbox_reconnected,
            result.workflow_restored,
            result.context_restored,
        );
        let errors = result.errors.clone();
        let warnings = result.warnings.clone();
        let duration_ms = result.duration_ms;
        if let Err(e) = self
            .store
            .call(move |db| {
                db.append_recovery_log(&sid, &wid, attempt, flags, &errors, &warnings, duration_ms)
            })
            .await
        {
            warn!(session_id, "failed to append recovery log: {:#}", e);
        }
    }

    /// Restore workflow state from a specific snapshot, reseeding sandbox
    /// context when a sandbox is registered. Same contract as
    /// `recover_session`: failures accumulate in the result instead of
    /// raising.
    pub async fn restore_from_snapshot(
        &self,
        snapshot_id: &str,
        workspace_id: &str,
    ) -> RecoveryResult {
        let started = Instant::now();
        let mut result = RecoveryResult::empty("");

        let snap_id = snapshot_id.to_string();
        let wid = workspace_id.to_string();
        let snapshot = match self.store.call(move |db| db.get_snapshot(&snap_id, &wid)).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                result.errors.push(format!("snapshot {} not found", snapshot_id));
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
            Err(e) => {
                result.errors.push(format!("snapshot lookup failed: {:#}", e));
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };
        result.session_id = snapshot.session_id.clone();

        let sid = snapshot.session_id.clone();
        let wid = workspace_id.to_string();
        let session = match self.store.call(move |db| db.get_session(&sid, &wid)).await {
            Ok(session) => session,
            Err(e) => {
                result.errors.push(format!("session lookup failed: {:#}", e));
                None
            }
        };
        result.session_restored = session.is_some();
        if session.is_none() && result.errors.is_empty() {
            result.errors.push(format!(
                "session {} not found in workspace",
                snapshot.session_id
            ));
        }

        let restored = snapshot.workflow_state.clone();
        match self.store.call(move |db| db.restore_workflow_state(&restored)).await {
            Ok(()) => result.workflow_restored = true,
            Err(e) => result.errors.push(format!("workflow restore failed: {:#}", e)),
        }

        let session_name = session.map(|s| s.name).unwrap_or_default();
        let seed = self.seed_for(&snapshot, &session_name);
        match self.sandboxes.reseed_context(&snapshot.session_id, &seed).await {
            Ok(()) => {
                result.sandbox_reconnected = true;
                result.context_restored = true;
            }
            Err(e) => {
                result
                    .warnings
                    .push(format!("context reseed skipped after restore: {}", e));
            }
        }

        info!(session_id = %snapshot.session_id, snapshot_id, "restored from snapshot");
        result.restored_from = Some(snapshot);
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Active sessions with a bound sandbox and no recent activity. Query
    /// only; callers decide whether to schedule recovery.
    pub async fn sessions_needing_recovery(&self, workspace_id: &str) -> Result<Vec<String>> {
        let wid = workspace_id.to_string();
        let threshold = self.config.inactivity_threshold_secs as i64;
        let sessions = self
            .store
            .call(move |db| db.sessions_needing_recovery(&wid, threshold))
            .await?;
        Ok(sessions.into_iter().map(|s| s.id).collect())
    }

    pub async fn recovery_history(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<Vec<RecoveryLog>> {
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        self.store.call(move |db| db.recovery_history(&sid, &wid)).await
    }

    pub async fn recovery_stats(&self, workspace_id: &str) -> Result<RecoveryStats> {
        let wid = workspace_id.to_string();
        self.store.call(move |db| db.recovery_stats(&wid)).await
    }

    fn seed_for(&self, snapshot: &Snapshot, session_name: &str) -> SeedContext {
        let phase = get_phase(&self.phases, snapshot.workflow_state.current_phase)
            .cloned()
            .unwrap_or_else(|| self.phases[0].clone());
        SeedContext {
            role_notes: phase.briefing(),
            phase,
            session_name: session_name.to_string(),
            requirements: snapshot.requirements.clone(),
        }
    }
}
