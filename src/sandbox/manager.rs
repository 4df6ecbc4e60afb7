//! Sandbox lifecycle manager.
//!
//! Owns the in-process registry mapping session ids to live sandbox handles.
//! The registry is a cache over the persistent store and must tolerate being
//! wrong: `reconcile` rebuilds it from persisted session rows after process
//! restart. Invariants enforced here:
//!
//! - at most one live sandbox per session (a second concurrent provision
//!   waits on the per-session lock and receives the existing handle)
//! - operations touching a session's sandbox filesystem are serialized
//!   through that session's lock
//! - `terminate` is best-effort and idempotent; it never raises

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::errors::SandboxError;
use crate::models::SandboxStatus;
use crate::phase::PhaseSpec;
use crate::sandbox::agent::{AgentResult, agent_command, parse_agent_output};
use crate::sandbox::backend::{SandboxBackend, SandboxHandle};
use crate::store::DbHandle;

const PROMPT_PATH: &str = ".atelier/prompt.md";
const PHASE_DESCRIPTOR_PATH: &str = ".atelier/phase.json";
const SESSION_DESCRIPTOR_PATH: &str = ".atelier/session.json";
const REQUIREMENTS_PATH: &str = ".atelier/requirements.md";
const ROLE_CONTEXT_PATH: &str = ".atelier/role.md";

/// Context files seeded into a fresh or reseeded sandbox.
#[derive(Debug, Clone)]
pub struct SeedContext {
    pub phase: PhaseSpec,
    pub session_name: String,
    pub requirements: String,
    pub role_notes: String,
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub max_turns: Option<u32>,
    /// Extra context files written next to the prompt before invocation.
    pub context_files: Vec<(String, String)>,
}

struct Slot {
    handle: Option<SandboxHandle>,
    status: SandboxStatus,
    last_invocation: Option<DateTime<Utc>>,
    lock: Arc<Mutex<()>>,
}

pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    store: DbHandle,
    config: OrchestratorConfig,
    registry: Mutex<HashMap<String, Slot>>,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, store: DbHandle, config: OrchestratorConfig) -> Self {
        Self {
            backend,
            store,
            config,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Provision a sandbox for the session and seed its context files.
    ///
    /// If the session already has a reachable sandbox, its handle is returned
    /// unchanged — concurrent provision attempts converge on one sandbox.
    pub async fn provision(
        &self,
        session_id: &str,
        workspace_id: &str,
        seed: &SeedContext,
    ) -> Result<SandboxHandle, SandboxError> {
        let lock = self.slot_lock_or_insert(session_id).await;
        let _guard = lock.lock().await;

        // Re-check under the session lock: a concurrent provisioner may have
        // finished while we waited.
        if let Some(handle) = self.registered_handle(session_id).await {
            if self.backend.is_reachable(&handle).await {
                return Ok(handle);
            }
        }

        let handle = match self
            .backend
            .create(&self.config.sandbox_template, &self.config.sandbox_env)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                // Keep the slot: a sibling provisioner may be parked on its
                // lock, and dropping it here would fork the lock identity.
                self.set_status(session_id, SandboxStatus::Error).await;
                return Err(SandboxError::Provision {
                    session_id: session_id.to_string(),
                    reason: format!("{:#}", e),
                });
            }
        };

        if let Err(e) = self.seed_context(&handle, session_id, seed).await {
            let _ = self.backend.destroy(&handle).await;
            self.set_status(session_id, SandboxStatus::Error).await;
            return Err(SandboxError::Provision {
                session_id: session_id.to_string(),
                reason: format!("context seeding failed: {:#}", e),
            });
        }

        {
            // A concurrent terminate may have dropped the slot while we were
            // creating; re-insert under the same lock rather than assume it
            // survived.
            let mut registry = self.registry.lock().await;
            let slot = registry
                .entry(session_id.to_string())
                .or_insert_with(|| Slot {
                    handle: None,
                    status: SandboxStatus::Provisioning,
                    last_invocation: None,
                    lock: lock.clone(),
                });
            slot.handle = Some(handle.clone());
            slot.status = SandboxStatus::Ready;
            slot.last_invocation = Some(Utc::now());
        }

        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let sandbox_id = handle.id.clone();
        let workdir = handle.workdir.display().to_string();
        self.store
            .call(move |db| db.bind_sandbox(&sid, &wid, &sandbox_id, &workdir))
            .await
            .map_err(SandboxError::Other)?;

        info!(session_id, sandbox_id = %handle.id, "sandbox provisioned");
        Ok(handle)
    }

    /// Write the prompt plus referenced context files, execute the agent, and
    /// parse its structured output. Requires a registered, reachable sandbox.
    pub async fn invoke_agent(
        &self,
        session_id: &str,
        workspace_id: &str,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<AgentResult, SandboxError> {
        let (handle, lock) = self.handle_and_lock(session_id).await?;
        let _guard = lock.lock().await;
        self.set_status(session_id, SandboxStatus::Executing).await;

        let result = self
            .invoke_locked(&handle, session_id, prompt, options)
            .await;

        match &result {
            Ok(_) => {
                let mut registry = self.registry.lock().await;
                if let Some(slot) = registry.get_mut(session_id) {
                    slot.status = SandboxStatus::Ready;
                    slot.last_invocation = Some(Utc::now());
                }
                let sid = session_id.to_string();
                let wid = workspace_id.to_string();
                drop(registry);
                if let Err(e) = self.store.call(move |db| db.touch_session(&sid, &wid)).await {
                    warn!(session_id, "failed to touch session after invoke: {:#}", e);
                }
            }
            Err(_) => {
                self.set_status(session_id, SandboxStatus::Error).await;
            }
        }
        result
    }

    async fn invoke_locked(
        &self,
        handle: &SandboxHandle,
        session_id: &str,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<AgentResult, SandboxError> {
        for (path, content) in &options.context_files {
            self.backend
                .write_file(handle, path, content)
                .await
                .map_err(|e| SandboxError::Unreachable {
                    session_id: session_id.to_string(),
                    reason: format!("context write failed: {:#}", e),
                })?;
        }
        self.backend
            .write_file(handle, PROMPT_PATH, prompt)
            .await
            .map_err(|e| SandboxError::Unreachable {
                session_id: session_id.to_string(),
                reason: format!("prompt write failed: {:#}", e),
            })?;

        let max_turns = options.max_turns.unwrap_or(self.config.agent_max_turns);
        let command = agent_command(PROMPT_PATH, max_turns);
        let timeout = Duration::from_secs(self.config.agent_timeout_secs);

        let output = match tokio::time::timeout(timeout, self.backend.exec(handle, &command)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::Unreachable {
                    session_id: session_id.to_string(),
                    reason: format!("{:#}", e),
                });
            }
            Err(_) => {
                return Err(SandboxError::Unreachable {
                    session_id: session_id.to_string(),
                    reason: format!("agent invocation timed out after {}s", timeout.as_secs()),
                });
            }
        };

        parse_agent_output(&output.stdout)
    }

    /// Best-effort teardown. Returns false on backend error, never raises, and
    /// always removes the session from the registry.
    pub async fn terminate(&self, session_id: &str, workspace_id: &str) -> bool {
        let slot = {
            let mut registry = self.registry.lock().await;
            registry.remove(session_id)
        };

        let mut ok = true;
        if let Some(slot) = slot {
            // Hold the session lock so an in-flight invoke finishes (or fails
            // with Unreachable) before the sandbox goes away under it.
            let _guard = slot.lock.lock().await;
            if let Some(handle) = slot.handle {
                if let Err(e) = self.backend.destroy(&handle).await {
                    warn!(session_id, "sandbox destroy failed: {:#}", e);
                    ok = false;
                }
            }
        }

        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        if let Err(e) = self.store.call(move |db| db.clear_sandbox(&sid, &wid)).await {
            warn!(session_id, "failed to clear sandbox binding: {:#}", e);
            ok = false;
        }
        info!(session_id, ok, "sandbox terminated");
        ok
    }

    /// Session ids with a registered sandbox, for reconciliation.
    pub async fn list_active(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .filter(|(_, slot)| slot.handle.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Sessions whose sandbox has had no invocation within the idle window.
    /// Surfaced as data only; nothing here tears idle sandboxes down.
    pub async fn idle_sessions(&self) -> Vec<String> {
        let window = chrono::Duration::seconds(self.config.idle_window_secs as i64);
        let cutoff = Utc::now() - window;
        let registry = self.registry.lock().await;
        registry
            .iter()
            .filter(|(_, slot)| {
                slot.handle.is_some()
                    && slot.last_invocation.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Probe the registered sandbox for a session. Used by recovery step 1.
    pub async fn reconnect(&self, session_id: &str) -> Option<SandboxHandle> {
        let handle = self.registered_handle(session_id).await?;
        if self.backend.is_reachable(&handle).await {
            self.set_status(session_id, SandboxStatus::Ready).await;
            Some(handle)
        } else {
            None
        }
    }

    /// Reseed context files into an existing sandbox (phase change, restore).
    pub async fn reseed_context(
        &self,
        session_id: &str,
        seed: &SeedContext,
    ) -> Result<(), SandboxError> {
        let (handle, lock) = self.handle_and_lock(session_id).await?;
        let _guard = lock.lock().await;
        self.seed_context(&handle, session_id, seed)
            .await
            .map_err(|e| SandboxError::Unreachable {
                session_id: session_id.to_string(),
                reason: format!("reseed failed: {:#}", e),
            })
    }

    /// Rebuild the registry from persisted session rows. Registry entries
    /// whose session no longer has a bound sandbox are dropped; persisted
    /// bindings whose sandbox is unreachable are cleared in the store.
    pub async fn reconcile(&self, workspace_id: &str) -> anyhow::Result<()> {
        let wid = workspace_id.to_string();
        let sessions = self.store.call(move |db| db.list_sessions(&wid)).await?;

        for session in &sessions {
            let (Some(sandbox_id), Some(workdir)) = (&session.sandbox_id, &session.workdir) else {
                continue;
            };
            if self.registered_handle(&session.id).await.is_some() {
                continue;
            }
            let handle = SandboxHandle {
                id: sandbox_id.clone(),
                addr: workdir.clone(),
                workdir: workdir.into(),
            };
            if self.backend.is_reachable(&handle).await {
                let mut registry = self.registry.lock().await;
                registry.insert(
                    session.id.clone(),
                    Slot {
                        handle: Some(handle),
                        status: SandboxStatus::Ready,
                        last_invocation: Some(session.last_activity_at),
                        lock: Arc::new(Mutex::new(())),
                    },
                );
                info!(session_id = %session.id, sandbox_id = %sandbox_id, "registry entry rebuilt");
            } else {
                let sid = session.id.clone();
                let wid = workspace_id.to_string();
                self.store.call(move |db| db.clear_sandbox(&sid, &wid)).await?;
                warn!(session_id = %session.id, "stale sandbox binding cleared");
            }
        }

        // Drop registry entries with no matching persisted binding.
        let persisted: std::collections::HashSet<String> = sessions
            .iter()
            .filter(|s| s.sandbox_id.is_some())
            .map(|s| s.id.clone())
            .collect();
        let mut registry = self.registry.lock().await;
        registry.retain(|session_id, _| persisted.contains(session_id));
        Ok(())
    }

    /// The per-session lock, shared with the sync orchestrator so sandbox
    /// invocation and git sync serialize against each other.
    pub async fn session_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>, SandboxError> {
        let registry = self.registry.lock().await;
        registry
            .get(session_id)
            .map(|slot| slot.lock.clone())
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))
    }

    /// The registered handle for a session, if any.
    pub async fn handle(&self, session_id: &str) -> Result<SandboxHandle, SandboxError> {
        self.registered_handle(session_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))
    }

    pub fn backend(&self) -> Arc<dyn SandboxBackend> {
        self.backend.clone()
    }

    // ── internals ─────────────────────────────────────────────────────

    async fn seed_context(
        &self,
        handle: &SandboxHandle,
        session_id: &str,
        seed: &SeedContext,
    ) -> anyhow::Result<()> {
        let phase_json = serde_json::to_string_pretty(&seed.phase)?;
        let session_json = serde_json::to_string_pretty(&json!({
            "session_id": session_id,
            "name": seed.session_name,
            "phase": seed.phase.number,
            "role": seed.phase.role,
        }))?;
        self.backend.write_file(handle, PHASE_DESCRIPTOR_PATH, &phase_json).await?;
        self.backend
            .write_file(handle, SESSION_DESCRIPTOR_PATH, &session_json)
            .await?;
        self.backend
            .write_file(handle, REQUIREMENTS_PATH, &seed.requirements)
            .await?;
        self.backend
            .write_file(handle, ROLE_CONTEXT_PATH, &seed.role_notes)
            .await?;
        Ok(())
    }

    async fn slot_lock_or_insert(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut registry = self.registry.lock().await;
        registry
            .entry(session_id.to_string())
            .or_insert_with(|| Slot {
                handle: None,
                status: SandboxStatus::Provisioning,
                last_invocation: None,
                lock: Arc::new(Mutex::new(())),
            })
            .lock
            .clone()
    }

    async fn registered_handle(&self, session_id: &str) -> Option<SandboxHandle> {
        let registry = self.registry.lock().await;
        registry.get(session_id).and_then(|slot| slot.handle.clone())
    }

    async fn handle_and_lock(
        &self,
        session_id: &str,
    ) -> Result<(SandboxHandle, Arc<Mutex<()>>), SandboxError> {
        let registry = self.registry.lock().await;
        let slot = registry
            .get(session_id)
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;
        let handle = slot
            .handle
            .clone()
            .ok_or_else(|| SandboxError::NotFound(session_id.to_string()))?;
        Ok((handle, slot.lock.clone()))
    }

    async fn set_status(&self, session_id: &str, status: SandboxStatus) {
        let mut registry = self.registry.lock().await;
        if let Some(slot) = registry.get_mut(session_id) {
            slot.status = status;
        }
    }

    #[cfg(test)]
    pub(crate) async fn status_of(&self, session_id: &str) -> Option<SandboxStatus> {
        let registry = self.registry.lock().await;
        registry.get(session_id).map(|slot| slot.status)
    }

    #[cfg(test)]
    pub(crate) async fn backdate_last_invocation(&self, session_id: &str, secs: i64) {
        let mut registry = self.registry.lock().await;
        if let Some(slot) = registry.get_mut(session_id) {
            slot.last_invocation = Some(Utc::now() - chrono::Duration::seconds(secs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::default_phases;
    use crate::sandbox::testing::MockBackend;
    use crate::store::{DbHandle, StoreDb};

    fn seed() -> SeedContext {
        SeedContext {
            phase: default_phases().remove(0),
            session_name: "todo-app".into(),
            requirements: "CRUD todos".into(),
            role_notes: "You are the requirements analyst.".into(),
        }
    }

    async fn setup(backend: Arc<MockBackend>) -> (Arc<SandboxManager>, DbHandle, String) {
        let store = DbHandle::new(StoreDb::new_in_memory().unwrap());
        let session = store
            .call(|db| db.create_session("w1", "todo-app"))
            .await
            .unwrap();
        let manager = Arc::new(SandboxManager::new(
            backend,
            store.clone(),
            OrchestratorConfig::default(),
        ));
        (manager, store, session.id)
    }

    #[tokio::test]
    async fn test_provision_registers_and_binds() {
        let backend = Arc::new(MockBackend::new());
        let (manager, store, sid) = setup(backend.clone()).await;

        let handle = manager.provision(&sid, "w1", &seed()).await.unwrap();
        assert_eq!(manager.list_active().await, vec![sid.clone()]);
        assert_eq!(
            manager.status_of(&sid).await,
            Some(SandboxStatus::Ready)
        );

        // Context files seeded.
        assert!(backend.file_content(&handle.id, ".atelier/requirements.md").is_some());
        assert!(backend.file_content(&handle.id, ".atelier/phase.json").is_some());

        let sid_owned = sid.clone();
        let session = store
            .call(move |db| db.get_session(&sid_owned, "w1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.sandbox_id.as_deref(), Some(handle.id.as_str()));
    }

    #[tokio::test]
    async fn test_second_provision_returns_existing_handle() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _store, sid) = setup(backend.clone()).await;

        let first = manager.provision(&sid, "w1", &seed()).await.unwrap();
        let second = manager.provision(&sid, "w1", &seed()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(backend.created_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_provisions_single_sandbox() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _store, sid) = setup(backend.clone()).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let sid = sid.clone();
            tasks.push(tokio::spawn(async move {
                manager.provision(&sid, "w1", &seed()).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "all provisions must converge on one sandbox");
        assert_eq!(backend.created_count(), 1);
    }

    #[tokio::test]
    async fn test_provision_failure_keeps_slot_for_retry() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_create("quota exceeded");
        let (manager, _store, sid) = setup(backend.clone()).await;

        let err = manager.provision(&sid, "w1", &seed()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Provision { .. }));
        assert!(manager.list_active().await.is_empty());
        assert_eq!(manager.status_of(&sid).await, Some(SandboxStatus::Error));

        // A later attempt is allowed and succeeds.
        manager.provision(&sid, "w1", &seed()).await.unwrap();
        assert_eq!(manager.status_of(&sid).await, Some(SandboxStatus::Ready));
    }

    #[tokio::test]
    async fn test_provision_failure_mid_race_still_yields_one_sandbox() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_create("quota exceeded");
        let (manager, _store, sid) = setup(backend.clone()).await;

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let sid = sid.clone();
            tasks.push(tokio::spawn(async move {
                manager.provision(&sid, "w1", &seed()).await
            }));
        }
        let mut ids = Vec::new();
        let mut failures = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(handle) => ids.push(handle.id),
                Err(_) => failures += 1,
            }
        }

        // The failed provisioner must not have forked the session lock: the
        // survivors all converge on one sandbox, however the race interleaved.
        assert_eq!(failures, 1);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1, "survivors must share one sandbox");
        assert_eq!(backend.created_count(), 1);
    }

    #[tokio::test]
    async fn test_invoke_agent_parses_stream_output() {
        let backend = Arc::new(MockBackend::new());
        backend.script_exec_stdout(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"src/app.ts"},"id":"1"}]}}
{"type":"result","result":"App scaffolded","is_error":false}"#,
        );
        let (manager, _store, sid) = setup(backend.clone()).await;
        manager.provision(&sid, "w1", &seed()).await.unwrap();

        let result = manager
            .invoke_agent(&sid, "w1", "scaffold the app", &InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(result.message, "App scaffolded");
        assert_eq!(result.file_mutations.len(), 1);
        assert_eq!(manager.status_of(&sid).await, Some(SandboxStatus::Ready));

        // Prompt landed in the sandbox.
        let handle = manager.handle(&sid).await.unwrap();
        assert_eq!(
            backend.file_content(&handle.id, ".atelier/prompt.md").as_deref(),
            Some("scaffold the app")
        );
    }

    #[tokio::test]
    async fn test_invoke_without_sandbox_is_not_found() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _store, sid) = setup(backend).await;
        let err = manager
            .invoke_agent(&sid, "w1", "hello", &InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_invoke_on_dead_sandbox_is_unreachable() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _store, sid) = setup(backend.clone()).await;
        let handle = manager.provision(&sid, "w1", &seed()).await.unwrap();
        backend.kill(&handle.id);

        let err = manager
            .invoke_agent(&sid, "w1", "hello", &InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_recovery_trigger());
        assert_eq!(manager.status_of(&sid).await, Some(SandboxStatus::Error));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_clears_registry() {
        let backend = Arc::new(MockBackend::new());
        let (manager, store, sid) = setup(backend.clone()).await;
        manager.provision(&sid, "w1", &seed()).await.unwrap();

        assert!(manager.terminate(&sid, "w1").await);
        assert!(manager.list_active().await.is_empty());
        // Second call: still no raise, registry still clear.
        assert!(manager.terminate(&sid, "w1").await);

        let sid_owned = sid.clone();
        let session = store
            .call(move |db| db.get_session(&sid_owned, "w1"))
            .await
            .unwrap()
            .unwrap();
        assert!(session.sandbox_id.is_none());
    }

    #[tokio::test]
    async fn test_terminate_returns_false_on_backend_error() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _store, sid) = setup(backend.clone()).await;
        manager.provision(&sid, "w1", &seed()).await.unwrap();
        backend.fail_destroy(true);

        assert!(!manager.terminate(&sid, "w1").await);
        // Registry entry is gone regardless.
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_idle_sessions_surfaced_not_torn_down() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _store, sid) = setup(backend).await;
        manager.provision(&sid, "w1", &seed()).await.unwrap();

        assert!(manager.idle_sessions().await.is_empty());
        manager.backdate_last_invocation(&sid, 3600).await;
        assert_eq!(manager.idle_sessions().await, vec![sid.clone()]);
        // Still registered: idle detection is data, not action.
        assert_eq!(manager.list_active().await, vec![sid]);
    }

    #[tokio::test]
    async fn test_reconnect_reachable_and_dead() {
        let backend = Arc::new(MockBackend::new());
        let (manager, _store, sid) = setup(backend.clone()).await;
        let handle = manager.provision(&sid, "w1", &seed()).await.unwrap();

        assert!(manager.reconnect(&sid).await.is_some());
        backend.kill(&handle.id);
        assert!(manager.reconnect(&sid).await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_rebuilds_registry_from_store() {
        let backend = Arc::new(MockBackend::new());
        let (manager, store, sid) = setup(backend.clone()).await;
        let handle = manager.provision(&sid, "w1", &seed()).await.unwrap();

        // Simulate a process restart with a fresh manager over the same store.
        let fresh = SandboxManager::new(backend.clone(), store.clone(), OrchestratorConfig::default());
        assert!(fresh.list_active().await.is_empty());
        fresh.reconcile("w1").await.unwrap();
        assert_eq!(fresh.list_active().await, vec![sid.clone()]);
        assert_eq!(fresh.handle(&sid).await.unwrap().id, handle.id);
    }

    #[tokio::test]
    async fn test_reconcile_clears_stale_store_binding() {
        let backend = Arc::new(MockBackend::new());
        let (manager, store, sid) = setup(backend.clone()).await;
        let handle = manager.provision(&sid, "w1", &seed()).await.unwrap();
        backend.kill(&handle.id);

        let fresh = SandboxManager::new(backend, store.clone(), OrchestratorConfig::default());
        fresh.reconcile("w1").await.unwrap();
        assert!(fresh.list_active().await.is_empty());

        let sid_owned = sid.clone();
        let session = store
            .call(move |db| db.get_session(&sid_owned, "w1"))
            .await
            .unwrap()
            .unwrap();
        assert!(session.sandbox_id.is_none());
    }
}
