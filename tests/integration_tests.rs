//! End-to-end scenarios through the public API, with the in-memory sandbox
//! backend and a scripted git host.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use atelier::config::OrchestratorConfig;
use atelier::errors::SyncError;
use atelier::models::SessionStatus;
use atelier::orchestrator::SessionOrchestrator;
use atelier::sandbox::testing::MockBackend;
use atelier::store::{DbHandle, StoreDb};
use atelier::sync::githost::{GitHost, PullRequest, RemoteRepo};
use atelier::sync::orchestrator::{ConflictResolution, PullOptions, PushOptions};
use atelier::workflow::ProjectMeta;

struct ScriptedHost;

#[async_trait]
impl GitHost for ScriptedHost {
    fn remote_url(&self, owner_repo: &str) -> String {
        format!("https://github.com/{}.git", owner_repo)
    }

    async fn create_repository(
        &self,
        name: &str,
        _description: &str,
        private: bool,
    ) -> Result<RemoteRepo, SyncError> {
        Ok(RemoteRepo {
            full_name: format!("builder/{}", name),
            name: name.to_string(),
            private,
            html_url: format!("https://github.com/builder/{}", name),
            clone_url: format!("https://github.com/builder/{}.git", name),
            default_branch: "main".to_string(),
        })
    }

    async fn open_pull_request(
        &self,
        owner_repo: &str,
        title: &str,
        _head: &str,
        _base: &str,
        _body: &str,
    ) -> Result<PullRequest, SyncError> {
        Ok(PullRequest {
            number: 1,
            title: title.to_string(),
            html_url: format!("https://github.com/{}/pull/1", owner_repo),
        })
    }
}

fn meta() -> ProjectMeta {
    ProjectMeta {
        name: "todo-app".into(),
        description: "a todo application".into(),
        requirements: "CRUD todos with user accounts".into(),
    }
}

fn orchestrator_with(backend: Arc<MockBackend>) -> SessionOrchestrator {
    let store = DbHandle::new(StoreDb::new_in_memory().unwrap());
    let config = OrchestratorConfig::default();
    SessionOrchestrator::new(store, backend, config.clone())
        .with_git_host(Arc::new(ScriptedHost), config)
}

/// Progress payload satisfying each phase's quality-gate fields.
fn gate_progress(phase: u32) -> Value {
    match phase {
        1 => json!({"summary": "todo CRUD", "user_stories": ["add", "complete", "list"]}),
        2 => json!({"components": ["api", "web"], "tech_stack": ["fastify", "react"]}),
        3 => json!({"entities": ["user", "todo"], "relationships": ["user 1:n todo"]}),
        4 => json!({"features_implemented": ["crud"], "entry_points": ["src/server.ts"]}),
        5 => json!({"test_summary": "31 passing", "pass_rate": 1.0}),
        6 => json!({"deploy_notes": "fly.io, single region"}),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_full_phase_chain_runs_to_completion() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator_with(backend.clone());
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();

    for phase in 1..=6u32 {
        backend.script_exec_stdout(
            &json!({
                "type": "result",
                "result": json!({"message": "phase work done", "progress": gate_progress(phase)})
                    .to_string(),
                "is_error": false,
            })
            .to_string(),
        );
        let outcome = orchestrator
            .handle_turn(&session.id, "w1", "do the phase work")
            .await
            .unwrap();
        assert_eq!(outcome.workflow.current_phase, phase);
        orchestrator.advance_phase(&session.id, "w1").await.unwrap();
    }

    let state = orchestrator
        .workflow()
        .get_state(&session.id, "w1")
        .await
        .unwrap();
    assert_eq!(state.current_phase, 6);
    assert!(state.phases.iter().all(|p| p.gate_passed));

    let sid = session.id.clone();
    let stored = orchestrator
        .store()
        .call(move |db| db.get_session(&sid, "w1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_gate_blocks_advance_until_fields_present() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator_with(backend);
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();

    // Partial progress: one of two required fields.
    orchestrator
        .workflow()
        .update_phase_progress(
            &session.id,
            "w1",
            json!({"summary": "todo CRUD"}),
            HashMap::new(),
        )
        .await
        .unwrap();
    assert!(orchestrator.advance_phase(&session.id, "w1").await.is_err());

    orchestrator
        .workflow()
        .update_phase_progress(
            &session.id,
            "w1",
            json!({"user_stories": ["add"]}),
            HashMap::new(),
        )
        .await
        .unwrap();
    let state = orchestrator.advance_phase(&session.id, "w1").await.unwrap();
    assert_eq!(state.current_phase, 2);
}

#[tokio::test]
async fn test_sandbox_loss_recovered_transparently_mid_turn() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator_with(backend.clone());
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();

    orchestrator
        .recovery()
        .create_session_snapshot(&session.id, "w1", json!(["turn 1"]), "CRUD todos")
        .await
        .unwrap();
    let old = orchestrator.sandboxes().handle(&session.id).await.unwrap();
    backend.kill(&old.id);
    backend.script_exec_stdout(r#"{"type":"result","result":"recovered fine","is_error":false}"#);

    let outcome = orchestrator
        .handle_turn(&session.id, "w1", "keep going")
        .await
        .unwrap();
    assert_eq!(outcome.agent.message, "recovered fine");

    let recovery = outcome.recovered.unwrap();
    assert!(!recovery.sandbox_reconnected);
    assert!(recovery.context_restored);
    let new_id = recovery.new_sandbox_id.unwrap();
    assert_ne!(new_id, old.id);

    let sid = session.id.clone();
    let stored = orchestrator
        .store()
        .call(move |db| db.get_session(&sid, "w1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.recovery_count, 1);
    assert_eq!(stored.sandbox_id.as_deref(), Some(new_id.as_str()));
}

#[tokio::test]
async fn test_snapshot_restore_rolls_workflow_back() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator_with(backend);
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();

    orchestrator
        .workflow()
        .update_phase_progress(&session.id, "w1", gate_progress(1), HashMap::new())
        .await
        .unwrap();
    let snapshot = orchestrator
        .recovery()
        .create_session_snapshot(&session.id, "w1", json!([]), "CRUD todos")
        .await
        .unwrap();

    // Later work that the restore should discard.
    orchestrator.advance_phase(&session.id, "w1").await.unwrap();
    orchestrator
        .workflow()
        .update_phase_progress(&session.id, "w1", gate_progress(2), HashMap::new())
        .await
        .unwrap();

    let restore = orchestrator
        .recovery()
        .restore_from_snapshot(&snapshot.id, "w1")
        .await;
    assert!(restore.succeeded());

    let state = orchestrator
        .workflow()
        .get_state(&session.id, "w1")
        .await
        .unwrap();
    assert_eq!(state.current_phase, 1);
    assert_eq!(state.current().unwrap().progress["summary"], "todo CRUD");
}

#[tokio::test]
async fn test_close_session_is_idempotent() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator_with(backend);
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();

    let first = orchestrator.close_session(&session.id, "w1").await.unwrap();
    assert!(first.sandbox_terminated);
    assert!(first.snapshot_id.is_some());

    // Second close: sandbox already gone, still no error.
    let second = orchestrator.close_session(&session.id, "w1").await.unwrap();
    assert!(second.sandbox_terminated);
    assert!(second.snapshot_id.is_none());
    assert!(orchestrator.sandboxes().list_active().await.is_empty());
}

#[tokio::test]
async fn test_workspace_isolation() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator_with(backend);
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();

    let sid = session.id.clone();
    let cross = orchestrator
        .store()
        .call(move |db| db.get_session(&sid, "w2"))
        .await
        .unwrap();
    assert!(cross.is_none());

    let other = orchestrator
        .store()
        .call(|db| db.list_sessions("w2"))
        .await
        .unwrap();
    assert!(other.is_empty());

    // Workflow access is workspace-scoped too.
    assert!(
        orchestrator
            .workflow()
            .get_state(&session.id, "w2")
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_setup_push_pull_cycle() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator_with(backend.clone());
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();
    let sync = orchestrator.sync().unwrap();

    let setup = sync
        .orchestrate_full_setup(&session.id, "w1", "todo-app", "a todo application")
        .await
        .unwrap();
    assert!(setup.success);
    assert_eq!(setup.repository.unwrap().owner_repo, "builder/todo-app");

    // Push with changes.
    backend.on_command("status --porcelain", 0, " M src/app.ts\n", "");
    backend.on_command("rev-parse HEAD", 0, "c0ffee\n", "");
    let push = sync
        .sync_to_github(&session.id, "w1", "wire up api", &PushOptions::default())
        .await
        .unwrap();
    assert!(push.success);
    assert_eq!(push.files_changed, 1);
    assert_eq!(push.commit_sha.as_deref(), Some("c0ffee"));

    // Conflicted pull, resolved remote-wins.
    backend.on_command("merge origin/", 1, "", "CONFLICT in src/app.ts");
    backend.on_command("diff --name-only --diff-filter=U", 0, "src/app.ts\n", "");
    let pull = sync
        .sync_from_github(
            &session.id,
            "w1",
            &PullOptions {
                resolve_conflicts: Some(ConflictResolution::PreferRemote),
                backup_local: true,
                ..PullOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(pull.success);
    assert!(pull.conflicts.is_empty());
    assert_eq!(pull.files_changed, 1);

    // The backup snapshot landed before the pull touched the tree.
    let sid = session.id.clone();
    let snapshot = orchestrator
        .store()
        .call(move |db| db.latest_snapshot(&sid, "w1"))
        .await
        .unwrap();
    assert!(snapshot.is_some());

    // Both operations are in the sync ring, newest first.
    let sid = session.id.clone();
    let ops = orchestrator
        .store()
        .call(move |db| db.recent_sync_operations(&sid, "w1", 10))
        .await
        .unwrap();
    assert!(ops.len() >= 2);
    assert_eq!(ops[0].direction, atelier::models::SyncDirection::Pull);
    assert_eq!(ops[1].direction, atelier::models::SyncDirection::Push);
}

#[tokio::test]
async fn test_concurrent_turns_serialize_on_session_lock() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = Arc::new(orchestrator_with(backend.clone()));
    let session = orchestrator.create_session("w1", &meta()).await.unwrap();
    backend.script_exec_stdout(r#"{"type":"result","result":"ok","is_error":false}"#);

    let mut tasks = Vec::new();
    for i in 0..4 {
        let orchestrator = orchestrator.clone();
        let sid = session.id.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator
                .handle_turn(&sid, "w1", &format!("turn {}", i))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        let outcome = task.await.unwrap();
        assert_eq!(outcome.agent.message, "ok");
    }

    // One sandbox served all four turns.
    assert_eq!(backend.created_count(), 1);
    let agent_runs = backend
        .executed_commands()
        .iter()
        .filter(|(_, c)| c.contains("--output-format stream-json"))
        .count();
    assert_eq!(agent_runs, 4);
}
