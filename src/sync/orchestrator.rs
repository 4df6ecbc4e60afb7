//! Bidirectional sync between a session's sandbox and its GitHub repository.
//!
//! Every operation takes the session's lock from the sandbox manager, so
//! agent invocations and git operations on the same working tree serialize.
//! Sync *conflicts* are reported as data in the returned reports; only
//! failures that abort an operation surface as `SyncError`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::errors::{SandboxError, SyncError};
use crate::models::{RepositoryLink, SyncDirection, SyncOutcome};
use crate::recovery::RecoveryManager;
use crate::sandbox::SandboxManager;
use crate::sandbox::backend::{ExecOutput, SandboxHandle};
use crate::store::DbHandle;
use crate::sync::githost::{GitHost, parse_owner_repo_from_url};

const CHAT_HISTORY_PATH: &str = ".atelier/chat_history.json";
const REQUIREMENTS_PATH: &str = ".atelier/requirements.md";

const DEFAULT_GITIGNORE: &str = "node_modules/\ntarget/\ndist/\n.env\n.atelier/\n";

/// One step of repository setup. Required steps gate overall success;
/// optional steps downgrade to warnings.
#[derive(Debug, Clone)]
pub struct SetupStep {
    pub name: &'static str,
    pub required: bool,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct SetupReport {
    pub success: bool,
    pub steps: Vec<SetupStep>,
    pub repository: Option<RepositoryLink>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Branch to push to; defaults to the repository's default branch.
    pub target_branch: Option<String>,
    /// Open a pull request into the default branch after pushing. Only
    /// meaningful when `target_branch` is not the default branch.
    pub create_pull_request: bool,
    /// Glob patterns limiting which changed paths are committed. Empty means
    /// everything.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PushReport {
    pub success: bool,
    pub commit_sha: Option<String>,
    pub files_changed: usize,
    pub pull_request_url: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    #[default]
    Merge,
    Rebase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    PreferRemote,
    PreferLocal,
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub strategy: MergeStrategy,
    /// When set, conflicts are auto-resolved in the given direction.
    /// Otherwise a conflicted pull is aborted and reported.
    pub resolve_conflicts: Option<ConflictResolution>,
    /// Snapshot the session before touching the working tree.
    pub backup_local: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PullReport {
    pub success: bool,
    pub files_changed: usize,
    pub conflicts: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct SyncOrchestrator {
    store: DbHandle,
    sandboxes: Arc<SandboxManager>,
    recovery: Arc<RecoveryManager>,
    host: Arc<dyn GitHost>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        store: DbHandle,
        sandboxes: Arc<SandboxManager>,
        recovery: Arc<RecoveryManager>,
        host: Arc<dyn GitHost>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            sandboxes,
            recovery,
            host,
            config,
        }
    }

    /// Create the remote repository, configure git inside the sandbox, and
    /// push the initial commit. Required steps abort the sequence on failure;
    /// optional steps only warn.
    pub async fn orchestrate_full_setup(
        &self,
        session_id: &str,
        workspace_id: &str,
        repo_name: &str,
        description: &str,
    ) -> Result<SetupReport, SyncError> {
        let lock = self.sandboxes.session_lock(session_id).await?;
        let _guard = lock.lock().await;
        let handle = self.sandboxes.handle(session_id).await?;

        let mut report = SetupReport::default();

        // Step 1 (required): remote repository.
        let repo = match self.host.create_repository(repo_name, description, true).await {
            Ok(repo) => {
                report.steps.push(SetupStep {
                    name: "create_repository",
                    required: true,
                    ok: true,
                    detail: repo.full_name.clone(),
                });
                repo
            }
            Err(e) => {
                report.steps.push(SetupStep {
                    name: "create_repository",
                    required: true,
                    ok: false,
                    detail: e.to_string(),
                });
                report.errors.push(format!("repository creation failed: {}", e));
                return Ok(report);
            }
        };

        // Step 2 (required): git identity and remote inside the sandbox.
        let remote = self.host.remote_url(&repo.full_name);
        let configure = async {
            // The remote must round-trip to the repo slug; anything else
            // would push the working tree somewhere we did not create.
            if parse_owner_repo_from_url(&remote).as_deref() != Some(repo.full_name.as_str()) {
                return Err(SyncError::Host(format!(
                    "remote URL for {} does not address that repository",
                    repo.full_name
                )));
            }
            self.git_ok(&handle, session_id, "init -q", "git init").await?;
            self.git_ok(
                &handle,
                session_id,
                &format!("config user.name '{}'", self.config.git_user_name),
                "git config user.name",
            )
            .await?;
            self.git_ok(
                &handle,
                session_id,
                &format!("config user.email '{}'", self.config.git_user_email),
                "git config user.email",
            )
            .await?;
            // Remote may already exist from an earlier setup attempt.
            let _ = self.git(&handle, session_id, "remote remove origin").await;
            self.git_ok(
                &handle,
                session_id,
                &format!("remote add origin '{}'", remote),
                "git remote add",
            )
            .await?;
            Ok::<(), SyncError>(())
        }
        .await;
        match configure {
            Ok(()) => report.steps.push(SetupStep {
                name: "configure_git",
                required: true,
                ok: true,
                detail: String::new(),
            }),
            Err(e) => {
                report.steps.push(SetupStep {
                    name: "configure_git",
                    required: true,
                    ok: false,
                    detail: e.to_string(),
                });
                report.errors.push(format!("git configuration failed: {}", e));
                return Ok(report);
            }
        }

        // Step 3 (optional): seed a .gitignore when the project has none.
        let backend = self.sandboxes.backend();
        if backend.read_file(&handle, ".gitignore").await.is_err() {
            match backend.write_file(&handle, ".gitignore", DEFAULT_GITIGNORE).await {
                Ok(()) => report.steps.push(SetupStep {
                    name: "seed_gitignore",
                    required: false,
                    ok: true,
                    detail: String::new(),
                }),
                Err(e) => {
                    report.steps.push(SetupStep {
                        name: "seed_gitignore",
                        required: false,
                        ok: false,
                        detail: format!("{:#}", e),
                    });
                    report.warnings.push(format!(".gitignore seeding failed: {:#}", e));
                }
            }
        }

        // Step 4 (required): initial commit and push.
        let initial_push = async {
            self.git_ok(&handle, session_id, "add -A", "git add").await?;
            self.git_ok(
                &handle,
                session_id,
                "commit --allow-empty -m 'Initial commit'",
                "git commit",
            )
            .await?;
            self.git_ok(
                &handle,
                session_id,
                &format!("push -u origin HEAD:{}", repo.default_branch),
                "git push",
            )
            .await?;
            Ok::<(), SyncError>(())
        }
        .await;
        match initial_push {
            Ok(()) => report.steps.push(SetupStep {
                name: "initial_push",
                required: true,
                ok: true,
                detail: String::new(),
            }),
            Err(e) => {
                report.steps.push(SetupStep {
                    name: "initial_push",
                    required: true,
                    ok: false,
                    detail: e.to_string(),
                });
                report.errors.push(format!("initial push failed: {}", e));
                return Ok(report);
            }
        }

        // Persist the link; sync operations refuse to run without it.
        let link = RepositoryLink {
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            owner_repo: repo.full_name.clone(),
            default_branch: repo.default_branch.clone(),
            html_url: Some(repo.html_url.clone()),
            created_at: Utc::now(),
        };
        let stored = link.clone();
        self.store
            .call(move |db| db.upsert_repository_link(&stored))
            .await?;

        report.success = report.steps.iter().all(|s| !s.required || s.ok);
        report.repository = Some(link);
        info!(session_id, repo = %repo.full_name, "repository setup complete");
        Ok(report)
    }

    /// Commit local changes and push them to the linked repository.
    ///
    /// An empty diff is a success with zero files changed and no commit.
    pub async fn sync_to_github(
        &self,
        session_id: &str,
        workspace_id: &str,
        commit_message: &str,
        options: &PushOptions,
    ) -> Result<PushReport, SyncError> {
        let link = self.require_link(session_id, workspace_id).await?;
        let lock = self.sandboxes.session_lock(session_id).await?;
        let _guard = lock.lock().await;
        let handle = self.sandboxes.handle(session_id).await?;

        let status = self
            .git_ok(&handle, session_id, "status --porcelain", "git status")
            .await?;
        let files = changed_paths(&status.stdout, &options.include, &options.exclude);
        if files.is_empty() {
            return Ok(PushReport {
                success: true,
                ..PushReport::default()
            });
        }

        let branch = options
            .target_branch
            .clone()
            .unwrap_or_else(|| link.default_branch.clone());

        let push = async {
            let quoted: Vec<String> = files.iter().map(|f| quote(f)).collect();
            self.git_ok(
                &handle,
                session_id,
                &format!("add -- {}", quoted.join(" ")),
                "git add",
            )
            .await?;
            self.git_ok(
                &handle,
                session_id,
                &format!("commit -m {}", quote(commit_message)),
                "git commit",
            )
            .await?;
            self.git_ok(
                &handle,
                session_id,
                &format!("push origin HEAD:{}", branch),
                "git push",
            )
            .await?;
            let sha = self
                .git_ok(&handle, session_id, "rev-parse HEAD", "git rev-parse")
                .await?;
            Ok::<String, SyncError>(sha.stdout.trim().to_string())
        }
        .await;

        let commit_sha = match push {
            Ok(sha) => sha,
            Err(e) => {
                self.record(session_id, workspace_id, SyncDirection::Push, None, &[], SyncOutcome::Failed)
                    .await;
                return Err(e);
            }
        };

        let mut report = PushReport {
            success: true,
            commit_sha: Some(commit_sha.clone()),
            files_changed: files.len(),
            pull_request_url: None,
            warnings: Vec::new(),
        };

        if options.create_pull_request && branch != link.default_branch {
            match self
                .host
                .open_pull_request(&link.owner_repo, commit_message, &branch, &link.default_branch, "")
                .await
            {
                Ok(pr) => report.pull_request_url = Some(pr.html_url),
                Err(e) => {
                    // The push itself landed; a failed PR is not fatal.
                    report.warnings.push(format!("pull request creation failed: {}", e));
                }
            }
        }

        self.record(
            session_id,
            workspace_id,
            SyncDirection::Push,
            Some(&commit_sha),
            &[],
            SyncOutcome::Succeeded,
        )
        .await;
        info!(session_id, files = report.files_changed, sha = %commit_sha, "pushed to remote");
        Ok(report)
    }

    /// Pull remote changes into the sandbox working tree.
    ///
    /// Conflicts are data: with no resolution configured the operation aborts
    /// cleanly and reports the conflicted paths with `success: false`.
    pub async fn sync_from_github(
        &self,
        session_id: &str,
        workspace_id: &str,
        options: &PullOptions,
    ) -> Result<PullReport, SyncError> {
        let link = self.require_link(session_id, workspace_id).await?;
        let lock = self.sandboxes.session_lock(session_id).await?;
        let _guard = lock.lock().await;
        let handle = self.sandboxes.handle(session_id).await?;

        let mut report = PullReport::default();

        if options.backup_local {
            self.backup_session(&handle, session_id, workspace_id).await?;
        }

        self.git_ok(&handle, session_id, "fetch origin", "git fetch").await?;

        let (integrate, abort) = match options.strategy {
            MergeStrategy::Merge => (
                format!("merge origin/{}", link.default_branch),
                "merge --abort",
            ),
            MergeStrategy::Rebase => (
                format!("rebase origin/{}", link.default_branch),
                "rebase --abort",
            ),
        };

        let merged = self.git(&handle, session_id, &integrate).await?;
        if merged.success() {
            report.success = true;
            report.files_changed = self.count_pulled_files(&handle, session_id).await;
            self.record(session_id, workspace_id, SyncDirection::Pull, None, &[], SyncOutcome::Succeeded)
                .await;
            return Ok(report);
        }

        let conflicted = self
            .git_ok(
                &handle,
                session_id,
                "diff --name-only --diff-filter=U",
                "git diff",
            )
            .await?;
        report.conflicts = conflicted
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if report.conflicts.is_empty() {
            // Integration failed for some other reason (diverged history,
            // detached head). Abort and surface it.
            let _ = self.git(&handle, session_id, abort).await;
            self.record(session_id, workspace_id, SyncDirection::Pull, None, &[], SyncOutcome::Failed)
                .await;
            return Err(SyncError::Git(format!(
                "integration failed: {}",
                merged.stderr.trim()
            )));
        }

        let conflicts = report.conflicts.clone();
        match options.resolve_conflicts {
            Some(resolution) => {
                self.auto_resolve(&handle, session_id, &conflicts, resolution, options.strategy)
                    .await?;
                report.success = true;
                report.files_changed = conflicts.len();
                // Resolved is resolved: callers see a clean pull, the ring
                // keeps the conflicted paths.
                report.conflicts.clear();
            }
            None => {
                let _ = self.git(&handle, session_id, abort).await;
                warn!(
                    session_id,
                    conflicts = conflicts.len(),
                    "pull aborted on conflicts"
                );
            }
        }

        self.record(
            session_id,
            workspace_id,
            SyncDirection::Pull,
            None,
            &conflicts,
            SyncOutcome::Conflicted,
        )
        .await;
        Ok(report)
    }

    pub async fn repository_link(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<Option<RepositoryLink>, SyncError> {
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        Ok(self
            .store
            .call(move |db| db.get_repository_link(&sid, &wid))
            .await?)
    }

    // ── internals ─────────────────────────────────────────────────────

    async fn require_link(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<RepositoryLink, SyncError> {
        self.repository_link(session_id, workspace_id)
            .await?
            .ok_or_else(|| SyncError::NoRepositoryLink(session_id.to_string()))
    }

    async fn git(
        &self,
        handle: &SandboxHandle,
        session_id: &str,
        args: &str,
    ) -> Result<ExecOutput, SyncError> {
        self.sandboxes
            .backend()
            .exec(handle, &format!("git {}", args))
            .await
            .map_err(|e| {
                SyncError::Sandbox(SandboxError::Unreachable {
                    session_id: session_id.to_string(),
                    reason: format!("{:#}", e),
                })
            })
    }

    async fn git_ok(
        &self,
        handle: &SandboxHandle,
        session_id: &str,
        args: &str,
        what: &str,
    ) -> Result<ExecOutput, SyncError> {
        let out = self.git(handle, session_id, args).await?;
        if !out.success() {
            return Err(SyncError::Git(format!(
                "{} failed (exit {}): {}",
                what,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(out)
    }

    async fn backup_session(
        &self,
        handle: &SandboxHandle,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<(), SyncError> {
        let backend = self.sandboxes.backend();
        let chat_history = match backend.read_file(handle, CHAT_HISTORY_PATH).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::Array(vec![])),
            Err(_) => serde_json::Value::Array(vec![]),
        };
        let requirements = backend
            .read_file(handle, REQUIREMENTS_PATH)
            .await
            .unwrap_or_default();
        self.recovery
            .create_session_snapshot(session_id, workspace_id, chat_history, &requirements)
            .await
            .map_err(|e| SyncError::Other(e.context("pre-pull backup failed")))?;
        Ok(())
    }

    async fn auto_resolve(
        &self,
        handle: &SandboxHandle,
        session_id: &str,
        conflicts: &[String],
        resolution: ConflictResolution,
        strategy: MergeStrategy,
    ) -> Result<(), SyncError> {
        let side = match resolution {
            ConflictResolution::PreferRemote => "--theirs",
            ConflictResolution::PreferLocal => "--ours",
        };
        for path in conflicts {
            self.git_ok(
                handle,
                session_id,
                &format!("checkout {} -- {}", side, quote(path)),
                "git checkout",
            )
            .await?;
        }
        self.git_ok(handle, session_id, "add -A", "git add").await?;
        match strategy {
            MergeStrategy::Merge => {
                self.git_ok(
                    handle,
                    session_id,
                    "commit -m 'Merge remote changes'",
                    "git commit",
                )
                .await?;
            }
            MergeStrategy::Rebase => {
                self.git_ok(handle, session_id, "rebase --continue", "git rebase").await?;
            }
        }
        Ok(())
    }

    async fn count_pulled_files(&self, handle: &SandboxHandle, session_id: &str) -> usize {
        match self
            .git(handle, session_id, "diff --name-only ORIG_HEAD HEAD")
            .await
        {
            Ok(out) if out.success() => out.stdout.lines().filter(|l| !l.trim().is_empty()).count(),
            _ => 0,
        }
    }

    async fn record(
        &self,
        session_id: &str,
        workspace_id: &str,
        direction: SyncDirection,
        commit_sha: Option<&str>,
        conflicts: &[String],
        outcome: SyncOutcome,
    ) {
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        let sha = commit_sha.map(str::to_string);
        let conflicts = conflicts.to_vec();
        if let Err(e) = self
            .store
            .call(move |db| {
                db.record_sync_operation(&sid, &wid, direction, sha.as_deref(), &conflicts, outcome)
            })
            .await
        {
            warn!(session_id, "failed to record sync operation: {:#}", e);
        }
    }
}

/// Changed paths from `git status --porcelain` output, filtered by the
/// include/exclude glob patterns.
fn changed_paths(porcelain: &str, include: &[String], exclude: &[String]) -> Vec<String> {
    let include: Vec<glob::Pattern> = include
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();
    let exclude: Vec<glob::Pattern> = exclude
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    porcelain
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            // Renames come through as "old -> new"; the new path is what
            // needs staging.
            match path.split_once(" -> ") {
                Some((_, new)) => new.trim().to_string(),
                None => path.trim().to_string(),
            }
        })
        .filter(|path| !path.is_empty())
        .filter(|path| include.is_empty() || include.iter().any(|p| p.matches(path)))
        .filter(|path| !exclude.iter().any(|p| p.matches(path)))
        .collect()
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::phase::default_phases;
    use crate::sandbox::manager::SeedContext;
    use crate::sandbox::testing::MockBackend;
    use crate::store::StoreDb;
    use crate::sync::githost::{PullRequest, RemoteRepo};
    use crate::workflow::{ProjectMeta, WorkflowEngine};

    #[derive(Default)]
    struct MockHost {
        fail_create: bool,
        bad_remote: bool,
        created: Mutex<Vec<(String, String)>>,
        prs: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl GitHost for MockHost {
        fn remote_url(&self, owner_repo: &str) -> String {
            if self.bad_remote {
                return "https://example.com/nowhere.git".to_string();
            }
            format!("https://github.com/{}.git", owner_repo)
        }

        async fn create_repository(
            &self,
            name: &str,
            description: &str,
            private: bool,
        ) -> Result<RemoteRepo, SyncError> {
            if self.fail_create {
                return Err(SyncError::Host("boom".into()));
            }
            self.created
                .lock()
                .unwrap()
                .push((name.to_string(), description.to_string()));
            Ok(RemoteRepo {
                full_name: format!("tester/{}", name),
                name: name.to_string(),
                private,
                html_url: format!("https://github.com/tester/{}", name),
                clone_url: format!("https://github.com/tester/{}.git", name),
                default_branch: "main".to_string(),
            })
        }

        async fn open_pull_request(
            &self,
            owner_repo: &str,
            title: &str,
            head: &str,
            _base: &str,
            _body: &str,
        ) -> Result<PullRequest, SyncError> {
            self.prs
                .lock()
                .unwrap()
                .push((owner_repo.to_string(), title.to_string(), head.to_string()));
            Ok(PullRequest {
                number: 7,
                title: title.to_string(),
                html_url: format!("https://github.com/{}/pull/7", owner_repo),
            })
        }
    }

    struct Fixture {
        store: DbHandle,
        backend: Arc<MockBackend>,
        host: Arc<MockHost>,
        sync: SyncOrchestrator,
        session_id: String,
    }

    async fn fixture(host: MockHost) -> Fixture {
        let store = DbHandle::new(StoreDb::new_in_memory().unwrap());
        let backend = Arc::new(MockBackend::new());
        let config = OrchestratorConfig::default();
        let sandboxes = Arc::new(SandboxManager::new(
            backend.clone(),
            store.clone(),
            config.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            sandboxes.clone(),
            config.clone(),
        ));
        let host = Arc::new(host);
        let sync = SyncOrchestrator::new(
            store.clone(),
            sandboxes.clone(),
            recovery,
            host.clone(),
            config,
        );

        let session = store
            .call(|db| db.create_session("w1", "todo-app"))
            .await
            .unwrap();
        let engine = WorkflowEngine::new(store.clone(), default_phases());
        engine
            .initialize_workflow(
                &session.id,
                "w1",
                &ProjectMeta {
                    name: "todo-app".into(),
                    description: "a todo app".into(),
                    requirements: "CRUD todos".into(),
                },
            )
            .await
            .unwrap();

        let phase = default_phases().remove(0);
        sandboxes
            .provision(
                &session.id,
                "w1",
                &SeedContext {
                    role_notes: phase.briefing(),
                    phase,
                    session_name: "todo-app".into(),
                    requirements: "CRUD todos".into(),
                },
            )
            .await
            .unwrap();

        Fixture {
            store,
            backend,
            host,
            sync,
            session_id: session.id,
        }
    }

    async fn link_repo(fx: &Fixture) {
        fx.sync
            .orchestrate_full_setup(&fx.session_id, "w1", "todo-app", "a todo app")
            .await
            .unwrap();
    }

    // ── setup ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_full_setup_runs_required_steps_and_links() {
        let fx = fixture(MockHost::default()).await;
        let report = fx
            .sync
            .orchestrate_full_setup(&fx.session_id, "w1", "todo-app", "a todo app")
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.errors.is_empty());
        let link = report.repository.unwrap();
        assert_eq!(link.owner_repo, "tester/todo-app");
        assert_eq!(link.default_branch, "main");

        // The description reached the host.
        assert_eq!(
            fx.host.created.lock().unwrap()[0],
            ("todo-app".to_string(), "a todo app".to_string())
        );

        let commands: Vec<String> = fx
            .backend
            .executed_commands()
            .into_iter()
            .map(|(_, c)| c)
            .collect();
        assert!(commands.iter().any(|c| c.starts_with("git init")));
        assert!(commands.iter().any(|c| c.contains("remote add origin")));
        assert!(commands.iter().any(|c| c.contains("push -u origin HEAD:main")));

        // Link persisted.
        let stored = fx
            .sync
            .repository_link(&fx.session_id, "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.owner_repo, "tester/todo-app");
    }

    #[tokio::test]
    async fn test_setup_required_failure_stops_and_reports() {
        let fx = fixture(MockHost {
            fail_create: true,
            ..MockHost::default()
        })
        .await;
        let report = fx
            .sync
            .orchestrate_full_setup(&fx.session_id, "w1", "todo-app", "")
            .await
            .unwrap();
        assert!(!report.success);
        assert!(!report.errors.is_empty());
        assert!(report.repository.is_none());
        // No git commands run after the failed required step.
        assert!(fx.backend.executed_commands().iter().all(|(_, c)| !c.contains("git")));
        // No link persisted either.
        assert!(
            fx.sync
                .repository_link(&fx.session_id, "w1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_setup_rejects_remote_not_matching_repository() {
        let fx = fixture(MockHost {
            bad_remote: true,
            ..MockHost::default()
        })
        .await;
        let report = fx
            .sync
            .orchestrate_full_setup(&fx.session_id, "w1", "todo-app", "")
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.errors.iter().any(|e| e.contains("does not address")));
        // The bogus remote was never configured.
        assert!(
            fx.backend
                .executed_commands()
                .iter()
                .all(|(_, c)| !c.contains("remote add"))
        );
    }

    #[tokio::test]
    async fn test_setup_seeds_gitignore_when_missing() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        let handle_id = fx.backend.executed_commands()[0].0.clone();
        let gitignore = fx.backend.file_content(&handle_id, ".gitignore").unwrap();
        assert!(gitignore.contains("node_modules/"));
    }

    // ── push ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_push_commits_changed_files() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend
            .on_command("status --porcelain", 0, " M src/app.ts\n?? notes.md\n", "");
        fx.backend.on_command("rev-parse HEAD", 0, "abc123\n", "");

        let report = fx
            .sync
            .sync_to_github(&fx.session_id, "w1", "add notes", &PushOptions::default())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.files_changed, 2);
        assert_eq!(report.commit_sha.as_deref(), Some("abc123"));

        let sid = fx.session_id.clone();
        let ops = fx
            .store
            .call(move |db| db.recent_sync_operations(&sid, "w1", 10))
            .await
            .unwrap();
        assert_eq!(ops[0].direction, SyncDirection::Push);
        assert_eq!(ops[0].outcome, SyncOutcome::Succeeded);
        assert_eq!(ops[0].commit_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_push_empty_diff_is_noop_success() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend.on_command("status --porcelain", 0, "", "");

        let before = fx.backend.executed_commands().len();
        let report = fx
            .sync
            .sync_to_github(&fx.session_id, "w1", "nothing", &PushOptions::default())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.files_changed, 0);
        assert!(report.commit_sha.is_none());
        // Only the status probe ran; no commit, no push.
        let after: Vec<_> = fx.backend.executed_commands().split_off(before);
        assert_eq!(after.len(), 1);
        assert!(after[0].1.contains("status --porcelain"));
    }

    #[tokio::test]
    async fn test_push_respects_include_exclude_globs() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend.on_command(
            "status --porcelain",
            0,
            " M src/app.ts\n M src/secret.env\n?? README.md\n",
            "",
        );
        fx.backend.on_command("rev-parse HEAD", 0, "def456\n", "");

        let options = PushOptions {
            include: vec!["src/**".into()],
            exclude: vec!["**/*.env".into()],
            ..PushOptions::default()
        };
        let report = fx
            .sync
            .sync_to_github(&fx.session_id, "w1", "src only", &options)
            .await
            .unwrap();
        assert_eq!(report.files_changed, 1);
        let add = fx
            .backend
            .executed_commands()
            .into_iter()
            .map(|(_, c)| c)
            .find(|c| c.starts_with("git add -- "))
            .unwrap();
        assert!(add.contains("src/app.ts"));
        assert!(!add.contains("secret.env"));
        assert!(!add.contains("README.md"));
    }

    #[tokio::test]
    async fn test_push_to_branch_opens_pull_request() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend.on_command("status --porcelain", 0, " M a.ts\n", "");
        fx.backend.on_command("rev-parse HEAD", 0, "fff000\n", "");

        let options = PushOptions {
            target_branch: Some("feature/auth".into()),
            create_pull_request: true,
            ..PushOptions::default()
        };
        let report = fx
            .sync
            .sync_to_github(&fx.session_id, "w1", "auth flow", &options)
            .await
            .unwrap();
        assert_eq!(
            report.pull_request_url.as_deref(),
            Some("https://github.com/tester/todo-app/pull/7")
        );
        let prs = fx.host.prs.lock().unwrap();
        assert_eq!(prs[0].2, "feature/auth");
    }

    #[tokio::test]
    async fn test_push_without_link_is_rejected() {
        let fx = fixture(MockHost::default()).await;
        let err = fx
            .sync
            .sync_to_github(&fx.session_id, "w1", "msg", &PushOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoRepositoryLink(_)));
    }

    #[tokio::test]
    async fn test_push_git_failure_recorded_as_failed() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend.on_command("status --porcelain", 0, " M a.ts\n", "");
        fx.backend
            .on_command("push origin HEAD:main", 1, "", "remote rejected");

        let err = fx
            .sync
            .sync_to_github(&fx.session_id, "w1", "msg", &PushOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Git(_)));

        let sid = fx.session_id.clone();
        let ops = fx
            .store
            .call(move |db| db.recent_sync_operations(&sid, "w1", 10))
            .await
            .unwrap();
        assert_eq!(ops[0].outcome, SyncOutcome::Failed);
    }

    // ── pull ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pull_clean_merge() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend
            .on_command("diff --name-only ORIG_HEAD HEAD", 0, "a.ts\nb.ts\n", "");

        let report = fx
            .sync
            .sync_from_github(&fx.session_id, "w1", &PullOptions::default())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.files_changed, 2);
        assert!(report.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_pull_conflict_without_resolution_aborts() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend
            .on_command("merge origin/", 1, "", "CONFLICT (content): src/app.ts");
        fx.backend
            .on_command("diff --name-only --diff-filter=U", 0, "src/app.ts\n", "");

        let report = fx
            .sync
            .sync_from_github(&fx.session_id, "w1", &PullOptions::default())
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.conflicts, vec!["src/app.ts"]);
        assert!(
            fx.backend
                .executed_commands()
                .iter()
                .any(|(_, c)| c.contains("merge --abort"))
        );

        let sid = fx.session_id.clone();
        let ops = fx
            .store
            .call(move |db| db.recent_sync_operations(&sid, "w1", 10))
            .await
            .unwrap();
        assert_eq!(ops[0].outcome, SyncOutcome::Conflicted);
        assert_eq!(ops[0].conflicts, vec!["src/app.ts"]);
    }

    #[tokio::test]
    async fn test_pull_conflict_prefer_remote_resolves() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;
        fx.backend
            .on_command("merge origin/", 1, "", "CONFLICT (content): src/app.ts");
        fx.backend
            .on_command("diff --name-only --diff-filter=U", 0, "src/app.ts\n", "");

        let options = PullOptions {
            resolve_conflicts: Some(ConflictResolution::PreferRemote),
            ..PullOptions::default()
        };
        let report = fx
            .sync
            .sync_from_github(&fx.session_id, "w1", &options)
            .await
            .unwrap();
        assert!(report.success);
        assert!(report.conflicts.is_empty());
        assert_eq!(report.files_changed, 1);
        let commands: Vec<String> = fx
            .backend
            .executed_commands()
            .into_iter()
            .map(|(_, c)| c)
            .collect();
        assert!(commands.iter().any(|c| c.contains("checkout --theirs -- 'src/app.ts'")));
        assert!(commands.iter().any(|c| c.contains("commit -m 'Merge remote changes'")));
    }

    #[tokio::test]
    async fn test_pull_backup_creates_snapshot_first() {
        let fx = fixture(MockHost::default()).await;
        link_repo(&fx).await;

        let options = PullOptions {
            backup_local: true,
            ..PullOptions::default()
        };
        fx.sync
            .sync_from_github(&fx.session_id, "w1", &options)
            .await
            .unwrap();

        let sid = fx.session_id.clone();
        let snapshot = fx
            .store
            .call(move |db| db.latest_snapshot(&sid, "w1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.requirements, "CRUD todos");
    }

    // ── changed_paths ─────────────────────────────────────────────────

    #[test]
    fn test_changed_paths_parses_porcelain_and_renames() {
        let porcelain = " M src/app.ts\n?? notes.md\nR  old.ts -> new.ts\n";
        let paths = changed_paths(porcelain, &[], &[]);
        assert_eq!(paths, vec!["src/app.ts", "notes.md", "new.ts"]);
    }

    #[test]
    fn test_changed_paths_filters() {
        let porcelain = " M src/app.ts\n M docs/readme.md\n";
        let paths = changed_paths(porcelain, &["src/**".to_string()], &[]);
        assert_eq!(paths, vec!["src/app.ts"]);
        let paths = changed_paths(porcelain, &[], &["docs/**".to_string()]);
        assert_eq!(paths, vec!["src/app.ts"]);
    }
}
