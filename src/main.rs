use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use atelier::config::OrchestratorConfig;
use atelier::orchestrator::SessionOrchestrator;
use atelier::sandbox::ProcessBackend;
use atelier::store::{DbHandle, StoreDb};
use atelier::sync::githost::GitHubHost;
use atelier::sync::orchestrator::{ConflictResolution, MergeStrategy, PullOptions, PushOptions};
use atelier::workflow::ProjectMeta;

#[derive(Parser)]
#[command(name = "atelier")]
#[command(version, about = "Session orchestration for agent-driven app building")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace all commands operate in.
    #[arg(long, global = true, default_value = "default")]
    pub workspace: String,

    /// Directory holding the `.atelier` state (database, sandboxes, config).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a session and provision its sandbox
    New {
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Project requirements (text)
        #[arg(short, long)]
        requirements: String,
    },
    /// Send one prompt to the session's agent
    Turn {
        session: String,
        prompt: String,
    },
    /// Check the current phase's quality gate
    Gate {
        session: String,
    },
    /// Pass the gate and advance to the next phase
    Advance {
        session: String,
    },
    /// Show session and workflow status
    Status {
        session: String,
    },
    /// List sessions in the workspace
    Sessions,
    /// Snapshot the session for later recovery
    Snapshot {
        session: String,
    },
    /// Attempt to recover a session
    Recover {
        session: String,
    },
    /// Show recovery attempts for a session
    History {
        session: String,
    },
    /// Workspace-wide recovery statistics
    Stats,
    /// Create the GitHub repository and push the initial commit
    Setup {
        session: String,
        /// Repository name on the host
        repo: String,
        /// Repository description on the host
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Commit and push local changes
    Push {
        session: String,
        #[arg(short, long)]
        message: String,
        #[arg(long)]
        branch: Option<String>,
        /// Open a pull request into the default branch
        #[arg(long)]
        pr: bool,
    },
    /// Pull remote changes into the sandbox
    Pull {
        session: String,
        #[arg(long)]
        rebase: bool,
        /// Auto-resolve conflicts keeping the remote side
        #[arg(long)]
        prefer_remote: bool,
        /// Auto-resolve conflicts keeping the local side
        #[arg(long)]
        prefer_local: bool,
        /// Snapshot the session before pulling
        #[arg(long)]
        backup: bool,
    },
    /// Final sync, snapshot, and sandbox teardown
    Close {
        session: String,
    },
    /// Sessions whose sandbox has been idle past the window
    Idle,
    /// Rebuild the sandbox registry from the store
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let state_dir = data_dir.join(".atelier");
    std::fs::create_dir_all(state_dir.join("sandboxes"))
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let config = OrchestratorConfig::load(&data_dir)?;
    let store = DbHandle::new(StoreDb::new(&state_dir.join("atelier.db"))?);
    let backend = Arc::new(ProcessBackend::new(state_dir.join("sandboxes")));

    let mut orchestrator = SessionOrchestrator::new(store, backend, config.clone());
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        let host = GitHubHost::new(&token)?;
        orchestrator = orchestrator.with_git_host(Arc::new(host), config);
    }

    let workspace = cli.workspace.as_str();
    match cli.command {
        Commands::New {
            name,
            description,
            requirements,
        } => {
            let meta = ProjectMeta {
                name,
                description,
                requirements,
            };
            let session = orchestrator.create_session(workspace, &meta).await?;
            println!("Created session {} ({})", session.id, session.name);
        }
        Commands::Turn { session, prompt } => {
            let outcome = orchestrator.handle_turn(&session, workspace, &prompt).await?;
            if let Some(recovery) = &outcome.recovered {
                println!(
                    "(session recovered first; new sandbox: {})",
                    recovery.new_sandbox_id.as_deref().unwrap_or("none")
                );
            }
            println!("{}", outcome.agent.message.trim_end());
            if !outcome.agent.file_mutations.is_empty() {
                println!("\nFiles touched:");
                for mutation in &outcome.agent.file_mutations {
                    println!("  {:?} {}", mutation.kind, mutation.path);
                }
            }
        }
        Commands::Gate { session } => {
            let state = orchestrator
                .workflow()
                .pass_quality_gate(&session, workspace)
                .await?;
            println!("Quality gate passed for phase {}", state.current_phase);
        }
        Commands::Advance { session } => {
            let state = orchestrator.advance_phase(&session, workspace).await?;
            match state.current() {
                Some(phase) => println!(
                    "Advanced to phase {} ({})",
                    state.current_phase, phase.role
                ),
                None => println!("Workflow complete"),
            }
        }
        Commands::Status { session } => {
            let state = orchestrator.workflow().get_state(&session, workspace).await?;
            println!("Phase {}/{}", state.current_phase, state.phases.len());
            for phase in &state.phases {
                let gate = if phase.gate_passed { "gate ok" } else { "gate pending" };
                println!(
                    "  {}. {:<18} {:<22} {}",
                    phase.number,
                    phase.role,
                    phase.status.as_str(),
                    gate
                );
            }
        }
        Commands::Sessions => {
            let wid = workspace.to_string();
            let sessions = orchestrator
                .store()
                .call(move |db| db.list_sessions(&wid))
                .await?;
            for session in sessions {
                println!(
                    "{}  {:<10} {:<24} sandbox={}",
                    session.id,
                    session.status.as_str(),
                    session.name,
                    session.sandbox_id.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Snapshot { session } => {
            let requirements = match orchestrator.sandboxes().handle(&session).await {
                Ok(handle) => orchestrator
                    .sandboxes()
                    .backend()
                    .read_file(&handle, ".atelier/requirements.md")
                    .await
                    .unwrap_or_default(),
                Err(_) => String::new(),
            };
            let snapshot = orchestrator
                .recovery()
                .create_session_snapshot(
                    &session,
                    workspace,
                    serde_json::Value::Array(vec![]),
                    &requirements,
                )
                .await?;
            println!("Snapshot {} created", snapshot.id);
        }
        Commands::Recover { session } => {
            let result = orchestrator.recovery().recover_session(&session, workspace).await;
            println!(
                "session: {}  sandbox: {}  workflow: {}  context: {}",
                result.session_restored,
                result.sandbox_reconnected,
                result.workflow_restored,
                result.context_restored
            );
            if let Some(id) = &result.new_sandbox_id {
                println!("new sandbox: {}", id);
            }
            for warning in &result.warnings {
                println!("warning: {}", warning);
            }
            for error in &result.errors {
                println!("error: {}", error);
            }
            if !result.succeeded() {
                bail!("recovery did not restore a usable session");
            }
        }
        Commands::History { session } => {
            let history = orchestrator
                .recovery()
                .recovery_history(&session, workspace)
                .await?;
            for log in history {
                println!(
                    "#{} attempt {}  success={}  {}ms  {}",
                    log.id,
                    log.attempt,
                    log.succeeded(),
                    log.duration_ms,
                    log.created_at.to_rfc3339()
                );
            }
        }
        Commands::Stats => {
            let stats = orchestrator.recovery().recovery_stats(workspace).await?;
            println!(
                "{} attempts, {} succeeded ({:.0}%), avg {:.0}ms",
                stats.attempts,
                stats.successes,
                stats.success_rate * 100.0,
                stats.avg_duration_ms
            );
        }
        Commands::Setup {
            session,
            repo,
            description,
        } => {
            let sync = require_sync(&orchestrator)?;
            let report = sync
                .orchestrate_full_setup(&session, workspace, &repo, &description)
                .await?;
            for step in &report.steps {
                let mark = if step.ok { "ok" } else { "FAILED" };
                println!("  {:<20} {}  {}", step.name, mark, step.detail);
            }
            match (&report.success, &report.repository) {
                (true, Some(link)) => println!("Linked to {}", link.owner_repo),
                _ => bail!("setup failed: {}", report.errors.join("; ")),
            }
        }
        Commands::Push {
            session,
            message,
            branch,
            pr,
        } => {
            let sync = require_sync(&orchestrator)?;
            let options = PushOptions {
                target_branch: branch,
                create_pull_request: pr,
                ..PushOptions::default()
            };
            let report = sync
                .sync_to_github(&session, workspace, &message, &options)
                .await?;
            match &report.commit_sha {
                Some(sha) => println!("Pushed {} files at {}", report.files_changed, sha),
                None => println!("Nothing to push"),
            }
            if let Some(url) = &report.pull_request_url {
                println!("Pull request: {}", url);
            }
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
        }
        Commands::Pull {
            session,
            rebase,
            prefer_remote,
            prefer_local,
            backup,
        } => {
            if prefer_remote && prefer_local {
                bail!("--prefer-remote and --prefer-local are mutually exclusive");
            }
            let sync = require_sync(&orchestrator)?;
            let options = PullOptions {
                strategy: if rebase {
                    MergeStrategy::Rebase
                } else {
                    MergeStrategy::Merge
                },
                resolve_conflicts: if prefer_remote {
                    Some(ConflictResolution::PreferRemote)
                } else if prefer_local {
                    Some(ConflictResolution::PreferLocal)
                } else {
                    None
                },
                backup_local: backup,
            };
            let report = sync.sync_from_github(&session, workspace, &options).await?;
            if report.success {
                println!("Pulled {} files", report.files_changed);
                if !report.conflicts.is_empty() {
                    println!("Auto-resolved conflicts in:");
                    for path in &report.conflicts {
                        println!("  {}", path);
                    }
                }
            } else {
                println!("Pull aborted; conflicts in:");
                for path in &report.conflicts {
                    println!("  {}", path);
                }
                bail!("resolve conflicts and retry, or pass --prefer-remote/--prefer-local");
            }
        }
        Commands::Close { session } => {
            let report = orchestrator.close_session(&session, workspace).await?;
            if let Some(sha) = &report.final_commit {
                println!("Final commit {}", sha);
            }
            if let Some(id) = &report.snapshot_id {
                println!("Snapshot {}", id);
            }
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            println!(
                "Sandbox {}",
                if report.sandbox_terminated { "terminated" } else { "teardown failed" }
            );
        }
        Commands::Idle => {
            orchestrator.reconcile(workspace).await?;
            for session in orchestrator.sandboxes().idle_sessions().await {
                println!("{}", session);
            }
        }
        Commands::Reconcile => {
            orchestrator.reconcile(workspace).await?;
            let active = orchestrator.sandboxes().list_active().await;
            println!("{} live sandbox(es)", active.len());
        }
    }

    Ok(())
}

fn require_sync(
    orchestrator: &SessionOrchestrator,
) -> Result<&atelier::sync::orchestrator::SyncOrchestrator> {
    orchestrator
        .sync()
        .context("GitHub sync requires GITHUB_TOKEN to be set")
}
