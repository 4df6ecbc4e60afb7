//! Sandbox backend abstraction.
//!
//! The orchestrator talks to remote execution environments only through
//! `SandboxBackend`. The default `ProcessBackend` hosts each sandbox as a
//! working directory on the local machine and executes commands with
//! `tokio::process`; production deployments swap in a remote backend behind
//! the same trait.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Addressable handle for one live sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxHandle {
    /// Backend-assigned identity.
    pub id: String,
    /// Reachable address (backend-specific; the process backend uses a
    /// filesystem path).
    pub addr: String,
    /// Working-directory path inside the sandbox.
    pub workdir: PathBuf,
}

/// Output of one command execution inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Create a sandbox from a template with the given environment.
    async fn create(&self, template: &str, env: &HashMap<String, String>)
    -> Result<SandboxHandle>;

    /// Execute a shell command inside the sandbox working directory.
    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput>;

    /// Write a file relative to the sandbox working directory.
    async fn write_file(&self, handle: &SandboxHandle, path: &str, content: &str) -> Result<()>;

    /// Read a file relative to the sandbox working directory.
    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<String>;

    /// Tear the sandbox down. Idempotent at the backend level.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;

    /// Cheap liveness probe used by the recovery path before reconnecting.
    async fn is_reachable(&self, handle: &SandboxHandle) -> bool;
}

/// Local-process backend: each sandbox is a directory under `base_dir` and
/// commands run via `sh -c` with that directory as cwd.
pub struct ProcessBackend {
    base_dir: PathBuf,
    /// Per-sandbox environment, keyed by sandbox id, applied on every exec.
    envs: std::sync::Mutex<HashMap<String, HashMap<String, String>>>,
}

impl ProcessBackend {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            envs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn env_for(&self, sandbox_id: &str) -> HashMap<String, String> {
        self.envs
            .lock()
            .map(|guard| guard.get(sandbox_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn resolve(&self, handle: &SandboxHandle, path: &str) -> PathBuf {
        handle.workdir.join(path)
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    async fn create(
        &self,
        _template: &str,
        env: &HashMap<String, String>,
    ) -> Result<SandboxHandle> {
        let id = format!("sbx-{}", uuid::Uuid::new_v4());
        let workdir = self.base_dir.join(&id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .with_context(|| format!("Failed to create sandbox dir {}", workdir.display()))?;
        if let Ok(mut guard) = self.envs.lock() {
            guard.insert(id.clone(), env.clone());
        }
        Ok(SandboxHandle {
            addr: workdir.display().to_string(),
            workdir,
            id,
        })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput> {
        let env = self.env_for(&handle.id);
        // Callers bound exec with a timeout; the child must die with the
        // dropped future instead of outliving it and mutating the workdir.
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&handle.workdir)
            .envs(&env)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute command in sandbox {}", handle.id))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn write_file(&self, handle: &SandboxHandle, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(handle, path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create parent dirs for {}", full.display())
            })?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))
    }

    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<String> {
        let full = self.resolve(handle, path);
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        if handle.workdir.exists() {
            tokio::fs::remove_dir_all(&handle.workdir)
                .await
                .with_context(|| format!("Failed to remove {}", handle.workdir.display()))?;
        }
        if let Ok(mut guard) = self.envs.lock() {
            guard.remove(&handle.id);
        }
        Ok(())
    }

    async fn is_reachable(&self, handle: &SandboxHandle) -> bool {
        handle.workdir.is_dir()
    }
}
