//! In-memory sandbox backend for tests.
//!
//! Holds sandbox state (files, liveness, env) in a mutex-guarded map and lets
//! tests script command output and inject failures. Shared between unit tests
//! and the integration suite, so it lives as a normal module rather than
//! behind `#[cfg(test)]`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use crate::sandbox::backend::{ExecOutput, SandboxBackend, SandboxHandle};

#[derive(Default)]
struct MockSandbox {
    files: HashMap<String, String>,
    env: HashMap<String, String>,
    alive: bool,
}

struct ExecRule {
    pattern: String,
    output: ExecOutput,
}

#[derive(Default)]
struct State {
    sandboxes: HashMap<String, MockSandbox>,
    created: usize,
    fail_next_create: Option<String>,
    fail_destroy: bool,
    rules: Vec<ExecRule>,
    default_stdout: String,
    exec_log: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<State>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` call fail with the given reason.
    pub fn fail_next_create(&self, reason: &str) {
        self.lock().fail_next_create = Some(reason.to_string());
    }

    /// Make every `destroy` call fail until switched off.
    pub fn fail_destroy(&self, fail: bool) {
        self.lock().fail_destroy = fail;
    }

    /// Stdout returned by `exec` for commands no rule matches.
    pub fn script_exec_stdout(&self, stdout: &str) {
        self.lock().default_stdout = stdout.to_string();
    }

    /// Script the output of any command containing `pattern`. Rules are
    /// matched in registration order, first match wins.
    pub fn on_command(&self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.lock().rules.push(ExecRule {
            pattern: pattern.to_string(),
            output: ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        });
    }

    /// Mark a sandbox dead: probes fail and every operation on it errors.
    pub fn kill(&self, sandbox_id: &str) {
        if let Some(sandbox) = self.lock().sandboxes.get_mut(sandbox_id) {
            sandbox.alive = false;
        }
    }

    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    pub fn file_content(&self, sandbox_id: &str, path: &str) -> Option<String> {
        self.lock()
            .sandboxes
            .get(sandbox_id)
            .and_then(|s| s.files.get(path).cloned())
    }

    /// Environment the sandbox was created with.
    pub fn sandbox_env(&self, sandbox_id: &str) -> Option<HashMap<String, String>> {
        self.lock().sandboxes.get(sandbox_id).map(|s| s.env.clone())
    }

    /// Every command executed so far, as (sandbox_id, command) pairs.
    pub fn executed_commands(&self) -> Vec<(String, String)> {
        self.lock().exec_log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_alive(state: &State, sandbox_id: &str) -> Result<()> {
        match state.sandboxes.get(sandbox_id) {
            Some(sandbox) if sandbox.alive => Ok(()),
            Some(_) => bail!("sandbox {} is dead", sandbox_id),
            None => bail!("sandbox {} does not exist", sandbox_id),
        }
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    async fn create(
        &self,
        _template: &str,
        env: &HashMap<String, String>,
    ) -> Result<SandboxHandle> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_next_create.take() {
            return Err(anyhow!(reason));
        }
        state.created += 1;
        let id = format!("mock-{}", state.created);
        state.sandboxes.insert(
            id.clone(),
            MockSandbox {
                files: HashMap::new(),
                env: env.clone(),
                alive: true,
            },
        );
        Ok(SandboxHandle {
            addr: format!("/mock/{id}"),
            workdir: PathBuf::from(format!("/mock/{id}")),
            id,
        })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput> {
        let mut state = self.lock();
        Self::check_alive(&state, &handle.id)?;
        state
            .exec_log
            .push((handle.id.clone(), command.to_string()));
        for rule in &state.rules {
            if command.contains(&rule.pattern) {
                return Ok(rule.output.clone());
            }
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: state.default_stdout.clone(),
            stderr: String::new(),
        })
    }

    async fn write_file(&self, handle: &SandboxHandle, path: &str, content: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_alive(&state, &handle.id)?;
        if let Some(sandbox) = state.sandboxes.get_mut(&handle.id) {
            sandbox.files.insert(path.to_string(), content.to_string());
        }
        Ok(())
    }

    async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<String> {
        let state = self.lock();
        Self::check_alive(&state, &handle.id)?;
        state
            .sandboxes
            .get(&handle.id)
            .and_then(|s| s.files.get(path).cloned())
            .ok_or_else(|| anyhow!("no such file {} in sandbox {}", path, handle.id))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let mut state = self.lock();
        if state.fail_destroy {
            bail!("destroy failed for {}", handle.id);
        }
        state.sandboxes.remove(&handle.id);
        Ok(())
    }

    async fn is_reachable(&self, handle: &SandboxHandle) -> bool {
        self.lock()
            .sandboxes
            .get(&handle.id)
            .map(|s| s.alive)
            .unwrap_or(false)
    }
}
