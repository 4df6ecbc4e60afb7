//! Orchestrator configuration loaded from `.atelier/orchestrator.toml`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Tunables for the session orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sandbox template passed to the backend on provision.
    pub sandbox_template: String,
    /// Environment seeded into every sandbox.
    pub sandbox_env: HashMap<String, String>,
    /// Bound on a single agent invocation, in seconds.
    pub agent_timeout_secs: u64,
    /// Maximum agent turns per invocation.
    pub agent_max_turns: u32,
    /// A sandbox with no invocation for this long is reported idle.
    pub idle_window_secs: u64,
    /// Sessions older than this are not recoverable from snapshots.
    pub recovery_window_days: i64,
    /// Inactivity threshold for the `needs_recovery` predicate.
    pub inactivity_threshold_secs: i64,
    /// Git author identity configured in the sandbox during repo setup.
    pub git_user_name: String,
    pub git_user_email: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sandbox_template: "base".to_string(),
            sandbox_env: HashMap::new(),
            agent_timeout_secs: 120,
            agent_max_turns: 25,
            idle_window_secs: 900,
            recovery_window_days: 30,
            inactivity_threshold_secs: 7200,
            git_user_name: "Atelier".to_string(),
            git_user_email: "builder@atelier.dev".to_string(),
        }
    }
}

/// Raw TOML structure for `.atelier/orchestrator.toml`
#[derive(Debug, Deserialize)]
struct OrchestratorToml {
    orchestrator: Option<OrchestratorSection>,
}

#[derive(Debug, Deserialize)]
struct OrchestratorSection {
    sandbox_template: Option<String>,
    sandbox_env: Option<HashMap<String, String>>,
    agent_timeout_secs: Option<u64>,
    agent_max_turns: Option<u32>,
    idle_window_secs: Option<u64>,
    recovery_window_days: Option<i64>,
    inactivity_threshold_secs: Option<i64>,
    git_user_name: Option<String>,
    git_user_email: Option<String>,
}

impl OrchestratorConfig {
    /// Load config from `.atelier/orchestrator.toml` under the given root.
    /// Returns defaults if the file doesn't exist.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(".atelier").join("orchestrator.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let toml: OrchestratorToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.orchestrator {
            if let Some(template) = section.sandbox_template {
                config.sandbox_template = template;
            }
            if let Some(env) = section.sandbox_env {
                config.sandbox_env = env;
            }
            if let Some(timeout) = section.agent_timeout_secs {
                config.agent_timeout_secs = timeout;
            }
            if let Some(turns) = section.agent_max_turns {
                config.agent_max_turns = turns;
            }
            if let Some(idle) = section.idle_window_secs {
                config.idle_window_secs = idle;
            }
            if let Some(days) = section.recovery_window_days {
                config.recovery_window_days = days;
            }
            if let Some(secs) = section.inactivity_threshold_secs {
                config.inactivity_threshold_secs = secs;
            }
            if let Some(name) = section.git_user_name {
                config.git_user_name = name;
            }
            if let Some(email) = section.git_user_email {
                config.git_user_email = email;
            }
        }

        Ok(config)
    }
}
