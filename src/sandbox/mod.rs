//! Sandbox provisioning, agent invocation, and lifecycle tracking.

pub mod agent;
pub mod backend;
pub mod manager;
pub mod testing;

pub use agent::{AgentResult, FileMutation, MutationKind, parse_agent_output};
pub use backend::{ExecOutput, ProcessBackend, SandboxBackend, SandboxHandle};
pub use manager::{InvokeOptions, SandboxManager, SeedContext};
