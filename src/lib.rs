//! Session orchestration and recovery for agent-driven development.
//!
//! A session pairs a persistent workspace-scoped record with an ephemeral
//! sandbox where a coding agent runs. The crate covers the four subsystems
//! around that pairing:
//!
//! - [`workflow`] — the linear phase state machine with quality gates
//! - [`sandbox`] — sandbox provisioning, agent invocation, lifecycle registry
//! - [`recovery`] — snapshots and best-effort session restoration
//! - [`sync`] — GitHub repository setup and bidirectional sync
//!
//! [`orchestrator::SessionOrchestrator`] wires them together over the shared
//! SQLite [`store`].

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod phase;
pub mod recovery;
pub mod sandbox;
pub mod store;
pub mod sync;
pub mod workflow;

pub use config::OrchestratorConfig;
pub use errors::{SandboxError, SyncError, WorkflowError};
pub use orchestrator::SessionOrchestrator;
