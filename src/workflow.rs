//! Phase workflow engine.
//!
//! Drives the linear phase state machine for a session: initialization,
//! progress merges, quality gates, and phase advancement. The engine checks
//! *presence* of required progress fields, not semantic correctness — that is
//! the agent's job. `current_phase` only moves forward, and the advance write
//! is conditional on the stored phase so concurrent advances are rejected
//! instead of double-applied.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::WorkflowError;
use crate::models::{PhaseState, PhaseStatus, SessionStatus, WorkflowState};
use crate::phase::{PhaseSpec, get_phase, last_phase};
use crate::store::DbHandle;

/// Descriptive fields required to start a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    pub description: String,
    pub requirements: String,
}

impl ProjectMeta {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        for (field, value) in [
            ("name", &self.name),
            ("description", &self.description),
            ("requirements", &self.requirements),
        ] {
            if value.trim().is_empty() {
                return Err(WorkflowError::InvalidProjectMeta {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

pub struct WorkflowEngine {
    store: DbHandle,
    phases: Vec<PhaseSpec>,
}

impl WorkflowEngine {
    pub fn new(store: DbHandle, phases: Vec<PhaseSpec>) -> Self {
        Self { store, phases }
    }

    pub fn phase_specs(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// Create phase-1 state for a session.
    pub async fn initialize_workflow(
        &self,
        session_id: &str,
        workspace_id: &str,
        meta: &ProjectMeta,
    ) -> Result<WorkflowState, WorkflowError> {
        meta.validate()?;

        let phases: Vec<PhaseState> = self
            .phases
            .iter()
            .map(|spec| {
                let status = if spec.number == 1 {
                    PhaseStatus::Active
                } else {
                    PhaseStatus::Pending
                };
                PhaseState::new(spec.number, &spec.role, status)
            })
            .collect();

        let state = WorkflowState {
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            current_phase: 1,
            phases,
            artifacts: HashMap::new(),
        };

        let to_insert = state.clone();
        self.store
            .call(move |db| db.init_workflow_state(&to_insert))
            .await?;
        info!(session_id, "workflow initialized at phase 1");
        Ok(state)
    }

    /// Merge caller-supplied progress and artifacts into the current phase.
    /// Last-write-wins per top-level field; no phase transition. Re-entrant:
    /// repeated identical calls are idempotent merges.
    pub async fn update_phase_progress(
        &self,
        session_id: &str,
        workspace_id: &str,
        progress: Value,
        artifacts: HashMap<String, Value>,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut state = self.load(session_id, workspace_id).await?;

        {
            let phase = state.current_mut().ok_or_else(|| WorkflowError::Store(
                anyhow::anyhow!("current phase missing from workflow state"),
            ))?;
            merge_progress(&mut phase.progress, progress);
            if phase.status == PhaseStatus::Pending {
                phase.status = PhaseStatus::Active;
            }
        }
        state.artifacts.extend(artifacts);

        let to_save = state.clone();
        let saved = self
            .store
            .call(move |db| db.save_workflow_state(&to_save))
            .await?;
        if !saved {
            return Err(WorkflowError::PhaseUpdateConflict {
                session_id: session_id.to_string(),
            });
        }
        debug!(session_id, phase = state.current_phase, "progress merged");
        Ok(state)
    }

    /// Mark the current phase's quality gate satisfied. Fails when required
    /// progress fields are missing.
    pub async fn pass_quality_gate(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut state = self.load(session_id, workspace_id).await?;
        let spec = get_phase(&self.phases, state.current_phase).ok_or_else(|| {
            WorkflowError::Store(anyhow::anyhow!(
                "phase {} not in catalog",
                state.current_phase
            ))
        })?;

        let current = state.current().ok_or_else(|| WorkflowError::Store(
            anyhow::anyhow!("current phase missing from workflow state"),
        ))?;
        let missing = missing_fields(&current.progress, &spec.required_fields);
        if !missing.is_empty() {
            return Err(WorkflowError::QualityGateNotMet {
                phase: state.current_phase,
                missing,
            });
        }

        {
            let phase = state.current_mut().ok_or_else(|| WorkflowError::Store(
                anyhow::anyhow!("current phase missing from workflow state"),
            ))?;
            phase.gate_passed = true;
            phase.status = PhaseStatus::AwaitingQualityGate;
        }

        let to_save = state.clone();
        let saved = self
            .store
            .call(move |db| db.save_workflow_state(&to_save))
            .await?;
        if !saved {
            return Err(WorkflowError::PhaseUpdateConflict {
                session_id: session_id.to_string(),
            });
        }
        info!(session_id, phase = state.current_phase, "quality gate passed");
        Ok(state)
    }

    /// Current workflow state for a session.
    pub async fn get_state(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        self.load(session_id, workspace_id).await
    }

    /// True iff the current gate passed and this isn't the last phase.
    pub async fn can_advance_to_next_phase(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<bool, WorkflowError> {
        let state = self.load(session_id, workspace_id).await?;
        Ok(can_advance(&state, &self.phases))
    }

    /// Transition `current_phase` → `current_phase + 1`. Completing the last
    /// phase marks the whole session completed instead.
    pub async fn advance_to_next_phase(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut state = self.load(session_id, workspace_id).await?;
        let gate_passed = state.current().map(|p| p.gate_passed).unwrap_or(false);

        if !gate_passed {
            return Err(WorkflowError::InvalidPhaseTransition {
                current: state.current_phase,
                reason: "quality gate not passed".to_string(),
            });
        }

        let expected = state.current_phase;
        let last = last_phase(&self.phases);

        if expected >= last {
            // Last phase complete: close out the phase and the session.
            if let Some(phase) = state.current_mut() {
                phase.status = PhaseStatus::Completed;
            }
            let to_save = state.clone();
            let session_id_owned = session_id.to_string();
            let workspace_id_owned = workspace_id.to_string();
            let saved = self
                .store
                .call(move |db| {
                    let ok = db.save_workflow_state(&to_save)?;
                    if ok {
                        db.set_session_status(
                            &session_id_owned,
                            &workspace_id_owned,
                            &SessionStatus::Completed,
                        )?;
                    }
                    Ok(ok)
                })
                .await?;
            if !saved {
                return Err(WorkflowError::PhaseUpdateConflict {
                    session_id: session_id.to_string(),
                });
            }
            info!(session_id, "final phase complete, session completed");
            return Ok(state);
        }

        if let Some(phase) = state.current_mut() {
            phase.status = PhaseStatus::Completed;
        }
        state.current_phase = expected + 1;
        if let Some(next) = state.current_mut() {
            next.status = PhaseStatus::Active;
        }

        let to_save = state.clone();
        let advanced = self
            .store
            .call(move |db| db.advance_workflow_phase(&to_save, expected))
            .await?;
        if !advanced {
            return Err(WorkflowError::InvalidPhaseTransition {
                current: expected,
                reason: "lost advance race to a concurrent writer".to_string(),
            });
        }
        info!(
            session_id,
            from = expected,
            to = state.current_phase,
            "phase advanced"
        );
        Ok(state)
    }

    async fn load(
        &self,
        session_id: &str,
        workspace_id: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        let sid = session_id.to_string();
        let wid = workspace_id.to_string();
        self.store
            .call(move |db| db.get_workflow_state(&sid, &wid))
            .await?
            .ok_or_else(|| WorkflowError::WorkflowNotFound {
                session_id: session_id.to_string(),
            })
    }
}

/// Pure form of the advance predicate: gate passed and not the last phase.
pub fn can_advance(state: &WorkflowState, phases: &[PhaseSpec]) -> bool {
    let gate_passed = state.current().map(|p| p.gate_passed).unwrap_or(false);
    gate_passed && state.current_phase < last_phase(phases)
}

/// Last-write-wins merge of top-level progress fields.
fn merge_progress(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(new)) => {
            for (key, value) in new {
                current.insert(key, value);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

fn missing_fields(progress: &Value, required: &[String]) -> Vec<String> {
    let empty = serde_json::Map::new();
    let fields = progress.as_object().unwrap_or(&empty);
    required
        .iter()
        .filter(|field| match fields.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .cloned()
        .collect()
}
