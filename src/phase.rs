//! Phase catalog for the development workflow.
//!
//! The workflow is a linear chain of phases, each bound to a specialized
//! subagent role and a quality-gate field set. The engine in
//! `crate::workflow` checks field *presence* only — semantic correctness of
//! the values is the agent's responsibility.

use serde::{Deserialize, Serialize};

/// Definition of a single workflow phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    /// Ordinal in the chain, 1-based.
    pub number: u32,
    /// Human-readable name.
    pub name: String,
    /// Subagent role tag bound to this phase.
    pub role: String,
    /// Progress fields that must be present before the quality gate passes.
    pub required_fields: Vec<String>,
}

impl PhaseSpec {
    pub fn new(number: u32, name: &str, role: &str, required_fields: &[&str]) -> Self {
        Self {
            number,
            name: name.to_string(),
            role: role.to_string(),
            required_fields: required_fields.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Role briefing seeded into the sandbox as the agent's context file.
    pub fn briefing(&self) -> String {
        format!(
            "You are acting as the {} for phase {} ({}).\n\
             Report progress with at least these fields: {}.",
            self.role,
            self.number,
            self.name,
            self.required_fields.join(", ")
        )
    }
}

/// The default six-phase delivery chain.
pub fn default_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new(
            1,
            "Requirements gathering",
            "analyst",
            &["summary", "user_stories"],
        ),
        PhaseSpec::new(
            2,
            "Architecture design",
            "architect",
            &["components", "tech_stack"],
        ),
        PhaseSpec::new(
            3,
            "Data model",
            "schema_designer",
            &["entities", "relationships"],
        ),
        PhaseSpec::new(
            4,
            "Implementation",
            "coder",
            &["features_implemented", "entry_points"],
        ),
        PhaseSpec::new(5, "Testing", "tester", &["test_summary", "pass_rate"]),
        PhaseSpec::new(6, "Delivery", "release_manager", &["deploy_notes"]),
    ]
}

/// Look up a phase by ordinal.
pub fn get_phase(phases: &[PhaseSpec], number: u32) -> Option<&PhaseSpec> {
    phases.iter().find(|p| p.number == number)
}

/// Ordinal of the last phase in the chain.
pub fn last_phase(phases: &[PhaseSpec]) -> u32 {
    phases.iter().map(|p| p.number).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_phases_are_a_linear_chain() {
        let phases = default_phases();
        assert_eq!(phases.len(), 6);
        for (idx, phase) in phases.iter().enumerate() {
            assert_eq!(phase.number, idx as u32 + 1);
        }
    }

    #[test]
    fn test_every_phase_has_a_role_and_gate_fields() {
        for phase in default_phases() {
            assert!(!phase.role.is_empty());
            assert!(
                !phase.required_fields.is_empty(),
                "phase {} has no quality-gate fields",
                phase.number
            );
        }
    }

    #[test]
    fn test_get_phase() {
        let phases = default_phases();
        assert_eq!(get_phase(&phases, 4).unwrap().role, "coder");
        assert!(get_phase(&phases, 99).is_none());
    }

    #[test]
    fn test_last_phase() {
        assert_eq!(last_phase(&default_phases()), 6);
        assert_eq!(last_phase(&[]), 0);
    }

    #[test]
    fn test_phase_spec_serialization() {
        let phase = PhaseSpec::new(1, "Requirements gathering", "analyst", &["summary"]);
        let json = serde_json::to_string(&phase).unwrap();
        let parsed: PhaseSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(phase, parsed);
    }
}
