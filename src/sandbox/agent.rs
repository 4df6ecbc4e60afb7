//! Coding-agent invocation adapter.
//!
//! The agent CLI emits newline-delimited JSON events. This module owns the
//! parsing: structured events where the agent provides them, with free-text
//! accumulation as the explicit best-effort fallback for lines that are not
//! valid JSON. Nothing outside this module scrapes agent output.

use serde::Deserialize;
use serde_json::Value;

use crate::errors::SandboxError;

/// Events from the agent CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },
}

/// A file the agent created, modified, or deleted during an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMutation {
    pub path: String,
    pub kind: MutationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Write,
    Edit,
    Delete,
}

/// Parsed outcome of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Concatenated assistant text, or the terminal result payload when the
    /// agent provided one.
    pub message: String,
    pub file_mutations: Vec<FileMutation>,
    pub is_error: bool,
}

/// Consume the agent's stream output (full stdout of a finished invocation)
/// and fold it into an `AgentResult`.
///
/// Text content accumulates until a terminal `result` event, which replaces
/// the accumulated text when present. `tool_use` events for file tools are
/// translated into `FileMutation` descriptors.
pub fn parse_agent_output(raw: &str) -> Result<AgentResult, SandboxError> {
    let mut accumulated = String::new();
    let mut final_result: Option<String> = None;
    let mut is_error = false;
    let mut mutations: Vec<FileMutation> = Vec::new();
    let mut saw_event = false;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message, .. }) => {
                saw_event = true;
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            accumulated.push_str(&text);
                            accumulated.push('\n');
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            if let Some(mutation) = mutation_from_tool_use(&name, &input) {
                                if !mutations.contains(&mutation) {
                                    mutations.push(mutation);
                                }
                            }
                        }
                    }
                }
            }
            Ok(StreamEvent::Result { result, is_error: err }) => {
                saw_event = true;
                final_result = result;
                is_error = err;
            }
            Ok(StreamEvent::System { .. }) => {
                saw_event = true;
            }
            Err(_) => {
                // Not valid JSON; keep as free text. Flagged best-effort.
                accumulated.push_str(line);
                accumulated.push('\n');
            }
        }
    }

    if !saw_event && accumulated.trim().is_empty() {
        return Err(SandboxError::MalformedAgentOutput(
            "empty agent output".to_string(),
        ));
    }

    Ok(AgentResult {
        message: final_result.unwrap_or(accumulated),
        file_mutations: mutations,
        is_error,
    })
}

fn mutation_from_tool_use(name: &str, input: &Value) -> Option<FileMutation> {
    let path = input.get("file_path").and_then(|v| v.as_str())?;
    let kind = match name {
        "Write" => MutationKind::Write,
        "Edit" => MutationKind::Edit,
        "Delete" => MutationKind::Delete,
        _ => return None,
    };
    Some(FileMutation {
        path: path.to_string(),
        kind,
    })
}

/// Command line that runs the agent against a prompt file in the sandbox.
pub fn agent_command(prompt_path: &str, max_turns: u32) -> String {
    format!(
        "claude -p --output-format stream-json --max-turns {} < {}",
        max_turns, prompt_path
    )
}
