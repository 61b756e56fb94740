//! What a cell run hands back to callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::protocol::{AgentResult, AgentStatus, Artifact, RichOutput};

use super::values::{snapshot_from_json, Value};

/// Outcome of a run as far as the caller is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    #[default]
    Success,
    Error,
    InputRequired,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Error => "error",
            RunOutcome::InputRequired => "input_required",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub outputs: Vec<RichOutput>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: RunOutcome,
    #[serde(default)]
    pub command_timed_out: bool,
}

impl ExecutionResult {
    /// A run that never reached the kernel.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            status: RunOutcome::Error,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunOutcome::Success
    }

    pub fn needs_input(&self) -> bool {
        self.status == RunOutcome::InputRequired
    }

    /// Whether a shell command inside the cell hit its timeout, as the
    /// kernel reported it.
    pub fn command_timed_out(&self) -> bool {
        self.command_timed_out
    }
}

impl From<AgentResult> for ExecutionResult {
    fn from(result: AgentResult) -> Self {
        let status = match result.status {
            AgentStatus::InputRequired => RunOutcome::InputRequired,
            AgentStatus::Error => RunOutcome::Error,
            // A kernel that answers `running` has not settled; treat as failed.
            AgentStatus::Running => RunOutcome::Error,
            AgentStatus::Success if result.error.is_some() => RunOutcome::Error,
            AgentStatus::Success => RunOutcome::Success,
        };
        Self {
            stdout: result.stdout,
            stderr: result.stderr,
            error: result.error,
            variables: snapshot_from_json(result.variables),
            outputs: result.outputs,
            artifacts: result.artifacts,
            prompt: result.prompt,
            run_id: result.run_id,
            status,
            command_timed_out: result.command_timed_out,
        }
    }
}
