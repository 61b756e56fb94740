//! Wire format between the host and the kernel.
//!
//! One JSON object per command and one per result, regardless of the
//! transport carrying them.
//!
//! ```text
//! {"action": "run", "code": "...", "mode": "rich", "run_id": "...",
//!  "stream": {"stdout": ".streams/<run>.stdout", "stderr": "..."}, "env": {...}}
//! {"action": "interactive_input", "run_id": "...", "input": "Ada", "stdin_eof": false}
//! {"action": "abort", "run_id": "..."}
//! {"action": "poll", "run_id": "..."}
//! {"action": "reset"}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How the kernel should evaluate a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// IPython transformer plus per-statement `run_cell`
    Rich,
    /// Plain `exec` of already-transformed source
    Plain,
}

/// Spool files, relative to the workspace, the kernel should mirror
/// stdout/stderr into while the cell runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTarget {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentCommand {
    Run {
        code: String,
        mode: ExecMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream: Option<StreamTarget>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    InteractiveInput {
        run_id: String,
        #[serde(default)]
        input: Option<String>,
        #[serde(default)]
        stdin_eof: bool,
    },
    Abort {
        run_id: String,
    },
    /// Current state of a run without touching it
    Poll {
        run_id: String,
    },
    Reset,
}

impl AgentCommand {
    /// Plain run of `code` with no streaming and no session env.
    pub fn run(code: impl Into<String>) -> Self {
        AgentCommand::Run {
            code: code.into(),
            mode: ExecMode::Plain,
            run_id: None,
            stream: None,
            env: BTreeMap::new(),
        }
    }

    /// Short label for logs and metrics.
    pub fn action(&self) -> &'static str {
        match self {
            AgentCommand::Run { .. } => "run",
            AgentCommand::InteractiveInput { .. } => "interactive_input",
            AgentCommand::Abort { .. } => "abort",
            AgentCommand::Poll { .. } => "poll",
            AgentCommand::Reset => "reset",
        }
    }
}

/// Kernel-side state of a run when it replied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    #[default]
    Success,
    Error,
    InputRequired,
}

/// A rich display item (`display(obj)`, last-expression value, figure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichOutput {
    /// MIME type, e.g. `text/html` or `image/png`
    #[serde(rename = "type")]
    pub mime: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Workspace-relative path when the payload was too large to inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A file a run produced inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: String,
}

/// One result, as written by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: Vec<RichOutput>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Set by the shell helper when a `!` command ran into its timeout
    #[serde(default)]
    pub command_timed_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_shape() {
        let cmd = AgentCommand::Run {
            code: "print(1)".into(),
            mode: ExecMode::Rich,
            run_id: Some("abc".into()),
            stream: Some(StreamTarget {
                stdout: ".streams/abc.stdout".into(),
                stderr: ".streams/abc.stderr".into(),
            }),
            env: BTreeMap::new(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["action"], "run");
        assert_eq!(value["mode"], "rich");
        assert_eq!(value["stream"]["stdout"], ".streams/abc.stdout");
        assert!(value.get("env").is_none());
    }

    #[test]
    fn test_input_and_reset_shape() {
        let cmd = AgentCommand::InteractiveInput {
            run_id: "r1".into(),
            input: Some("Ada".into()),
            stdin_eof: false,
        };
        let text = serde_json::to_string(&cmd).unwrap();
        assert!(text.contains("\"action\":\"interactive_input\""));
        assert_eq!(
            serde_json::to_string(&AgentCommand::Reset).unwrap(),
            r#"{"action":"reset"}"#
        );
    }

    #[test]
    fn test_result_parses_kernel_reply() {
        let reply = r#"{"status": "input_required", "prompt": "Hello: ", "run_id": "r1",
            "stdout": "Hello: ", "stderr": "", "error": null,
            "variables": {"x": 2}, "outputs": [{"type": "text/plain", "data": "3"}], "artifacts": []}"#;
        let result: AgentResult = serde_json::from_str(reply).unwrap();
        assert_eq!(result.status, AgentStatus::InputRequired);
        assert_eq!(result.prompt.as_deref(), Some("Hello: "));
        assert_eq!(result.variables["x"], 2);
        assert_eq!(result.outputs[0].mime, "text/plain");
    }

    #[test]
    fn test_result_tolerates_minimal_reply() {
        let result: AgentResult = serde_json::from_str(r#"{"stdout": "hi\n"}"#).unwrap();
        assert_eq!(result.status, AgentStatus::Success);
        assert!(result.variables.is_empty());
        assert!(!result.command_timed_out);
    }

    #[test]
    fn test_poll_shape_and_timeout_flag() {
        let cmd = AgentCommand::Poll { run_id: "r1".into() };
        assert_eq!(cmd.action(), "poll");
        assert_eq!(serde_json::to_string(&cmd).unwrap(), r#"{"action":"poll","run_id":"r1"}"#);

        let reply: AgentResult =
            serde_json::from_str(r#"{"status": "success", "stderr": "slow\n", "command_timed_out": true}"#).unwrap();
        assert!(reply.command_timed_out);
    }
}
