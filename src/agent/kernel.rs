//! The Python kernel that owns a session's namespace.
//!
//! The same script serves both transports: `--stdio` for a local child
//! process, `--watch` inside a container. It is embedded at compile time
//! and dropped into `<workspace>/.vm_agent/agent_server.py` before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const KERNEL_SOURCE: &str = include_str!("kernel.py");

/// Control directory inside every workspace.
pub const AGENT_DIR: &str = ".vm_agent";
pub const AGENT_SCRIPT_NAME: &str = "agent_server.py";
pub const STATUS_FILE: &str = "status.json";
pub const LOG_DIR: &str = "logs";

/// Readiness record the kernel publishes on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelHello {
    pub state: String,
    /// IPython is importable; cells go through its transformer
    #[serde(default)]
    pub rich: bool,
    /// `sys.executable` of the kernel (used for `pip` rewrites)
    #[serde(default = "default_python")]
    pub python: String,
    /// Kernel-side path of the workspace (its cwd)
    #[serde(default)]
    pub workspace: String,
    /// Echo of `--nonce`; ties the status file to one agent launch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

fn default_python() -> String {
    "python3".to_string()
}

impl KernelHello {
    pub fn is_ready(&self) -> bool {
        self.state == "ready"
    }
}

/// Write the kernel script under `<workspace>/.vm_agent/` and return its path.
pub async fn install_script(workspace: &Path) -> Result<PathBuf> {
    let dir = workspace.join(AGENT_DIR);
    tokio::fs::create_dir_all(dir.join(LOG_DIR)).await?;
    let script = dir.join(AGENT_SCRIPT_NAME);
    tokio::fs::write(&script, KERNEL_SOURCE).await?;
    Ok(script)
}
