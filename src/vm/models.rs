//! VM value types
//!
//! Each session owns exactly one `VirtualMachine`: a workspace directory
//! plus, for the docker backend, a long-lived container. The whole record
//! is persisted as `<root>/<vm-id>/metadata.json`.
//!
//! ```text
//!   <root>/
//!   └── runner-notebook_17/
//!       ├── metadata.json      <- VirtualMachine (stable JSON)
//!       └── workspace/         <- session workdir
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Lifecycle state of a VM.
///
/// Only `Running` is expected in steady state; the others exist so that
/// metadata written by a crashed or half-torn-down VM still parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualMachineState {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Which backend wrote (and therefore owns) a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmBackendKind {
    Local,
    Docker,
}

impl VmBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmBackendKind::Local => "local",
            VmBackendKind::Docker => "docker",
        }
    }
}

impl fmt::Display for VmBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound network policy for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetOutbound {
    #[default]
    Deny,
    Allow,
}

impl FromStr for NetOutbound {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(NetOutbound::Deny),
            "allow" => Ok(NetOutbound::Allow),
            other => Err(SandboxError::Config(format!(
                "net_outbound must be 'deny' or 'allow', got '{}'",
                other
            ))),
        }
    }
}

/// CPU, memory and disk allotted to a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResources {
    /// Number of CPU cores
    pub cpu: u32,
    /// Memory limit in megabytes
    pub ram_mb: u64,
    /// Disk quota in gigabytes (advisory; not enforced by either backend)
    pub disk_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VmNetworkPolicy {
    pub outbound: NetOutbound,
    /// Hosts reachable despite `outbound = deny` (recorded, enforcement is
    /// left to the image)
    pub allowlist: Vec<String>,
}

/// Declarative description of the VM a session wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Container image tag (ignored by the local backend)
    pub image: String,
    pub resources: VmResources,
    pub network: VmNetworkPolicy,
    /// Time-to-live in seconds
    pub ttl_sec: u64,
    /// Hand every host GPU to the container (docker only)
    #[serde(default)]
    pub gpu: bool,
}

/// A provisioned VM, exactly as persisted in `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub vm_id: String,
    pub session_id: String,
    pub state: VirtualMachineState,
    pub spec: VmSpec,
    /// Absolute path of the workspace; equals the session workdir
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub backend: VmBackendKind,
    /// Opaque data only the owning backend interprets (container name, ...)
    #[serde(default)]
    pub backend_data: serde_json::Map<String, serde_json::Value>,
}

impl VirtualMachine {
    /// Serialize to the stable on-disk form: sorted keys, two-space
    /// indentation, trailing newline.
    pub fn to_stable_json(&self) -> Result<String> {
        // Going through `Value` sorts object keys (serde_json maps are BTreeMaps).
        let value = serde_json::to_value(self)?;
        let mut text = serde_json::to_string_pretty(&value)?;
        text.push('\n');
        Ok(text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// String entry from `backend_data`, if present.
    pub fn backend_str(&self, key: &str) -> Option<&str> {
        self.backend_data.get(key).and_then(|v| v.as_str())
    }
}
