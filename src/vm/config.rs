//! VM configuration
//!
//! Loaded once at process start. Every field has a default and can be
//! overridden through a `RUNTIME_VM_*` environment variable:
//!
//! | Variable                    | Default             |
//! |-----------------------------|---------------------|
//! | `RUNTIME_VM_BACKEND`        | `auto`              |
//! | `RUNTIME_VM_IMAGE`          | `runner-vm:latest`  |
//! | `RUNTIME_VM_CPU`            | `2`                 |
//! | `RUNTIME_VM_RAM_MB`         | `4096`              |
//! | `RUNTIME_VM_DISK_GB`        | `32`                |
//! | `RUNTIME_VM_TTL_SEC`        | `3600`              |
//! | `RUNTIME_VM_NET_OUTBOUND`   | `deny`              |
//! | `RUNTIME_VM_NET_ALLOWLIST`  | empty (comma list)  |
//! | `RUNTIME_VM_ROOT`           | `$TMPDIR/notebook-sandbox/vms` |
//! | `RUNTIME_VM_HOST_ROOT`      | unset               |
//!
//! `RUNTIME_VM_HOST_ROOT` matters when this process itself runs in a
//! container: it names the host directory mounted at `RUNTIME_VM_ROOT`, and
//! docker bind sources are rewritten onto it.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SandboxError};

use super::models::{NetOutbound, VmBackendKind, VmNetworkPolicy, VmResources, VmSpec};

/// Locations checked for a docker CLI when it is not on `PATH`.
const DOCKER_FALLBACK_PATHS: &[&str] = &["/usr/bin/docker", "/usr/local/bin/docker"];

/// Backend requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    /// Docker when a docker binary is present, local otherwise
    Auto,
    Local,
    Docker,
}

impl FromStr for BackendChoice {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(BackendChoice::Auto),
            "local" => Ok(BackendChoice::Local),
            "docker" => Ok(BackendChoice::Docker),
            other => Err(SandboxError::Config(format!(
                "backend must be one of auto, local, docker; got '{}'",
                other
            ))),
        }
    }
}

/// Process-wide VM settings.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub backend: BackendChoice,
    /// Container image for the docker backend
    pub image: String,
    pub cpu: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub ttl_sec: u64,
    pub net_outbound: NetOutbound,
    pub net_allowlist: Vec<String>,
    /// Directory holding every `<vm-id>/` tree
    pub root_dir: PathBuf,
    /// Where the docker daemon sees `root_dir`, when that differs
    pub host_root: Option<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            image: "runner-vm:latest".to_string(),
            cpu: 2,
            ram_mb: 4096,
            disk_gb: 32,
            ttl_sec: 3600,
            net_outbound: NetOutbound::Deny,
            net_allowlist: Vec::new(),
            root_dir: std::env::temp_dir().join("notebook-sandbox").join("vms"),
            host_root: None,
        }
    }
}

impl VmConfig {
    /// Defaults overlaid with `RUNTIME_VM_*` variables from the process
    /// environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RUNTIME_VM_BACKEND") {
            config.backend = v.parse()?;
        }
        if let Some(v) = get("RUNTIME_VM_IMAGE") {
            config.image = v.trim().to_string();
        }
        if let Some(v) = get("RUNTIME_VM_CPU") {
            config.cpu = parse_number("RUNTIME_VM_CPU", &v)?;
        }
        if let Some(v) = get("RUNTIME_VM_RAM_MB") {
            config.ram_mb = parse_number("RUNTIME_VM_RAM_MB", &v)?;
        }
        if let Some(v) = get("RUNTIME_VM_DISK_GB") {
            config.disk_gb = parse_number("RUNTIME_VM_DISK_GB", &v)?;
        }
        if let Some(v) = get("RUNTIME_VM_TTL_SEC") {
            config.ttl_sec = parse_number("RUNTIME_VM_TTL_SEC", &v)?;
        }
        if let Some(v) = get("RUNTIME_VM_NET_OUTBOUND") {
            config.net_outbound = v.parse()?;
        }
        if let Some(v) = lookup("RUNTIME_VM_NET_ALLOWLIST") {
            config.net_allowlist = split_allowlist(&v);
        }
        if let Some(v) = get("RUNTIME_VM_ROOT") {
            let root = PathBuf::from(v.trim());
            if !root.is_absolute() {
                return Err(SandboxError::Config(format!(
                    "RUNTIME_VM_ROOT must be an absolute path, got '{}'",
                    root.display()
                )));
            }
            config.root_dir = root;
        }
        if let Some(v) = get("RUNTIME_VM_HOST_ROOT") {
            // Kept as text: it may be a Windows path the daemon understands.
            config.host_root = Some(v.trim().replace('\\', "/"));
        }

        Ok(config)
    }

    /// Create the root directory if it is missing.
    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_dir)?;
        Ok(())
    }

    /// Concrete backend after resolving `auto`.
    pub fn resolved_backend(&self) -> VmBackendKind {
        match self.backend {
            BackendChoice::Local => VmBackendKind::Local,
            BackendChoice::Docker => VmBackendKind::Docker,
            BackendChoice::Auto => {
                if docker_binary().is_some() {
                    VmBackendKind::Docker
                } else {
                    VmBackendKind::Local
                }
            }
        }
    }

    /// The `VmSpec` new VMs get when the caller passes no overrides.
    pub fn default_spec(&self) -> VmSpec {
        VmSpec {
            image: self.image.clone(),
            resources: VmResources {
                cpu: self.cpu,
                ram_mb: self.ram_mb,
                disk_gb: self.disk_gb,
            },
            network: VmNetworkPolicy {
                outbound: self.net_outbound,
                allowlist: self.net_allowlist.clone(),
            },
            ttl_sec: self.ttl_sec,
            gpu: false,
        }
    }
}

/// Locate the docker CLI: `PATH` first, then the usual install locations.
pub fn docker_binary() -> Option<PathBuf> {
    if let Ok(path) = which::which("docker") {
        return Some(path);
    }
    DOCKER_FALLBACK_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
}

/// Comma-separated list, trimmed, empty items dropped.
pub fn split_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| SandboxError::Config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
}
