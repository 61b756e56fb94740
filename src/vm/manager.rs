//! VM Manager - binds sessions to VMs
//!
//! The VmManager is responsible for:
//! - Deriving the VM id from the session id (`runner-<sanitized>`)
//! - Reusing a session's VM or provisioning one from the default spec
//! - Tearing a session's VM down on destroy
//!
//! A process-wide instance is built lazily from the environment; tests
//! swap configurations with `reset_vm_manager`.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use lazy_static::lazy_static;
use tracing::{debug, info, warn};

use super::backend::{DockerVmBackend, LocalVmBackend, VmBackend};
use super::config::{docker_binary, VmConfig};
use super::models::{NetOutbound, VirtualMachine, VmBackendKind, VmSpec};
use crate::error::{Result, SandboxError};

const VM_ID_PREFIX: &str = "runner-";

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic VM id for a session.
pub fn vm_id_for(session_id: &str) -> Result<String> {
    let sanitized = sanitize(session_id);
    if sanitized.is_empty() {
        return Err(SandboxError::PreconditionViolation(
            "session id must not be empty".to_string(),
        ));
    }
    Ok(format!("{}{}", VM_ID_PREFIX, sanitized))
}

/// Per-session deviations from the configured default spec.
#[derive(Debug, Clone, Default)]
pub struct VmSpecOverrides {
    pub image: Option<String>,
    pub cpu: Option<u32>,
    pub ram_mb: Option<u64>,
    pub disk_gb: Option<u64>,
    pub ttl_sec: Option<u64>,
    pub net_outbound: Option<NetOutbound>,
    pub net_allowlist: Option<Vec<String>>,
    pub gpu: Option<bool>,
}

impl VmSpecOverrides {
    pub fn apply(&self, mut spec: VmSpec) -> VmSpec {
        if let Some(image) = &self.image {
            spec.image = image.clone();
        }
        if let Some(cpu) = self.cpu {
            spec.resources.cpu = cpu;
        }
        if let Some(ram_mb) = self.ram_mb {
            spec.resources.ram_mb = ram_mb;
        }
        if let Some(disk_gb) = self.disk_gb {
            spec.resources.disk_gb = disk_gb;
        }
        if let Some(ttl_sec) = self.ttl_sec {
            spec.ttl_sec = ttl_sec;
        }
        if let Some(outbound) = self.net_outbound {
            spec.network.outbound = outbound;
        }
        if let Some(allowlist) = &self.net_allowlist {
            spec.network.allowlist = allowlist.clone();
        }
        if let Some(gpu) = self.gpu {
            spec.gpu = gpu;
        }
        spec
    }
}

/// Owns the backend and the default VM spec.
pub struct VmManager {
    config: VmConfig,
    backend: Arc<dyn VmBackend>,
}

impl VmManager {
    /// Build a manager with the backend `config` resolves to.
    pub fn new(config: VmConfig) -> Result<Self> {
        config.ensure_root()?;
        let backend: Arc<dyn VmBackend> = match config.resolved_backend() {
            VmBackendKind::Local => Arc::new(LocalVmBackend::new(&config.root_dir)),
            VmBackendKind::Docker => {
                let docker = docker_binary().ok_or_else(|| {
                    SandboxError::Config("docker backend selected but no docker binary found".to_string())
                })?;
                Arc::new(DockerVmBackend::new(&config.root_dir, docker).with_host_root(config.host_root.clone()))
            }
        };
        info!(
            backend = backend.kind().as_str(),
            root = %config.root_dir.display(),
            "VM manager initialized"
        );
        Ok(Self { config, backend })
    }

    /// Use an explicit backend (tests, embedding).
    pub fn with_backend(config: VmConfig, backend: Arc<dyn VmBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn VmBackend> {
        &self.backend
    }

    /// Return the session's VM, provisioning it if needed.
    pub async fn ensure_session_vm(
        &self,
        session_id: &str,
        overrides: Option<&VmSpecOverrides>,
    ) -> Result<VirtualMachine> {
        let vm_id = vm_id_for(session_id)?;
        match self.backend.get_vm(&vm_id).await {
            Ok(vm) => {
                debug!(vm_id = %vm_id, "reusing existing VM");
                return Ok(vm);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let spec = match overrides {
            Some(overrides) => overrides.apply(self.config.default_spec()),
            None => self.config.default_spec(),
        };
        match self.backend.create_vm(&vm_id, session_id, &spec, Utc::now()).await {
            Ok(vm) => Ok(vm),
            // Lost a race with a concurrent ensure for the same session.
            Err(SandboxError::AlreadyExists(_)) => self.backend.get_vm(&vm_id).await,
            Err(e) => Err(e),
        }
    }

    pub async fn get_session_vm(&self, session_id: &str) -> Result<VirtualMachine> {
        self.backend.get_vm(&vm_id_for(session_id)?).await
    }

    /// Remove the session's VM. Returns whether one existed.
    pub async fn destroy_session_vm(&self, session_id: &str) -> Result<bool> {
        let vm_id = vm_id_for(session_id)?;
        match self.backend.delete_vm(&vm_id).await {
            Ok(()) => {
                info!(vm_id = %vm_id, session_id = %session_id, "session VM destroyed");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "failed to destroy session VM");
                Err(e)
            }
        }
    }
}

lazy_static! {
    static ref VM_MANAGER: Mutex<Option<Arc<VmManager>>> = Mutex::new(None);
}

/// The process-wide manager, built from the environment on first use.
pub fn get_vm_manager() -> Result<Arc<VmManager>> {
    let mut slot = VM_MANAGER
        .lock()
        .map_err(|_| SandboxError::Internal("VM manager lock poisoned".to_string()))?;
    if let Some(manager) = slot.as_ref() {
        return Ok(manager.clone());
    }
    let manager = Arc::new(VmManager::new(VmConfig::from_env()?)?);
    *slot = Some(manager.clone());
    Ok(manager)
}

/// Drop the process-wide manager; the next `get_vm_manager` rebuilds it.
pub fn reset_vm_manager() {
    if let Ok(mut slot) = VM_MANAGER.lock() {
        slot.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::BackendChoice;
    use serial_test::serial;

    fn local_manager(root: &std::path::Path) -> VmManager {
        let config = VmConfig {
            backend: BackendChoice::Local,
            root_dir: root.to_path_buf(),
            ..VmConfig::default()
        };
        VmManager::new(config).unwrap()
    }

    #[test]
    fn test_vm_id_derivation() {
        assert_eq!(vm_id_for("notebook:17").unwrap(), "runner-notebook_17");
        assert_eq!(vm_id_for("a b/c").unwrap(), "runner-a_b_c");
        assert_eq!(vm_id_for("ok-1.2_x").unwrap(), "runner-ok-1.2_x");
        assert!(matches!(vm_id_for(""), Err(SandboxError::PreconditionViolation(_))));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = local_manager(tmp.path());

        let first = manager.ensure_session_vm("notebook:1", None).await.unwrap();
        let second = manager.ensure_session_vm("notebook:1", None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.vm_id, "runner-notebook_1");
        assert!(first.workspace_path.is_dir());
    }

    #[tokio::test]
    async fn test_overrides_apply_on_create() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = local_manager(tmp.path());
        let overrides = VmSpecOverrides {
            cpu: Some(8),
            net_outbound: Some(NetOutbound::Allow),
            net_allowlist: Some(vec!["pypi.org".into()]),
            gpu: Some(true),
            ..VmSpecOverrides::default()
        };

        let vm = manager.ensure_session_vm("s", Some(&overrides)).await.unwrap();
        assert!(vm.spec.gpu);
        assert_eq!(vm.spec.resources.cpu, 8);
        assert_eq!(vm.spec.resources.ram_mb, 4096);
        assert_eq!(vm.spec.network.outbound, NetOutbound::Allow);
        assert_eq!(vm.spec.network.allowlist, vec!["pypi.org".to_string()]);
    }

    #[tokio::test]
    async fn test_destroy_reports_presence() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = local_manager(tmp.path());

        let vm = manager.ensure_session_vm("s", None).await.unwrap();
        assert!(manager.destroy_session_vm("s").await.unwrap());
        assert!(!vm.workspace_path.exists());
        assert!(!manager.destroy_session_vm("s").await.unwrap());
    }

    #[test]
    #[serial]
    fn test_global_manager_reset() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("RUNTIME_VM_BACKEND", "local");
        std::env::set_var("RUNTIME_VM_ROOT", tmp.path());

        reset_vm_manager();
        let a = get_vm_manager().unwrap();
        let b = get_vm_manager().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.config().root_dir, tmp.path());

        reset_vm_manager();
        let c = get_vm_manager().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        reset_vm_manager();
        std::env::remove_var("RUNTIME_VM_BACKEND");
        std::env::remove_var("RUNTIME_VM_ROOT");
    }
}
