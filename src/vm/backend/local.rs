//! Local filesystem backend: a VM is just `<root>/<vm-id>/workspace`.

use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{Result, SandboxError};
use crate::metrics::VM_CREATE_DURATION;
use crate::vm::models::{VirtualMachine, VirtualMachineState, VmBackendKind, VmSpec};

use super::{StoredVm, VmBackend, VmStore};

pub struct LocalVmBackend {
    store: VmStore,
}

impl LocalVmBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: VmStore::new(root),
        }
    }

    pub fn store(&self) -> &VmStore {
        &self.store
    }
}

#[async_trait]
impl VmBackend for LocalVmBackend {
    async fn create_vm(
        &self,
        vm_id: &str,
        session_id: &str,
        spec: &VmSpec,
        now: DateTime<Utc>,
    ) -> Result<VirtualMachine> {
        let start = Instant::now();
        let workspace_path = self.store.prepare(vm_id).await?;

        let vm = VirtualMachine {
            vm_id: vm_id.to_string(),
            session_id: session_id.to_string(),
            state: VirtualMachineState::Running,
            spec: spec.clone(),
            workspace_path,
            created_at: now,
            updated_at: now,
            backend: VmBackendKind::Local,
            backend_data: serde_json::Map::new(),
        };

        if let Err(e) = self.store.save(&vm).await {
            let _ = self.store.remove(vm_id).await;
            return Err(e);
        }

        VM_CREATE_DURATION
            .with_label_values(&["local"])
            .observe(start.elapsed().as_secs_f64());
        info!(vm_id = %vm_id, session_id = %session_id, "local VM created");
        Ok(vm)
    }

    async fn get_vm(&self, vm_id: &str) -> Result<VirtualMachine> {
        match self.store.load(vm_id).await? {
            StoredVm::Present(vm) => Ok(vm),
            StoredVm::Missing => Err(SandboxError::NotFound(vm_id.to_string())),
            StoredVm::Residue => {
                self.store.remove(vm_id).await?;
                Err(SandboxError::NotFound(vm_id.to_string()))
            }
        }
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        if matches!(self.store.load(vm_id).await?, StoredVm::Missing) {
            return Err(SandboxError::NotFound(vm_id.to_string()));
        }
        self.store.remove(vm_id).await?;
        info!(vm_id = %vm_id, "local VM deleted");
        Ok(())
    }

    fn kind(&self) -> VmBackendKind {
        VmBackendKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::models::tests::sample_spec;

    #[tokio::test]
    async fn test_create_get_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalVmBackend::new(tmp.path());
        let now = Utc::now();

        let vm = backend
            .create_vm("runner-notebook_1", "notebook:1", &sample_spec(), now)
            .await
            .unwrap();
        assert_eq!(vm.state, VirtualMachineState::Running);
        assert_eq!(vm.backend, VmBackendKind::Local);
        assert!(vm.workspace_path.is_dir());
        assert!(vm.workspace_path.ends_with("runner-notebook_1/workspace"));

        let loaded = backend.get_vm("runner-notebook_1").await.unwrap();
        assert_eq!(loaded, vm);

        backend.delete_vm("runner-notebook_1").await.unwrap();
        assert!(!tmp.path().join("runner-notebook_1").exists());
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalVmBackend::new(tmp.path());
        backend
            .create_vm("runner-x", "x", &sample_spec(), Utc::now())
            .await
            .unwrap();
        let err = backend
            .create_vm("runner-x", "x", &sample_spec(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_missing_vm_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalVmBackend::new(tmp.path());
        assert!(backend.get_vm("runner-nope").await.unwrap_err().is_not_found());
        assert!(backend.delete_vm("runner-nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_cleans_residue() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalVmBackend::new(tmp.path());
        let dir = tmp.path().join("runner-stale").join("workspace");
        std::fs::create_dir_all(&dir).unwrap();

        assert!(backend.get_vm("runner-stale").await.unwrap_err().is_not_found());
        assert!(!tmp.path().join("runner-stale").exists());
    }
}
