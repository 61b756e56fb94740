//! VM backends
//!
//! A backend provisions the isolated workspace a session runs in. Two
//! implementations share one contract:
//!
//! - [`LocalVmBackend`]: a plain directory; no isolation beyond scoping.
//!   Development and tests.
//! - [`DockerVmBackend`]: the directory plus a long-lived container running
//!   the filesystem agent.
//!
//! Both persist the VM record through [`VmStore`], so metadata handling
//! (stable JSON, stale residue, atomic writes) is identical.

pub mod docker;
pub mod local;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};

use super::models::{VirtualMachine, VmBackendKind, VmSpec};

pub use docker::DockerVmBackend;
pub use local::LocalVmBackend;

const METADATA_FILE: &str = "metadata.json";
const WORKSPACE_DIR: &str = "workspace";

/// Contract every VM backend implements.
///
/// Backends are never retried by the manager: a failed call leaves no
/// residue and the caller recreates the session.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Provision a new VM.
    ///
    /// Fails with `AlreadyExists` if `<root>/<vm_id>` holds valid metadata.
    /// A directory without metadata is stale residue and is replaced.
    async fn create_vm(
        &self,
        vm_id: &str,
        session_id: &str,
        spec: &VmSpec,
        now: DateTime<Utc>,
    ) -> Result<VirtualMachine>;

    /// Load a VM record. Missing directory or missing metadata is `NotFound`
    /// (the latter after cleaning residue).
    async fn get_vm(&self, vm_id: &str) -> Result<VirtualMachine>;

    /// Tear down a VM and remove its directory tree.
    async fn delete_vm(&self, vm_id: &str) -> Result<()>;

    fn kind(&self) -> VmBackendKind;
}

/// On-disk layout shared by the backends.
#[derive(Debug, Clone)]
pub struct VmStore {
    root: PathBuf,
}

/// What a VM directory contains right now.
#[derive(Debug)]
pub enum StoredVm {
    Missing,
    /// Directory exists but metadata is absent or unreadable
    Residue,
    Present(VirtualMachine),
}

impl VmStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.root.join(vm_id)
    }

    pub fn workspace_dir(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join(WORKSPACE_DIR)
    }

    pub fn metadata_path(&self, vm_id: &str) -> PathBuf {
        self.vm_dir(vm_id).join(METADATA_FILE)
    }

    pub async fn load(&self, vm_id: &str) -> Result<StoredVm> {
        let dir = self.vm_dir(vm_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(StoredVm::Missing);
        }
        let text = match tokio::fs::read_to_string(self.metadata_path(vm_id)).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoredVm::Residue),
            Err(e) => return Err(e.into()),
        };
        match VirtualMachine::from_json(&text) {
            Ok(vm) => Ok(StoredVm::Present(vm)),
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "unreadable VM metadata, treating as residue");
                Ok(StoredVm::Residue)
            }
        }
    }

    /// Write metadata via tmp + rename so readers never see a torn file.
    pub async fn save(&self, vm: &VirtualMachine) -> Result<()> {
        let path = self.metadata_path(&vm.vm_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, vm.to_stable_json()?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove the whole `<root>/<vm_id>` tree; absent is fine.
    pub async fn remove(&self, vm_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.vm_dir(vm_id)).await {
            Ok(()) => {
                debug!(vm_id = %vm_id, "removed VM directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Prepare `<root>/<vm_id>/workspace` for a fresh VM.
    ///
    /// Returns the canonical workspace path.
    pub async fn prepare(&self, vm_id: &str) -> Result<PathBuf> {
        match self.load(vm_id).await? {
            StoredVm::Present(_) => return Err(SandboxError::AlreadyExists(vm_id.to_string())),
            StoredVm::Residue => {
                warn!(vm_id = %vm_id, "removing stale VM directory without metadata");
                self.remove(vm_id).await?;
            }
            StoredVm::Missing => {}
        }
        let workspace = self.workspace_dir(vm_id);
        tokio::fs::create_dir_all(&workspace).await?;
        Ok(tokio::fs::canonicalize(&workspace).await?)
    }
}
