//! The seam between the execution engine and whatever hosts the kernel.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::vm::models::{VirtualMachine, VmBackendKind};

use super::config::AgentConfig;
use super::filesystem::FilesystemTransport;
use super::kernel::KernelHello;
use super::local::LocalTransport;
use super::protocol::{AgentCommand, AgentResult};

/// One command in, one result out.
///
/// Implementations serialize commands themselves; callers may share a
/// transport across tasks.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Readiness record received when the transport was established.
    fn hello(&self) -> &KernelHello;

    async fn exec(&self, command: AgentCommand) -> Result<AgentResult>;

    /// Plain-mode run of `code`.
    async fn exec_code(&self, code: &str) -> Result<AgentResult> {
        self.exec(AgentCommand::run(code)).await
    }

    /// Release the kernel. Further `exec` calls may respawn it.
    async fn shutdown(&self);
}

/// Pick the transport matching the backend that provisioned `vm`.
pub async fn transport_for(
    vm: &VirtualMachine,
    env: &BTreeMap<String, String>,
    config: &AgentConfig,
) -> Result<Arc<dyn AgentTransport>> {
    debug!(vm_id = %vm.vm_id, backend = %vm.backend, "connecting agent transport");
    match vm.backend {
        VmBackendKind::Docker => {
            let transport = FilesystemTransport::connect(
                &vm.workspace_path,
                vm.backend_str("agent_nonce"),
                config.clone(),
            )
            .await?;
            Ok(Arc::new(transport))
        }
        VmBackendKind::Local => {
            let transport = LocalTransport::spawn(&vm.workspace_path, env.clone(), config.clone()).await?;
            Ok(Arc::new(transport))
        }
    }
}
