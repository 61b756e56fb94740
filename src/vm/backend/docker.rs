//! Docker backend
//!
//! Each VM is a long-lived container idling on `sleep infinity` with the VM
//! directory and the workspace bind-mounted in. The Python agent runs
//! detached inside it and talks to the host through files:
//!
//! ```text
//!   host                                   container
//!   ────                                   ─────────
//!   <root>/<vm-id>/            ──bind──▶   /vm
//!   <root>/<vm-id>/workspace/  ──bind──▶   /workspace
//!       .vm_agent/commands/    ◀─watch──   agent_server.py --watch
//!       .vm_agent/results/     ◀─write──
//!       .vm_agent/status.json  ◀─ready──   {"state": "ready", "nonce": ..., "pid": ...}
//! ```
//!
//! Every agent launch gets a fresh nonce, recorded as `agent_nonce` in the
//! VM's backend data. A status file only counts once it echoes that nonce,
//! and a reused VM whose agent process is gone gets a new agent.
//!
//! Every argument handed to the docker CLI is checked for shell
//! metacharacters; finding one is a programming error and panics.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::kernel::{self, KernelHello, AGENT_DIR};
use crate::error::{Result, SandboxError};
use crate::metrics::VM_CREATE_DURATION;
use crate::vm::models::{NetOutbound, VirtualMachine, VirtualMachineState, VmBackendKind, VmSpec};

use super::{StoredVm, VmBackend, VmStore};

/// Characters that must never reach the docker CLI.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '$', '>', '<', '`'];

/// Upper bound on processes inside one container.
const PIDS_LIMIT: u32 = 512;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20);

const AGENT_PATH: &str = "/workspace/.vm_agent/agent_server.py";

pub struct DockerVmBackend {
    store: VmStore,
    docker_bin: PathBuf,
    ready_timeout: Duration,
    /// Host path of the store root as the docker daemon sees it
    host_root: Option<String>,
}

impl DockerVmBackend {
    pub fn new(root: impl Into<PathBuf>, docker_bin: impl Into<PathBuf>) -> Self {
        Self {
            store: VmStore::new(root),
            docker_bin: docker_bin.into(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            host_root: None,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_host_root(mut self, host_root: Option<String>) -> Self {
        self.host_root = host_root;
        self
    }

    /// Bind-mount source for a path under the store root.
    async fn bind_source(&self, path: &Path) -> String {
        let path = tokio::fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf());
        let root = tokio::fs::canonicalize(self.store.root())
            .await
            .unwrap_or_else(|_| self.store.root().to_path_buf());
        map_to_host(&path, &root, self.host_root.as_deref())
    }

    /// Run one docker CLI command and return its stdout.
    async fn docker(&self, args: &[String]) -> Result<String> {
        assert_safe_args(args);
        debug!(args = ?args, "docker");

        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::SandboxFailure(format!("failed to run docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::SandboxFailure(format!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `docker rm -f`, logging instead of failing.
    async fn remove_container(&self, name: &str) {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        if let Err(e) = self.docker(&args).await {
            debug!(container = %name, error = %e, "container removal failed (may not exist)");
        }
    }

    /// Everything between "directory exists" and "agent is ready".
    async fn provision(&self, vm_id: &str, workspace: &Path, spec: &VmSpec) -> Result<(KernelHello, String)> {
        let agent_dir = workspace.join(AGENT_DIR);
        for sub in ["commands", "results", "logs"] {
            tokio::fs::create_dir_all(agent_dir.join(sub)).await?;
        }
        tokio::fs::write(agent_dir.join(kernel::AGENT_SCRIPT_NAME), kernel::KERNEL_SOURCE).await?;

        let vm_dir = self.store.vm_dir(vm_id);
        let create_args = container_create_args(
            vm_id,
            &self.bind_source(&vm_dir).await,
            &self.bind_source(workspace).await,
            spec,
        );
        self.docker(&create_args).await?;
        self.docker(&["start".to_string(), vm_id.to_string()]).await?;

        self.start_agent(vm_id, &agent_dir).await
    }

    /// Launch a detached agent and wait until it echoes its nonce.
    async fn start_agent(&self, container: &str, agent_dir: &Path) -> Result<(KernelHello, String)> {
        let status_path = agent_dir.join(kernel::STATUS_FILE);
        match tokio::fs::remove_file(&status_path).await {
            Ok(()) => debug!(container = %container, "removed status of a previous agent"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let exec_args: Vec<String> = [
            "exec", "-d", container, "python3", AGENT_PATH, "--watch", "/workspace", "--nonce", nonce.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.docker(&exec_args).await?;

        let hello = wait_for_agent_ready(&status_path, &nonce, self.ready_timeout).await?;
        Ok((hello, nonce))
    }

    /// Whether the agent recorded for `vm` still runs in its container.
    async fn agent_alive(&self, vm: &VirtualMachine, container: &str) -> bool {
        let status_path = vm.workspace_path.join(AGENT_DIR).join(kernel::STATUS_FILE);
        let Ok(text) = tokio::fs::read_to_string(&status_path).await else {
            return false;
        };
        let Ok(hello) = serde_json::from_str::<KernelHello>(&text) else {
            return false;
        };
        if !hello.is_ready() || hello.nonce.as_deref() != vm.backend_str("agent_nonce") {
            return false;
        }
        let Some(pid) = hello.pid else {
            return false;
        };
        let args = vec![
            "exec".to_string(),
            container.to_string(),
            "test".to_string(),
            "-d".to_string(),
            format!("/proc/{}", pid),
        ];
        self.docker(&args).await.is_ok()
    }

    /// Give a reused VM a running agent, restarting it when needed.
    async fn revive(&self, mut vm: VirtualMachine) -> Result<VirtualMachine> {
        let container = vm.backend_str("container_name").unwrap_or(vm.vm_id.as_str()).to_string();
        if self.agent_alive(&vm, &container).await {
            return Ok(vm);
        }
        warn!(vm_id = %vm.vm_id, "agent of reused VM is gone, restarting it");
        let _ = self.docker(&["start".to_string(), container.clone()]).await;
        let agent_dir = vm.workspace_path.join(AGENT_DIR);
        let (hello, nonce) = self.start_agent(&container, &agent_dir).await?;
        vm.backend_data.insert("agent_nonce".into(), nonce.into());
        vm.backend_data.insert("rich".into(), hello.rich.into());
        vm.updated_at = Utc::now();
        self.store.save(&vm).await?;
        Ok(vm)
    }

    /// Remove whatever a failed create left behind.
    async fn discard(&self, vm_id: &str) {
        self.remove_container(vm_id).await;
        let _ = self.store.remove(vm_id).await;
    }
}

#[async_trait]
impl VmBackend for DockerVmBackend {
    async fn create_vm(
        &self,
        vm_id: &str,
        session_id: &str,
        spec: &VmSpec,
        now: DateTime<Utc>,
    ) -> Result<VirtualMachine> {
        let start = Instant::now();
        let workspace_path = self.store.prepare(vm_id).await?;

        let (spec, hello, nonce) = match self.provision(vm_id, &workspace_path, spec).await {
            Ok((hello, nonce)) => (spec.clone(), hello, nonce),
            Err(e) if spec.gpu => {
                warn!(vm_id = %vm_id, error = %e, "GPU container failed, retrying without GPU");
                self.remove_container(vm_id).await;
                let cpu_spec = VmSpec {
                    gpu: false,
                    ..spec.clone()
                };
                match self.provision(vm_id, &workspace_path, &cpu_spec).await {
                    Ok((hello, nonce)) => (cpu_spec, hello, nonce),
                    Err(e) => {
                        warn!(vm_id = %vm_id, error = %e, "docker VM provisioning failed, cleaning up");
                        self.discard(vm_id).await;
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "docker VM provisioning failed, cleaning up");
                self.discard(vm_id).await;
                return Err(e);
            }
        };

        let mut backend_data = serde_json::Map::new();
        backend_data.insert("container_name".into(), vm_id.into());
        backend_data.insert("agent_path".into(), AGENT_PATH.into());
        backend_data.insert("agent_nonce".into(), nonce.into());
        backend_data.insert("rich".into(), hello.rich.into());

        let vm = VirtualMachine {
            vm_id: vm_id.to_string(),
            session_id: session_id.to_string(),
            state: VirtualMachineState::Running,
            spec: spec.clone(),
            workspace_path,
            created_at: now,
            updated_at: now,
            backend: VmBackendKind::Docker,
            backend_data,
        };

        if let Err(e) = self.store.save(&vm).await {
            self.discard(vm_id).await;
            return Err(e);
        }

        VM_CREATE_DURATION
            .with_label_values(&["docker"])
            .observe(start.elapsed().as_secs_f64());
        info!(
            vm_id = %vm_id,
            session_id = %session_id,
            image = %spec.image,
            gpu = spec.gpu,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "docker VM ready"
        );
        Ok(vm)
    }

    async fn get_vm(&self, vm_id: &str) -> Result<VirtualMachine> {
        match self.store.load(vm_id).await? {
            StoredVm::Present(vm) => match self.revive(vm).await {
                Ok(vm) => Ok(vm),
                Err(e) => {
                    // Without an agent the VM is useless; let the caller provision a new one.
                    warn!(vm_id = %vm_id, error = %e, "could not restart agent, discarding VM");
                    self.discard(vm_id).await;
                    Err(SandboxError::NotFound(vm_id.to_string()))
                }
            },
            StoredVm::Missing => Err(SandboxError::NotFound(vm_id.to_string())),
            StoredVm::Residue => {
                // A container may outlive its metadata; the name is the vm id.
                warn!(vm_id = %vm_id, "VM directory without metadata, removing residue");
                self.remove_container(vm_id).await;
                self.store.remove(vm_id).await?;
                Err(SandboxError::NotFound(vm_id.to_string()))
            }
        }
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let container = match self.store.load(vm_id).await? {
            StoredVm::Missing => return Err(SandboxError::NotFound(vm_id.to_string())),
            StoredVm::Residue => vm_id.to_string(),
            StoredVm::Present(vm) => vm
                .backend_str("container_name")
                .unwrap_or(vm_id)
                .to_string(),
        };
        self.remove_container(&container).await;
        self.store.remove(vm_id).await?;
        info!(vm_id = %vm_id, "docker VM deleted");
        Ok(())
    }

    fn kind(&self) -> VmBackendKind {
        VmBackendKind::Docker
    }
}

/// Rewrite a path under `root` onto `host_root`.
///
/// Paths outside `root`, or any path when no host root is set, pass
/// through unchanged.
pub fn map_to_host(path: &Path, root: &Path, host_root: Option<&str>) -> String {
    let unchanged = || path.display().to_string();
    let Some(host_root) = host_root.map(|h| h.trim().trim_end_matches('/')).filter(|h| !h.is_empty()) else {
        return unchanged();
    };
    let Ok(relative) = path.strip_prefix(root) else {
        return unchanged();
    };
    let relative = relative.to_string_lossy().replace('\\', "/");
    if relative.is_empty() {
        host_root.to_string()
    } else {
        format!("{}/{}", host_root, relative)
    }
}

/// Arguments for `docker create`. Mount sources are host paths.
pub fn container_create_args(vm_id: &str, vm_dir: &str, workspace: &str, spec: &VmSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        vm_id.into(),
        "--hostname".into(),
        vm_id.into(),
        "--cpus".into(),
        spec.resources.cpu.to_string(),
        "--memory".into(),
        format!("{}m", spec.resources.ram_mb),
        "--pids-limit".into(),
        PIDS_LIMIT.to_string(),
        "--mount".into(),
        format!("type=bind,source={},target=/vm", vm_dir),
        "--mount".into(),
        format!("type=bind,source={},target=/workspace", workspace),
        "--workdir".into(),
        "/workspace".into(),
    ];
    if spec.gpu {
        args.push("--gpus".into());
        args.push("all".into());
    }
    if spec.network.outbound == NetOutbound::Deny {
        args.push("--network".into());
        args.push("none".into());
    }
    args.push(spec.image.clone());
    args.push("sleep".into());
    args.push("infinity".into());
    args
}

/// Panic if any argument carries a shell metacharacter.
pub fn assert_safe_args(args: &[String]) {
    for arg in args {
        assert!(
            !arg.contains(SHELL_METACHARACTERS),
            "refusing to pass shell metacharacter to docker: {:?}",
            arg
        );
    }
}

/// Poll the agent's status file until it reports `ready` with `nonce`.
async fn wait_for_agent_ready(status_path: &Path, nonce: &str, timeout: Duration) -> Result<KernelHello> {
    let start = Instant::now();
    loop {
        if let Ok(text) = tokio::fs::read_to_string(status_path).await {
            if let Ok(hello) = serde_json::from_str::<KernelHello>(&text) {
                if hello.is_ready() && hello.nonce.as_deref() == Some(nonce) {
                    return Ok(hello);
                }
            }
        }
        if start.elapsed() >= timeout {
            return Err(SandboxError::SandboxFailure(format!(
                "agent did not become ready within {:?}",
                timeout
            )));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::models::tests::sample_spec;

    #[test]
    fn test_create_args_deny_network() {
        let spec = sample_spec();
        let args = container_create_args(
            "runner-notebook_1",
            "/srv/vms/runner-notebook_1",
            "/srv/vms/runner-notebook_1/workspace",
            &spec,
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name runner-notebook_1 --hostname runner-notebook_1"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("--memory 4096m"));
        assert!(joined.contains("--pids-limit 512"));
        assert!(joined.contains("type=bind,source=/srv/vms/runner-notebook_1,target=/vm"));
        assert!(joined.contains("type=bind,source=/srv/vms/runner-notebook_1/workspace,target=/workspace"));
        assert!(joined.contains("--network none"));
        assert!(!joined.contains("--gpus"));
        assert!(joined.ends_with("runner-vm:latest sleep infinity"));
        assert_safe_args(&args);
    }

    #[test]
    fn test_create_args_allow_network() {
        let mut spec = sample_spec();
        spec.network.outbound = NetOutbound::Allow;
        let args = container_create_args("runner-a", "/v", "/v/workspace", &spec);
        assert!(!args.iter().any(|a| a == "--network"));
    }

    #[test]
    fn test_create_args_request_gpus() {
        let mut spec = sample_spec();
        spec.gpu = true;
        let args = container_create_args("runner-a", "/v", "/v/workspace", &spec);
        let at = args.iter().position(|a| a == "--gpus").unwrap();
        assert_eq!(args[at + 1], "all");
        // Options stay ahead of the image.
        assert!(at < args.iter().position(|a| a == "runner-vm:latest").unwrap());
    }

    #[test]
    fn test_map_to_host() {
        let root = Path::new("/srv/vms");
        let vm_dir = Path::new("/srv/vms/runner-a/workspace");

        assert_eq!(map_to_host(vm_dir, root, None), "/srv/vms/runner-a/workspace");
        assert_eq!(map_to_host(vm_dir, root, Some("  ")), "/srv/vms/runner-a/workspace");
        assert_eq!(
            map_to_host(vm_dir, root, Some("/data/vms/")),
            "/data/vms/runner-a/workspace"
        );
        assert_eq!(
            map_to_host(vm_dir, root, Some("C:/Users/ada/vms")),
            "C:/Users/ada/vms/runner-a/workspace"
        );
        assert_eq!(map_to_host(root, root, Some("/data/vms")), "/data/vms");
        // Outside the root nothing is rewritten.
        assert_eq!(map_to_host(Path::new("/tmp/x"), root, Some("/data/vms")), "/tmp/x");
    }

    #[test]
    #[should_panic(expected = "shell metacharacter")]
    fn test_metacharacters_panic() {
        assert_safe_args(&["image;rm -rf /".to_string()]);
    }

    #[test]
    #[should_panic(expected = "shell metacharacter")]
    fn test_backtick_panics() {
        assert_safe_args(&["`id`".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let status = tmp.path().join("status.json");
        let err = wait_for_agent_ready(&status, "n1", Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SandboxFailure(_)));
    }

    #[tokio::test]
    async fn test_wait_for_ready_reads_status() {
        let tmp = tempfile::tempdir().unwrap();
        let status = tmp.path().join("status.json");
        std::fs::write(
            &status,
            r#"{"state": "ready", "rich": false, "python": "/usr/bin/python3", "workspace": "/workspace",
                "nonce": "n1", "pid": 7}"#,
        )
        .unwrap();
        let hello = wait_for_agent_ready(&status, "n1", Duration::from_secs(1)).await.unwrap();
        assert!(!hello.rich);
        assert_eq!(hello.workspace, "/workspace");
        assert_eq!(hello.pid, Some(7));
    }

    #[tokio::test]
    async fn test_wait_for_ready_ignores_status_of_previous_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let status = tmp.path().join("status.json");
        std::fs::write(
            &status,
            r#"{"state": "ready", "rich": false, "python": "python3", "workspace": "/workspace", "nonce": "old"}"#,
        )
        .unwrap();
        let err = wait_for_agent_ready(&status, "new", Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SandboxFailure(_)));

        // A status without any nonce is just as stale.
        std::fs::write(
            &status,
            r#"{"state": "ready", "rich": false, "python": "python3", "workspace": "/workspace"}"#,
        )
        .unwrap();
        assert!(wait_for_agent_ready(&status, "new", Duration::from_millis(250)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_docker_leaves_no_residue() {
        let tmp = tempfile::tempdir().unwrap();
        // `false` exits non-zero for every invocation.
        let backend = DockerVmBackend::new(tmp.path(), "false");
        let err = backend
            .create_vm("runner-x", "x", &sample_spec(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SandboxFailure(_)));
        assert!(!tmp.path().join("runner-x").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gpu_create_falls_back_to_cpu() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("docker.log");
        let fake = tmp.path().join("fake-docker");
        // Records every call and rejects GPU containers. The agent never
        // starts, so both attempts end in the ready timeout or the refusal.
        std::fs::write(
            &fake,
            format!(
                "#!/bin/sh\necho \"$*\" >> {}\ncase \"$*\" in\n  *--gpus*) exit 1 ;;\nesac\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = tmp.path().join("vms");
        let backend = DockerVmBackend::new(&root, &fake).with_ready_timeout(Duration::from_millis(200));
        let mut spec = sample_spec();
        spec.gpu = true;
        assert!(backend.create_vm("runner-g", "g", &spec, Utc::now()).await.is_err());

        let calls = std::fs::read_to_string(&log).unwrap();
        let creates: Vec<&str> = calls.lines().filter(|l| l.starts_with("create ")).collect();
        assert_eq!(creates.len(), 2);
        assert!(creates[0].contains("--gpus all"));
        assert!(!creates[1].contains("--gpus"));
        // The CPU attempt launched an agent with a nonce.
        assert!(calls.lines().any(|l| l.starts_with("exec -d runner-g python3") && l.contains("--nonce ")));
        assert!(!root.join("runner-g").exists());
    }
}
