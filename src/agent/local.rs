//! Local transport: a kernel child process per session.
//!
//! ```text
//!   LocalTransport ──stdin: {"action": ...}\n──▶ python agent_server.py --stdio
//!                  ◀──stdout: {"status": ...}\n──
//!                          stderr ──▶ .vm_agent/logs/kernel.log
//! ```
//!
//! The kernel runs in its own process group with the workdir as cwd, so
//! shell commands started from a cell die with it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::metrics::TRANSPORT_TIMEOUTS;

use super::config::AgentConfig;
use super::kernel::{self, KernelHello, AGENT_DIR, LOG_DIR};
use super::protocol::{AgentCommand, AgentResult};
use super::AgentTransport;

/// Grace period for a kernel to exit after its stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct KernelProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl KernelProcess {
    async fn spawn(
        workspace: &Path,
        env: &BTreeMap<String, String>,
        config: &AgentConfig,
    ) -> Result<(Self, KernelHello)> {
        let script = kernel::install_script(workspace).await?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(workspace.join(AGENT_DIR).join(LOG_DIR).join("kernel.log"))?;

        let mut child = Command::new(&config.python)
            .arg(&script)
            .arg("--stdio")
            .arg(workspace)
            .current_dir(workspace)
            .envs(env)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::SandboxFailure(format!("failed to start kernel with '{}': {}", config.python, e))
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(SandboxError::Internal("kernel pipes unavailable".into())),
        };
        let mut process = KernelProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        let hello = match timeout(config.ready_timeout, process.stdout.next_line()).await {
            Ok(Ok(Some(line))) => serde_json::from_str::<KernelHello>(&line)?,
            Ok(Ok(None)) => {
                process.kill();
                return Err(SandboxError::SandboxFailure(
                    "kernel exited before becoming ready (see .vm_agent/logs/kernel.log)".into(),
                ));
            }
            Ok(Err(e)) => {
                process.kill();
                return Err(e.into());
            }
            Err(_) => {
                process.kill();
                return Err(SandboxError::SandboxFailure(format!(
                    "kernel did not become ready within {:?}",
                    config.ready_timeout
                )));
            }
        };

        info!(
            pid = process.child.id().unwrap_or(0),
            rich = hello.rich,
            workspace = %workspace.display(),
            "kernel started"
        );
        Ok((process, hello))
    }

    /// Send one line, read one line. `None` means the kernel closed stdout.
    async fn request(&mut self, line: &str) -> std::io::Result<Option<String>> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        self.stdout.next_line().await
    }

    /// Kill the whole process group.
    fn kill(&mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, error = %e, "killpg failed");
            }
        }
        let _ = self.child.start_kill();
    }
}

/// Transport backed by a local kernel process.
pub struct LocalTransport {
    workspace: PathBuf,
    env: BTreeMap<String, String>,
    config: AgentConfig,
    hello: KernelHello,
    process: Mutex<Option<KernelProcess>>,
}

impl LocalTransport {
    /// Start the kernel and wait for its hello.
    pub async fn spawn(
        workspace: impl Into<PathBuf>,
        env: BTreeMap<String, String>,
        config: AgentConfig,
    ) -> Result<Self> {
        let workspace = workspace.into();
        let (process, hello) = KernelProcess::spawn(&workspace, &env, &config).await?;
        Ok(Self {
            workspace,
            env,
            config,
            hello,
            process: Mutex::new(Some(process)),
        })
    }
}

#[async_trait]
impl AgentTransport for LocalTransport {
    fn hello(&self) -> &KernelHello {
        &self.hello
    }

    async fn exec(&self, command: AgentCommand) -> Result<AgentResult> {
        let line = serde_json::to_string(&command)?;
        let mut guard = self.process.lock().await;

        if guard.is_none() {
            warn!(workspace = %self.workspace.display(), "kernel not running, respawning (namespace lost)");
            let (process, _) = KernelProcess::spawn(&self.workspace, &self.env, &self.config).await?;
            *guard = Some(process);
        }
        let process = match guard.as_mut() {
            Some(process) => process,
            None => return Err(SandboxError::Internal("kernel slot empty after spawn".into())),
        };

        match timeout(self.config.timeout, process.request(&line)).await {
            Ok(Ok(Some(reply))) => Ok(serde_json::from_str(&reply)?),
            Ok(Ok(None)) => {
                process.kill();
                *guard = None;
                Err(SandboxError::SandboxFailure(
                    "kernel exited unexpectedly (see .vm_agent/logs/kernel.log)".into(),
                ))
            }
            Ok(Err(e)) => {
                process.kill();
                *guard = None;
                Err(e.into())
            }
            Err(_) => {
                warn!(action = command.action(), timeout = ?self.config.timeout, "kernel timed out, killing it");
                TRANSPORT_TIMEOUTS.inc();
                process.kill();
                *guard = None;
                Err(SandboxError::TransportTimeout(self.config.timeout))
            }
        }
    }

    async fn shutdown(&self) {
        let Some(mut process) = self.process.lock().await.take() else {
            return;
        };
        // Closing stdin ends the kernel's read loop.
        let _ = process.stdin.shutdown().await;
        match timeout(SHUTDOWN_GRACE, process.child.wait()).await {
            Ok(_) => debug!(workspace = %self.workspace.display(), "kernel exited"),
            Err(_) => process.kill(),
        }
        // Children the kernel left behind share its process group.
        process.kill();
    }
}
