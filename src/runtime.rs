//! In-process API of the sandbox.
//!
//! `Runtime` wires the session registry, the streaming run table and the
//! workdir file helpers together. Callers (an HTTP layer, the CLI) hold an
//! `Arc<Runtime>`; `get_runtime` hands out a process-wide one built from
//! the environment and `reset_runtime` discards it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent::AgentConfig;
use crate::engine::ExecutionResult;
use crate::error::{Result, SandboxError};
use crate::runs::streaming::{SESSION_GONE, SESSION_RESET};
use crate::runs::{RunHandle, RunRegistry, StreamStatus};
use crate::session::{files, DataFileKind, FileEntry, RegistryConfig, Session, SessionRegistry};
use crate::vm::{get_vm_manager, reset_vm_manager, VirtualMachine, VmConfig, VmManager, VmSpecOverrides};

/// What session lifecycle calls report back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub status: &'static str,
    pub vm: VirtualMachine,
}

pub struct Runtime {
    sessions: Arc<SessionRegistry>,
    runs: Arc<RunRegistry>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build a runtime with its own VM manager.
    pub fn new(vm: VmConfig, agent: AgentConfig, registry: RegistryConfig) -> Result<Self> {
        Ok(Self::with_vm_manager(Arc::new(VmManager::new(vm)?), agent, registry))
    }

    pub fn with_vm_manager(manager: Arc<VmManager>, agent: AgentConfig, registry: RegistryConfig) -> Self {
        let sessions = Arc::new(SessionRegistry::new(manager, agent, registry));
        Self {
            runs: Arc::new(RunRegistry::new(sessions.clone())),
            sessions,
            janitor: Mutex::new(None),
        }
    }

    /// The process-wide VM manager plus agent and registry settings from
    /// the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_vm_manager(
            get_vm_manager()?,
            AgentConfig::from_env()?,
            RegistryConfig::from_env()?,
        ))
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    /// Start the periodic sweep of idle sessions and their runs. Idempotent.
    pub fn start_janitor(&self) {
        let Ok(mut slot) = self.janitor.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let interval = self.sessions.config().janitor_interval;
        debug!(interval_secs = interval.as_secs(), "starting session janitor");
        let sessions = self.sessions.clone();
        let runs = self.runs.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&sessions, &runs, sessions.config().session_ttl_secs).await;
            }
        }));
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn create_session(&self, session_id: &str) -> Result<SessionInfo> {
        self.create_session_with(session_id, None).await
    }

    pub async fn create_session_with(
        &self,
        session_id: &str,
        overrides: Option<&VmSpecOverrides>,
    ) -> Result<SessionInfo> {
        let session = self.sessions.create(session_id, overrides).await?;
        Ok(info(&session, "created"))
    }

    /// Discard the namespace. A streaming run paused for input ends in
    /// `error`, since the kernel aborts it.
    pub async fn reset_session(&self, session_id: &str) -> Result<SessionInfo> {
        let session = self.sessions.reset(session_id).await?;
        self.runs.fail_paused_runs(session_id, SESSION_RESET).await;
        Ok(info(&session, "reset"))
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<bool> {
        self.runs.fail_session_runs(session_id, SESSION_GONE).await;
        self.sessions.destroy(session_id).await
    }

    pub async fn get_session(&self, session_id: &str, touch: bool) -> Option<Arc<Session>> {
        self.sessions.get(session_id, touch).await
    }

    /// Destroy idle sessions and end the streaming runs they still had.
    pub async fn cleanup_expired_sessions(&self, ttl_secs: i64) -> Vec<String> {
        sweep(&self.sessions, &self.runs, ttl_secs).await
    }

    pub async fn seed_data_files(&self, session_id: &str, data: &[(DataFileKind, &Path)]) -> Result<()> {
        let session = self.sessions.require(session_id).await?;
        self.sessions.seed_data_files(&session, data).await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn list_session_files(&self, session_id: &str) -> Result<Vec<FileEntry>> {
        let session = self.sessions.require(session_id).await?;
        files::list_files(&session.workdir)
    }

    pub async fn upload_file(&self, session_id: &str, path: &str, content: &[u8]) -> Result<PathBuf> {
        let session = self.sessions.require(session_id).await?;
        files::upload(&session.workdir, path, content).await
    }

    pub async fn download_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>> {
        let session = self.sessions.require(session_id).await?;
        files::download(&session.workdir, path).await
    }

    pub async fn delete_file(&self, session_id: &str, path: &str) -> Result<()> {
        let session = self.sessions.require(session_id).await?;
        files::delete(&session.workdir, path).await
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────────

    /// Run a cell and wait for it to finish or ask for input.
    pub async fn run_code(&self, session_id: &str, code: &str) -> Result<ExecutionResult> {
        let session = self.sessions.require(session_id).await?;
        session.engine().execute(code).await
    }

    pub async fn start_streaming_run(
        &self,
        session_id: &str,
        cell_id: u64,
        notebook_id: u64,
        code: &str,
    ) -> Result<RunHandle> {
        self.cleanup_expired_sessions(self.sessions.config().session_ttl_secs).await;
        self.runs.start(session_id, cell_id, notebook_id, code).await
    }

    pub async fn get_stream_status(
        &self,
        run_id: &str,
        stdout_offset: i64,
        stderr_offset: i64,
    ) -> Result<StreamStatus> {
        self.runs.get_stream_status(run_id, stdout_offset, stderr_offset).await
    }

    /// Answer `input()` in a paused run, streaming or not.
    pub async fn provide_input(
        &self,
        session_id: &str,
        run_id: &str,
        text: Option<String>,
        stdin_eof: bool,
    ) -> Result<ExecutionResult> {
        if self.runs.contains(run_id).await {
            return self.runs.provide_input(session_id, run_id, text, stdin_eof).await;
        }
        let session = self.paused_session(session_id, run_id).await?;
        session.engine().provide_input(run_id, text, stdin_eof).await
    }

    /// Abort a run waiting for input, streaming or not.
    pub async fn abort_input(&self, session_id: &str, run_id: &str) -> Result<()> {
        if self.runs.contains(run_id).await {
            return self.runs.abort_input(session_id, run_id).await;
        }
        let session = self.paused_session(session_id, run_id).await?;
        session.engine().abort(run_id).await?;
        Ok(())
    }

    /// The session whose synchronous run `run_id` is paused.
    async fn paused_session(&self, session_id: &str, run_id: &str) -> Result<Arc<Session>> {
        let session = self.sessions.require(session_id).await?;
        if session.engine().pending_run().await.as_deref() != Some(run_id) {
            return Err(SandboxError::NotFound(format!("run '{}'", run_id)));
        }
        Ok(session)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.janitor.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

async fn sweep(sessions: &SessionRegistry, runs: &RunRegistry, ttl_secs: i64) -> Vec<String> {
    let expired = sessions.cleanup_expired(ttl_secs).await;
    for session_id in &expired {
        runs.fail_session_runs(session_id, SESSION_GONE).await;
    }
    runs.evict_expired().await;
    expired
}

fn info(session: &Session, status: &'static str) -> SessionInfo {
    SessionInfo {
        session_id: session.id.clone(),
        status,
        vm: session.vm.clone(),
    }
}

lazy_static! {
    static ref RUNTIME: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);
}

/// The process-wide runtime, built from the environment on first use.
///
/// Inside a tokio runtime the session janitor is started as well.
pub fn get_runtime() -> Result<Arc<Runtime>> {
    let mut slot = RUNTIME
        .lock()
        .map_err(|_| SandboxError::Internal("runtime lock poisoned".to_string()))?;
    if let Some(runtime) = slot.as_ref() {
        return Ok(runtime.clone());
    }
    let runtime = Arc::new(Runtime::from_env()?);
    if tokio::runtime::Handle::try_current().is_ok() {
        runtime.start_janitor();
    }
    info!("runtime initialized");
    *slot = Some(runtime.clone());
    Ok(runtime)
}

/// Drop the process-wide runtime and VM manager.
///
/// Live sessions are not destroyed; their VMs stay on disk and are picked
/// up again by the next runtime.
pub fn reset_runtime() {
    if let Ok(mut slot) = RUNTIME.lock() {
        slot.take();
    }
    reset_vm_manager();
}
