//! Session registry
//!
//! Maps session ids to live sessions. A session bundles its VM, the
//! workdir inside it, and the execution engine talking to the session's
//! kernel. Sessions expire after `ttl` seconds without a touching access;
//! eviction runs on a janitor task and opportunistically on `create`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::{transport_for, AgentConfig};
use crate::engine::ExecutionEngine;
use crate::error::{Result, SandboxError};
use crate::metrics::SESSIONS_ACTIVE;
use crate::vm::{VirtualMachine, VmManager, VmSpecOverrides};

/// Idle time after which a session is evicted.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;
/// How often the janitor sweeps.
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// One live session.
pub struct Session {
    pub id: String,
    pub workdir: PathBuf,
    pub vm: VirtualMachine,
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    updated_at_ms: AtomicI64,
    engine: ExecutionEngine,
}

impl Session {
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        let ms = self.updated_at_ms.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.created_at)
    }

    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&self, now: DateTime<Utc>) {
        self.updated_at_ms.fetch_max(now.timestamp_millis(), Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("workdir", &self.workdir)
            .field("vm_id", &self.vm.vm_id)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at())
            .finish()
    }
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Environment every session's commands run with
    pub session_env: BTreeMap<String, String>,
    /// Idle seconds before eviction
    pub session_ttl_secs: i64,
    pub janitor_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let mut session_env = BTreeMap::new();
        session_env.insert("PIP_ROOT_USER_ACTION".to_string(), "ignore".to_string());
        session_env.insert("MPLBACKEND".to_string(), "Agg".to_string());
        Self {
            session_env,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
        }
    }
}

impl RegistryConfig {
    /// Defaults overlaid with `RUNTIME_SESSION_TTL_SEC`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("RUNTIME_SESSION_TTL_SEC") {
            config.session_ttl_secs = raw.trim().parse().map_err(|_| {
                SandboxError::Config(format!("RUNTIME_SESSION_TTL_SEC must be an integer, got '{}'", raw))
            })?;
        }
        Ok(config)
    }
}

/// Data files a session can be seeded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFileKind {
    Train,
    Test,
    SampleSubmission,
}

impl DataFileKind {
    /// Name the file gets inside the workdir.
    pub fn file_name(&self) -> &'static str {
        match self {
            DataFileKind::Train => "train.csv",
            DataFileKind::Test => "test.csv",
            DataFileKind::SampleSubmission => "sample_submission.csv",
        }
    }
}

pub struct SessionRegistry {
    vm_manager: Arc<VmManager>,
    agent_config: AgentConfig,
    config: RegistryConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Serializes provisioning so concurrent creates of one id share a VM.
    creating: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(vm_manager: Arc<VmManager>, agent_config: AgentConfig, config: RegistryConfig) -> Self {
        Self {
            vm_manager,
            agent_config,
            config,
            sessions: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
        }
    }

    pub fn vm_manager(&self) -> &Arc<VmManager> {
        &self.vm_manager
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the live session for `session_id`, creating it if needed.
    pub async fn create(
        &self,
        session_id: &str,
        overrides: Option<&VmSpecOverrides>,
    ) -> Result<Arc<Session>> {
        self.cleanup_expired(self.config.session_ttl_secs).await;

        if let Some(session) = self.get(session_id, true).await {
            return Ok(session);
        }

        let _creating = self.creating.lock().await;
        if let Some(session) = self.get(session_id, true).await {
            return Ok(session);
        }

        let span = info_span!("session_create", session_id = %session_id);
        let session = self.provision(session_id, overrides).instrument(span).await?;

        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), session.clone());
        SESSIONS_ACTIVE.set(sessions.len() as f64);
        Ok(session)
    }

    async fn provision(
        &self,
        session_id: &str,
        overrides: Option<&VmSpecOverrides>,
    ) -> Result<Arc<Session>> {
        let vm = self.vm_manager.ensure_session_vm(session_id, overrides).await?;
        let env = self.config.session_env.clone();

        let transport = match transport_for(&vm, &env, &self.agent_config).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "agent unavailable, destroying fresh VM");
                if let Err(cleanup) = self.vm_manager.destroy_session_vm(session_id).await {
                    warn!(error = %cleanup, "VM cleanup failed");
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let session = Session {
            id: session_id.to_string(),
            workdir: vm.workspace_path.clone(),
            env: env.clone(),
            created_at: now,
            updated_at_ms: AtomicI64::new(now.timestamp_millis()),
            engine: ExecutionEngine::new(transport, env),
            vm,
        };
        info!(
            vm_id = %session.vm.vm_id,
            workdir = %session.workdir.display(),
            rich = session.engine.transport().hello().rich,
            "session created"
        );
        Ok(Arc::new(session))
    }

    /// Look a session up, refreshing its idle clock when `touch` is set.
    pub async fn get(&self, session_id: &str, touch: bool) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(session_id).cloned()?;
        if touch {
            session.touch();
        }
        Some(session)
    }

    /// Like `get` with `touch`, but a missing session is an error.
    pub async fn require(&self, session_id: &str) -> Result<Arc<Session>> {
        self.get(session_id, true)
            .await
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))
    }

    /// Discard the session's namespace; VM and workdir stay.
    pub async fn reset(&self, session_id: &str) -> Result<Arc<Session>> {
        let session = self.require(session_id).await?;
        session.engine.reset().await?;
        session.touch();
        info!(session_id = %session_id, "session reset");
        Ok(session)
    }

    /// Remove the session and its VM. Returns whether anything existed.
    pub async fn destroy(&self, session_id: &str) -> Result<bool> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(session_id);
            SESSIONS_ACTIVE.set(sessions.len() as f64);
            removed
        };

        if let Some(session) = &removed {
            session.engine.shutdown().await;
        }
        let vm_removed = self.vm_manager.destroy_session_vm(session_id).await?;
        if removed.is_some() || vm_removed {
            info!(session_id = %session_id, "session destroyed");
        }
        Ok(removed.is_some() || vm_removed)
    }

    /// Destroy sessions idle for longer than `ttl_secs` (negative means 0).
    pub async fn cleanup_expired(&self, ttl_secs: i64) -> Vec<String> {
        self.cleanup_expired_at(ttl_secs, Utc::now()).await
    }

    pub async fn cleanup_expired_at(&self, ttl_secs: i64, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - chrono::Duration::seconds(ttl_secs.max(0));
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.updated_at() < cutoff)
            .map(|s| s.id.clone())
            .collect();

        for session_id in &expired {
            debug!(session_id = %session_id, "session expired");
            if let Err(e) = self.destroy(session_id).await {
                warn!(session_id = %session_id, error = %e, "failed to destroy expired session");
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sessions evicted");
        }
        expired
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy data files into the session workdir under their canonical names.
    ///
    /// Failures are logged and skipped.
    pub async fn seed_data_files(&self, session: &Session, files: &[(DataFileKind, &Path)]) {
        for (kind, source) in files {
            let target = session.workdir.join(kind.file_name());
            match tokio::fs::copy(source, &target).await {
                Ok(bytes) => debug!(
                    session_id = %session.id,
                    file = kind.file_name(),
                    bytes,
                    "data file seeded"
                ),
                Err(e) => warn!(
                    session_id = %session.id,
                    source = %source.display(),
                    error = %e,
                    "failed to seed data file"
                ),
            }
        }
    }
}
