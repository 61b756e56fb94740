//! Streaming runs
//!
//! A streaming run executes in a background task while clients poll its
//! spool files by offset. Lifecycle:
//!
//! ```text
//! start ──▶ running ──▶ finished | error
//!              │  ▲
//!              ▼  │ provide_input
//!        input_required ──abort_input──▶ error
//! ```
//!
//! Runs that finished more than an hour ago are dropped, spools included,
//! on every registry call. A run whose session is reset while it waits for
//! input, or whose session is destroyed, ends in `error`; runs of sessions
//! that no longer exist are dropped after `ORPHAN_RUN_TTL`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::ExecutionResult;
use crate::error::{Result, SandboxError};
use crate::session::SessionRegistry;

use super::spool::{self, SpoolPaths};

/// Error a run gets when its session disappears under it.
pub const SESSION_GONE: &str = "session destroyed";
/// Error a paused run gets when its session is reset.
pub const SESSION_RESET: &str = "session reset";
/// Error a paused run gets once the kernel stopped waiting for its input.
pub const INPUT_ABANDONED: &str = "input timed out";

pub const RUN_TTL: Duration = Duration::from_secs(3600);
/// How long finished runs of a destroyed session stay readable.
pub const ORPHAN_RUN_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Error,
    InputRequired,
}

/// Bookkeeping for one streaming run.
#[derive(Debug, Clone)]
pub struct StreamingRun {
    pub run_id: String,
    pub session_id: String,
    pub cell_id: u64,
    pub notebook_id: u64,
    pub spool: SpoolPaths,
    pub status: RunStatus,
    pub prompt: Option<String>,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StreamingRun {
    pub fn stdout_path(&self) -> &PathBuf {
        &self.spool.stdout
    }

    pub fn stderr_path(&self) -> &PathBuf {
        &self.spool.stderr
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    fn fail(&mut self, message: &str) {
        self.status = RunStatus::Error;
        self.prompt = None;
        self.error = Some(message.to_string());
        self.finished_at = Some(Utc::now());
    }

    fn apply(&mut self, outcome: &Result<ExecutionResult>) {
        match outcome {
            Ok(result) if result.needs_input() => {
                self.status = RunStatus::InputRequired;
                self.prompt = Some(result.prompt.clone().unwrap_or_default());
                self.result = Some(result.clone());
            }
            Ok(result) => {
                self.status = RunStatus::Finished;
                self.prompt = None;
                self.result = Some(result.clone());
                self.finished_at = Some(Utc::now());
            }
            Err(e) => {
                self.status = RunStatus::Error;
                self.prompt = None;
                self.error = Some(e.to_string());
                self.finished_at = Some(Utc::now());
            }
        }
    }
}

/// Returned by `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub status: RunStatus,
}

/// One poll of a run's state and output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub stdout_offset: u64,
    pub stderr_offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type RunTable = Arc<Mutex<HashMap<String, StreamingRun>>>;

pub struct RunRegistry {
    sessions: Arc<SessionRegistry>,
    runs: RunTable,
    ttl: Duration,
}

impl RunRegistry {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self::with_ttl(sessions, RUN_TTL)
    }

    pub fn with_ttl(sessions: Arc<SessionRegistry>, ttl: Duration) -> Self {
        Self {
            sessions,
            runs: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Start `code` in the background on `session_id`.
    pub async fn start(
        &self,
        session_id: &str,
        cell_id: u64,
        notebook_id: u64,
        code: &str,
    ) -> Result<RunHandle> {
        self.evict_expired().await;
        let session = self
            .sessions
            .get(session_id, false)
            .await
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;

        let run_id = Uuid::new_v4().simple().to_string();
        let spool = spool::create(&session.workdir, &run_id).await?;
        let run = StreamingRun {
            run_id: run_id.clone(),
            session_id: session_id.to_string(),
            cell_id,
            notebook_id,
            spool: spool.clone(),
            status: RunStatus::Running,
            prompt: None,
            result: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.runs.lock().await.insert(run_id.clone(), run);
        info!(run_id = %run_id, session_id = %session_id, cell_id, "streaming run started");

        let runs = self.runs.clone();
        let code = code.to_string();
        let task_run_id = run_id.clone();
        let span = info_span!("streaming_run", run_id = %run_id, session_id = %session_id);
        tokio::spawn(
            async move {
                let outcome = session
                    .engine()
                    .execute_streaming(&code, &task_run_id, spool.target.clone())
                    .await;
                if let Err(e) = &outcome {
                    warn!(error = %e, "streaming run failed");
                }
                record(&runs, &task_run_id, &outcome).await;
            }
            .instrument(span),
        );

        Ok(RunHandle {
            run_id,
            status: RunStatus::Running,
        })
    }

    pub async fn get(&self, run_id: &str) -> Option<StreamingRun> {
        self.evict_expired().await;
        self.runs.lock().await.get(run_id).cloned()
    }

    /// Current state plus the output windows after the given offsets.
    pub async fn get_stream_status(
        &self,
        run_id: &str,
        stdout_offset: i64,
        stderr_offset: i64,
    ) -> Result<StreamStatus> {
        let run = self
            .get(run_id)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("run '{}'", run_id)))?;
        let (stdout, stdout_offset) = spool::read_chunk(&run.spool.stdout, stdout_offset).await;
        let (stderr, stderr_offset) = spool::read_chunk(&run.spool.stderr, stderr_offset).await;
        Ok(StreamStatus {
            status: run.status,
            stdout,
            stderr,
            stdout_offset,
            stderr_offset,
            prompt: run.prompt,
            result: run.result,
            error: run.error,
        })
    }

    /// Whether `run_id` is a streaming run this registry tracks.
    pub async fn contains(&self, run_id: &str) -> bool {
        self.runs.lock().await.contains_key(run_id)
    }

    /// Answer a run waiting in `input_required`.
    pub async fn provide_input(
        &self,
        session_id: &str,
        run_id: &str,
        text: Option<String>,
        stdin_eof: bool,
    ) -> Result<ExecutionResult> {
        self.evict_expired().await;
        self.resume_paused(session_id, run_id).await?;
        let session = self.sessions.require(session_id).await?;

        debug!(run_id = %run_id, stdin_eof, "delivering input");
        let outcome = session.engine().provide_input(run_id, text, stdin_eof).await;
        record(&self.runs, run_id, &outcome).await;
        outcome
    }

    /// Give up on a run waiting for input; it ends in `error`.
    pub async fn abort_input(&self, session_id: &str, run_id: &str) -> Result<()> {
        self.evict_expired().await;
        self.resume_paused(session_id, run_id).await?;
        let session = self.sessions.require(session_id).await?;

        let (error, result) = match session.engine().abort(run_id).await {
            Ok(result) => {
                let message = result.error.clone().unwrap_or_else(|| "input aborted".to_string());
                (message, Some(result))
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "kernel abort failed");
                (format!("input aborted: {}", e), None)
            }
        };
        if let Some(run) = self.runs.lock().await.get_mut(run_id) {
            run.status = RunStatus::Error;
            run.prompt = None;
            run.error = Some(error);
            run.result = result;
            run.finished_at = Some(Utc::now());
        }
        info!(run_id = %run_id, "paused run aborted");
        Ok(())
    }

    /// Check the run waits for input on `session_id` and mark it running.
    async fn resume_paused(&self, session_id: &str, run_id: &str) -> Result<()> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| SandboxError::NotFound(format!("run '{}'", run_id)))?;
        if run.session_id != session_id {
            return Err(SandboxError::PreconditionViolation(format!(
                "run '{}' belongs to another session",
                run_id
            )));
        }
        if run.status != RunStatus::InputRequired {
            return Err(SandboxError::PreconditionViolation(format!(
                "run '{}' is not waiting for input",
                run_id
            )));
        }
        run.status = RunStatus::Running;
        run.prompt = None;
        Ok(())
    }

    /// End every unfinished run of `session_id` with `message`.
    pub async fn fail_session_runs(&self, session_id: &str, message: &str) -> usize {
        self.fail_where(message, |run| run.session_id == session_id && !run.is_terminal())
            .await
    }

    /// End the runs of `session_id` that wait for input with `message`.
    pub async fn fail_paused_runs(&self, session_id: &str, message: &str) -> usize {
        self.fail_where(message, |run| {
            run.session_id == session_id && run.status == RunStatus::InputRequired
        })
        .await
    }

    async fn fail_where<F>(&self, message: &str, pred: F) -> usize
    where
        F: Fn(&StreamingRun) -> bool,
    {
        let mut runs = self.runs.lock().await;
        let mut failed = 0;
        for run in runs.values_mut().filter(|r| pred(r)) {
            run.fail(message);
            info!(run_id = %run.run_id, session_id = %run.session_id, reason = message, "streaming run failed");
            failed += 1;
        }
        failed
    }

    /// Drop runs finished longer than the TTL ago and delete their spools.
    ///
    /// Runs whose session is gone are failed first and dropped once they
    /// have been finished for `ORPHAN_RUN_TTL`. Paused runs the engine no
    /// longer holds fail with `INPUT_ABANDONED`.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        let orphan_cutoff = now - chrono::Duration::from_std(ORPHAN_RUN_TTL).unwrap_or(chrono::Duration::zero());
        let live: HashSet<String> = self.sessions.session_ids().await.into_iter().collect();

        let expired: Vec<StreamingRun> = {
            let mut runs = self.runs.lock().await;
            for run in runs.values_mut() {
                if !live.contains(&run.session_id) && !run.is_terminal() {
                    run.fail(SESSION_GONE);
                    info!(run_id = %run.run_id, session_id = %run.session_id, "streaming run orphaned");
                }
            }
            // Input and abort mark a run running before touching the engine,
            // so under this lock a paused run the engine dropped is really gone.
            for run in runs.values_mut().filter(|r| r.status == RunStatus::InputRequired) {
                let Some(session) = self.sessions.get(&run.session_id, false).await else {
                    continue;
                };
                if session.engine().pending_run().await.as_deref() != Some(run.run_id.as_str()) {
                    run.fail(INPUT_ABANDONED);
                    info!(run_id = %run.run_id, "paused run abandoned by the kernel");
                }
            }
            let ids: Vec<String> = runs
                .values()
                .filter(|r| {
                    let limit = if live.contains(&r.session_id) { cutoff } else { orphan_cutoff };
                    r.finished_at.map_or(false, |t| t < limit)
                })
                .map(|r| r.run_id.clone())
                .collect();
            ids.iter().filter_map(|id| runs.remove(id)).collect()
        };
        for run in &expired {
            spool::remove(&run.spool).await;
            debug!(run_id = %run.run_id, "streaming run evicted");
        }
        expired.len()
    }
}

/// Apply an engine outcome unless the run was already ended elsewhere.
async fn record(runs: &RunTable, run_id: &str, outcome: &Result<ExecutionResult>) {
    if let Some(run) = runs.lock().await.get_mut(run_id) {
        if run.is_terminal() {
            debug!(run_id = %run_id, status = ?run.status, "late outcome ignored");
            return;
        }
        run.apply(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::session::RegistryConfig;
    use crate::vm::{BackendChoice, VmConfig, VmManager};

    fn empty_registry(root: &std::path::Path) -> Arc<SessionRegistry> {
        let config = VmConfig {
            backend: BackendChoice::Local,
            root_dir: root.to_path_buf(),
            ..VmConfig::default()
        };
        let manager = Arc::new(VmManager::new(config).unwrap());
        Arc::new(SessionRegistry::new(manager, AgentConfig::default(), RegistryConfig::default()))
    }

    fn finished_run(workdir: &std::path::Path, run_id: &str, finished_at: DateTime<Utc>) -> StreamingRun {
        StreamingRun {
            run_id: run_id.into(),
            session_id: "s".into(),
            cell_id: 1,
            notebook_id: 1,
            spool: SpoolPaths {
                stdout: workdir.join(format!("{}.stdout", run_id)),
                stderr: workdir.join(format!("{}.stderr", run_id)),
                target: crate::agent::StreamTarget {
                    stdout: String::new(),
                    stderr: String::new(),
                },
            },
            status: RunStatus::Finished,
            prompt: None,
            result: None,
            error: None,
            started_at: finished_at,
            finished_at: Some(finished_at),
        }
    }

    #[tokio::test]
    async fn test_start_unknown_session() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = RunRegistry::new(empty_registry(tmp.path()));
        let err = runs.start("missing", 1, 1, "print(1)").await.unwrap_err();
        assert!(matches!(err, SandboxError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = RunRegistry::new(empty_registry(tmp.path()));
        assert!(runs.get_stream_status("nope", 0, 0).await.unwrap_err().is_not_found());
        assert!(runs.provide_input("s", "nope", None, true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_input_requires_paused_run() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = RunRegistry::new(empty_registry(tmp.path()));
        let run = finished_run(tmp.path(), "r1", Utc::now());
        runs.runs.lock().await.insert("r1".into(), run);

        let err = runs.provide_input("s", "r1", Some("x".into()), false).await.unwrap_err();
        assert!(matches!(err, SandboxError::PreconditionViolation(_)));
        let err = runs.abort_input("s", "r1").await.unwrap_err();
        assert!(matches!(err, SandboxError::PreconditionViolation(_)));
    }

    #[tokio::test]
    async fn test_eviction_removes_old_runs_and_spools() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = RunRegistry::new(empty_registry(tmp.path()));

        let old = finished_run(tmp.path(), "old", Utc::now() - chrono::Duration::seconds(7200));
        let fresh = finished_run(tmp.path(), "fresh", Utc::now());
        std::fs::write(old.stdout_path(), "x").unwrap();
        std::fs::write(old.stderr_path(), "").unwrap();
        {
            let mut table = runs.runs.lock().await;
            table.insert("old".into(), old.clone());
            table.insert("fresh".into(), fresh);
        }

        assert_eq!(runs.evict_expired().await, 1);
        assert!(runs.get("old").await.is_none());
        assert!(runs.get("fresh").await.is_some());
        assert!(!old.stdout_path().exists());
    }

    fn open_run(workdir: &std::path::Path, run_id: &str, session_id: &str, status: RunStatus) -> StreamingRun {
        let mut run = finished_run(workdir, run_id, Utc::now());
        run.session_id = session_id.into();
        run.status = status;
        run.finished_at = None;
        if status == RunStatus::InputRequired {
            run.prompt = Some("> ".into());
        }
        run
    }

    #[tokio::test]
    async fn test_reset_fails_only_paused_runs_of_the_session() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = RunRegistry::new(empty_registry(tmp.path()));
        {
            let mut table = runs.runs.lock().await;
            table.insert("paused".into(), open_run(tmp.path(), "paused", "a", RunStatus::InputRequired));
            table.insert("busy".into(), open_run(tmp.path(), "busy", "a", RunStatus::Running));
            table.insert("other".into(), open_run(tmp.path(), "other", "b", RunStatus::InputRequired));
        }

        assert_eq!(runs.fail_paused_runs("a", SESSION_RESET).await, 1);
        let table = runs.runs.lock().await;
        let paused = &table["paused"];
        assert_eq!(paused.status, RunStatus::Error);
        assert_eq!(paused.error.as_deref(), Some("session reset"));
        assert!(paused.prompt.is_none());
        assert!(paused.finished_at.is_some());
        assert_eq!(table["busy"].status, RunStatus::Running);
        assert_eq!(table["other"].status, RunStatus::InputRequired);
    }

    #[tokio::test]
    async fn test_destroyed_session_run_ignores_late_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = RunRegistry::new(empty_registry(tmp.path()));
        runs.runs
            .lock()
            .await
            .insert("r".into(), open_run(tmp.path(), "r", "a", RunStatus::Running));

        assert_eq!(runs.fail_session_runs("a", SESSION_GONE).await, 1);
        assert_eq!(runs.fail_session_runs("a", SESSION_GONE).await, 0);

        record(&runs.runs, "r", &Ok(ExecutionResult::default())).await;
        let run = runs.runs.lock().await["r"].clone();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("session destroyed"));
        assert!(run.result.is_none());
    }

    #[tokio::test]
    async fn test_runs_of_missing_sessions_fail_then_expire() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = RunRegistry::new(empty_registry(tmp.path()));

        let waiting = open_run(tmp.path(), "waiting", "gone", RunStatus::InputRequired);
        let stale = finished_run(tmp.path(), "stale", Utc::now() - chrono::Duration::seconds(120));
        std::fs::write(stale.stdout_path(), "x").unwrap();
        {
            let mut table = runs.runs.lock().await;
            table.insert("waiting".into(), waiting);
            table.insert("stale".into(), stale.clone());
        }

        assert_eq!(runs.evict_expired().await, 1);
        assert!(!stale.stdout_path().exists());

        let status = runs.get_stream_status("waiting", 0, 0).await.unwrap();
        assert_eq!(status.status, RunStatus::Error);
        assert_eq!(status.error.as_deref(), Some("session destroyed"));
        assert!(status.prompt.is_none());
    }

    #[test]
    fn test_apply_outcomes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = finished_run(tmp.path(), "r", Utc::now());
        run.status = RunStatus::Running;
        run.finished_at = None;

        let paused = ExecutionResult {
            status: crate::engine::RunOutcome::InputRequired,
            prompt: Some("Name: ".into()),
            ..ExecutionResult::default()
        };
        run.apply(&Ok(paused));
        assert_eq!(run.status, RunStatus::InputRequired);
        assert_eq!(run.prompt.as_deref(), Some("Name: "));
        assert!(run.finished_at.is_none());

        run.apply(&Ok(ExecutionResult::default()));
        assert_eq!(run.status, RunStatus::Finished);
        assert!(run.finished_at.is_some());

        run.apply(&Err(SandboxError::TransportTimeout(Duration::from_secs(60))));
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error.unwrap().contains("did not respond"));
    }
}
