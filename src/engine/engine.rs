//! Drives one session's kernel.
//!
//! Every run holds the session lock from the moment it is sent until the
//! kernel reports a terminal state. A run that stops in `input_required`
//! parks its guard in `pending`; `provide_input` or `abort` for that run id
//! release it, so other runs on the session queue behind it. A queued run
//! polls the kernel every `pending_poll`, and once the paused run has ended
//! on its own (stdin timeout) the guard is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::agent::protocol::{AgentCommand, AgentResult, AgentStatus, ExecMode, StreamTarget};
use crate::agent::AgentTransport;
use crate::error::{Result, SandboxError};
use crate::metrics::{RUNS_TOTAL, RUN_DURATION};

use super::preprocess::{classify_rich_output, clean_rich_output, fallback_transform, validate_cell_magics, ShellContext};
use super::result::{ExecutionResult, RunOutcome};

/// How often a run queued behind a paused one checks on it.
pub const DEFAULT_PENDING_POLL: Duration = Duration::from_secs(5);

/// A run paused on `input()`, still owning the session lock.
struct PendingRun {
    run_id: String,
    mode: ExecMode,
    _guard: OwnedMutexGuard<()>,
}

pub struct ExecutionEngine {
    transport: Arc<dyn AgentTransport>,
    env: BTreeMap<String, String>,
    lock: Arc<Mutex<()>>,
    pending: Mutex<Option<PendingRun>>,
    pending_poll: Duration,
}

impl ExecutionEngine {
    pub fn new(transport: Arc<dyn AgentTransport>, env: BTreeMap<String, String>) -> Self {
        Self {
            transport,
            env,
            lock: Arc::new(Mutex::new(())),
            pending: Mutex::new(None),
            pending_poll: DEFAULT_PENDING_POLL,
        }
    }

    pub fn with_pending_poll(mut self, interval: Duration) -> Self {
        self.pending_poll = interval;
        self
    }

    pub fn transport(&self) -> &Arc<dyn AgentTransport> {
        &self.transport
    }

    pub fn mode(&self) -> ExecMode {
        if self.transport.hello().rich {
            ExecMode::Rich
        } else {
            ExecMode::Plain
        }
    }

    /// Run one cell to completion or until it asks for input.
    pub async fn execute(&self, code: &str) -> Result<ExecutionResult> {
        self.run(code, None, None).await
    }

    /// Like `execute`, mirroring output into the given spool files.
    pub async fn execute_streaming(
        &self,
        code: &str,
        run_id: &str,
        stream: StreamTarget,
    ) -> Result<ExecutionResult> {
        self.run(code, Some(run_id.to_string()), Some(stream)).await
    }

    async fn run(
        &self,
        code: &str,
        run_id: Option<String>,
        stream: Option<StreamTarget>,
    ) -> Result<ExecutionResult> {
        if let Err(message) = validate_cell_magics(code) {
            debug!("cell rejected before execution");
            RUNS_TOTAL.with_label_values(&[mode_label(self.mode()), "error"]).inc();
            return Ok(ExecutionResult::rejected(message));
        }

        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let mode = self.mode();
        let code = match mode {
            ExecMode::Rich => code.to_string(),
            ExecMode::Plain => {
                let hello = self.transport.hello();
                fallback_transform(
                    code,
                    &ShellContext {
                        python: &hello.python,
                        workspace: &hello.workspace,
                        env: &self.env,
                    },
                )
            }
        };
        let command = AgentCommand::Run {
            code,
            mode,
            run_id: Some(run_id.clone()),
            stream,
            env: self.env.clone(),
        };

        let span = info_span!("cell_run", run_id = %run_id, mode = mode_label(mode));
        async move {
            let start = Instant::now();
            let guard = self.acquire().await;
            debug!(waited_ms = start.elapsed().as_millis() as u64, "session lock acquired");
            let reply = self.transport.exec(command).await;
            RUN_DURATION.observe(start.elapsed().as_secs_f64());
            self.settle(reply?, run_id, mode, guard).await
        }
        .instrument(span)
        .await
    }

    /// Deliver a line (or EOF) to a run paused on `input()`.
    pub async fn provide_input(
        &self,
        run_id: &str,
        text: Option<String>,
        stdin_eof: bool,
    ) -> Result<ExecutionResult> {
        let pending = self.take_pending(run_id).await?;
        let command = AgentCommand::InteractiveInput {
            run_id: run_id.to_string(),
            input: text,
            stdin_eof,
        };
        let reply = self.transport.exec(command).await;
        self.settle(reply?, pending.run_id, pending.mode, pending._guard).await
    }

    /// Interrupt a paused run; the kernel reports it as an error.
    pub async fn abort(&self, run_id: &str) -> Result<ExecutionResult> {
        let pending = self.take_pending(run_id).await?;
        info!(run_id = %run_id, "aborting paused run");
        let reply = self
            .transport
            .exec(AgentCommand::Abort {
                run_id: run_id.to_string(),
            })
            .await;
        self.settle(reply?, pending.run_id, pending.mode, pending._guard).await
    }

    /// Id of the run currently waiting for input, if any.
    pub async fn pending_run(&self) -> Option<String> {
        self.pending.lock().await.as_ref().map(|p| p.run_id.clone())
    }

    /// Discard the kernel namespace. A paused run is aborted first.
    pub async fn reset(&self) -> Result<()> {
        let paused = self.pending.lock().await.take();
        if let Some(pending) = paused {
            warn!(run_id = %pending.run_id, "reset while a run waits for input, aborting it");
            if let Err(e) = self
                .transport
                .exec(AgentCommand::Abort {
                    run_id: pending.run_id.clone(),
                })
                .await
            {
                warn!(error = %e, "abort before reset failed");
            }
        }

        let _guard = self.lock.lock().await;
        let reply = self.transport.exec(AgentCommand::Reset).await?;
        if let Some(error) = reply.error {
            return Err(SandboxError::SandboxFailure(format!("kernel reset failed: {}", error)));
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.pending.lock().await.take();
        self.transport.shutdown().await;
    }

    /// Wait for the session lock, checking on a paused holder meanwhile.
    async fn acquire(&self) -> OwnedMutexGuard<()> {
        loop {
            match tokio::time::timeout(self.pending_poll, self.lock.clone().lock_owned()).await {
                Ok(guard) => return guard,
                Err(_) => self.release_if_abandoned().await,
            }
        }
    }

    /// Drop the parked guard when the kernel says its run is over.
    ///
    /// The slot stays locked during the poll so input cannot be delivered
    /// concurrently. A run still executing keeps the guard.
    async fn release_if_abandoned(&self) {
        let mut slot = self.pending.lock().await;
        let Some(run_id) = slot.as_ref().map(|p| p.run_id.clone()) else {
            return;
        };
        let command = AgentCommand::Poll { run_id: run_id.clone() };
        match self.transport.exec(command).await {
            Ok(reply) if matches!(reply.status, AgentStatus::InputRequired | AgentStatus::Running) => {}
            Ok(reply) => {
                warn!(
                    run_id = %run_id,
                    status = ?reply.status,
                    "paused run ended without input, releasing session"
                );
                slot.take();
            }
            Err(e) => debug!(run_id = %run_id, error = %e, "poll of paused run failed"),
        }
    }

    async fn take_pending(&self, run_id: &str) -> Result<PendingRun> {
        let mut slot = self.pending.lock().await;
        match slot.take() {
            Some(pending) if pending.run_id == run_id => Ok(pending),
            other => {
                *slot = other;
                Err(SandboxError::PreconditionViolation(format!(
                    "run '{}' is not waiting for input",
                    run_id
                )))
            }
        }
    }

    /// Turn a kernel reply into a result; park the guard if the run paused.
    async fn settle(
        &self,
        reply: AgentResult,
        run_id: String,
        mode: ExecMode,
        guard: OwnedMutexGuard<()>,
    ) -> Result<ExecutionResult> {
        let mut result = ExecutionResult::from(reply);
        if result.run_id.is_none() {
            result.run_id = Some(run_id.clone());
        }
        if mode == ExecMode::Rich {
            let stdout = clean_rich_output(&result.stdout);
            let (stdout, error) = classify_rich_output(stdout, result.error.take());
            result.stdout = stdout;
            result.error = error;
            result.status = match (result.status, &result.error) {
                (RunOutcome::InputRequired, _) => RunOutcome::InputRequired,
                (_, Some(_)) => RunOutcome::Error,
                (_, None) => RunOutcome::Success,
            };
        }

        RUNS_TOTAL
            .with_label_values(&[mode_label(mode), result.status.as_str()])
            .inc();
        debug!(run_id = %run_id, status = result.status.as_str(), "run settled");

        if result.needs_input() {
            *self.pending.lock().await = Some(PendingRun {
                run_id,
                mode,
                _guard: guard,
            });
        }
        Ok(result)
    }
}

fn mode_label(mode: ExecMode) -> &'static str {
    match mode {
        ExecMode::Rich => "rich",
        ExecMode::Plain => "plain",
    }
}
