//! Filesystem transport for the docker backend.
//!
//! Protocol, all paths under `<workspace>/.vm_agent/`:
//!
//! 1. write `commands/<id>.json.tmp`, rename to `commands/<id>.json`
//! 2. the agent processes commands in name order, one at a time, and
//!    publishes `results/<id>.json` the same way
//! 3. poll for the result every 50 ms; read it, delete it, return it
//! 4. no result within the timeout: withdraw the command if it is still
//!    queued and fail with `TransportTimeout`
//!
//! Results nobody waits for any more (a command that timed out after the
//! agent picked it up) are swept before each new command is published.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::metrics::TRANSPORT_TIMEOUTS;

use super::config::AgentConfig;
use super::kernel::{KernelHello, AGENT_DIR, STATUS_FILE};
use super::protocol::{AgentCommand, AgentResult};
use super::AgentTransport;

pub struct FilesystemTransport {
    commands_dir: PathBuf,
    results_dir: PathBuf,
    hello: KernelHello,
    config: AgentConfig,
    /// Command ids whose results are still awaited
    in_flight: Mutex<HashSet<String>>,
}

impl FilesystemTransport {
    /// Attach to the agent running over `workspace`.
    ///
    /// The agent must already have published its status file. With
    /// `expected_nonce` set, a status file from another agent launch is
    /// rejected.
    pub async fn connect(workspace: &Path, expected_nonce: Option<&str>, config: AgentConfig) -> Result<Self> {
        let agent_dir = workspace.join(AGENT_DIR);
        let status = tokio::fs::read_to_string(agent_dir.join(STATUS_FILE))
            .await
            .map_err(|e| SandboxError::SandboxFailure(format!("agent status unavailable: {}", e)))?;
        let hello: KernelHello = serde_json::from_str(&status)?;
        if !hello.is_ready() {
            return Err(SandboxError::SandboxFailure(format!(
                "agent reports state '{}'",
                hello.state
            )));
        }
        if let Some(expected) = expected_nonce {
            if hello.nonce.as_deref() != Some(expected) {
                return Err(SandboxError::SandboxFailure(
                    "agent status is stale (nonce mismatch)".to_string(),
                ));
            }
        }
        Ok(Self::with_hello(workspace, hello, config))
    }

    pub fn with_hello(workspace: &Path, hello: KernelHello, config: AgentConfig) -> Self {
        let agent_dir = workspace.join(AGENT_DIR);
        Self {
            commands_dir: agent_dir.join("commands"),
            results_dir: agent_dir.join("results"),
            hello,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delete result files no pending `exec` is waiting for.
    async fn sweep_orphaned_results(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.results_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if self.in_flight().contains(id) {
                continue;
            }
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept orphaned agent results");
        }
        Ok(removed)
    }

    async fn publish(&self, id: &str, command: &AgentCommand) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.commands_dir).await?;
        tokio::fs::create_dir_all(&self.results_dir).await?;
        let tmp = self.commands_dir.join(format!("{}.json.tmp", id));
        let path = self.commands_dir.join(format!("{}.json", id));
        tokio::fs::write(&tmp, serde_json::to_vec(command)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}

#[async_trait]
impl AgentTransport for FilesystemTransport {
    fn hello(&self) -> &KernelHello {
        &self.hello
    }

    async fn exec(&self, command: AgentCommand) -> Result<AgentResult> {
        self.sweep_orphaned_results().await?;
        let id = Uuid::new_v4().simple().to_string();
        self.in_flight().insert(id.clone());
        let outcome = self.await_result(&id, &command).await;
        self.in_flight().remove(&id);
        outcome
    }

    async fn shutdown(&self) {}
}

impl FilesystemTransport {
    async fn await_result(&self, id: &str, command: &AgentCommand) -> Result<AgentResult> {
        let command_path = self.publish(id, command).await?;
        let result_path = self.results_dir.join(format!("{}.json", id));
        debug!(command_id = %id, action = command.action(), "command published");

        let deadline = Instant::now() + self.config.timeout;
        loop {
            match tokio::fs::read_to_string(&result_path).await {
                Ok(text) => match serde_json::from_str::<AgentResult>(&text) {
                    Ok(result) => {
                        let _ = tokio::fs::remove_file(&result_path).await;
                        return Ok(result);
                    }
                    // Partially visible file; try again on the next tick.
                    Err(e) => debug!(command_id = %id, error = %e, "result not parseable yet"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                let _ = tokio::fs::remove_file(&command_path).await;
                TRANSPORT_TIMEOUTS.inc();
                warn!(command_id = %id, timeout = ?self.config.timeout, "agent did not answer");
                return Err(SandboxError::TransportTimeout(self.config.timeout));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::AgentStatus;
    use std::time::Duration;

    fn hello() -> KernelHello {
        KernelHello {
            state: "ready".into(),
            rich: false,
            python: "/usr/bin/python3".into(),
            workspace: "/workspace".into(),
            nonce: None,
            pid: None,
        }
    }

    /// Minimal stand-in for the agent: answers the first command it sees.
    async fn fake_agent(workspace: PathBuf, reply: &'static str) {
        let commands = workspace.join(".vm_agent/commands");
        let results = workspace.join(".vm_agent/results");
        loop {
            if let Ok(mut entries) = tokio::fs::read_dir(&commands).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !name.ends_with(".json") {
                        continue;
                    }
                    let body = tokio::fs::read_to_string(entry.path()).await.unwrap();
                    assert!(body.contains("\"action\":\"run\""));
                    let tmp = results.join(format!("{}.tmp", name));
                    tokio::fs::write(&tmp, reply).await.unwrap();
                    tokio::fs::rename(&tmp, results.join(&name)).await.unwrap();
                    tokio::fs::remove_file(entry.path()).await.unwrap();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_exec_reads_and_consumes_result() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = FilesystemTransport::with_hello(tmp.path(), hello(), AgentConfig::default());

        let agent = tokio::spawn(fake_agent(
            tmp.path().to_path_buf(),
            r#"{"stdout": "42\n", "stderr": "", "error": null, "variables": {"x": 42}}"#,
        ));
        let result = transport.exec_code("x = 42\nprint(x)").await.unwrap();
        agent.await.unwrap();

        assert_eq!(result.status, AgentStatus::Success);
        assert_eq!(result.stdout, "42\n");
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join(".vm_agent/results"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_exec_times_out_and_withdraws_command() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            timeout: Duration::from_millis(200),
            ..AgentConfig::default()
        };
        let transport = FilesystemTransport::with_hello(tmp.path(), hello(), config);

        let err = transport.exec_code("print(1)").await.unwrap_err();
        assert!(matches!(err, SandboxError::TransportTimeout(_)));
        let queued: Vec<_> = std::fs::read_dir(tmp.path().join(".vm_agent/commands"))
            .unwrap()
            .collect();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_status() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FilesystemTransport::connect(tmp.path(), None, AgentConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::SandboxFailure(_)));

        std::fs::create_dir_all(tmp.path().join(".vm_agent")).unwrap();
        std::fs::write(
            tmp.path().join(".vm_agent/status.json"),
            r#"{"state": "ready", "rich": true, "python": "python3", "workspace": "/workspace"}"#,
        )
        .unwrap();
        let transport = FilesystemTransport::connect(tmp.path(), None, AgentConfig::default())
            .await
            .unwrap();
        assert!(transport.hello().rich);
    }

    #[tokio::test]
    async fn test_connect_rejects_status_of_another_launch() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".vm_agent")).unwrap();
        std::fs::write(
            tmp.path().join(".vm_agent/status.json"),
            r#"{"state": "ready", "python": "python3", "workspace": "/workspace", "nonce": "old", "pid": 12}"#,
        )
        .unwrap();

        let err = FilesystemTransport::connect(tmp.path(), Some("new"), AgentConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("stale"));

        let transport = FilesystemTransport::connect(tmp.path(), Some("old"), AgentConfig::default())
            .await
            .unwrap();
        assert_eq!(transport.hello().pid, Some(12));
    }

    #[tokio::test]
    async fn test_exec_sweeps_orphaned_results() {
        let tmp = tempfile::tempdir().unwrap();
        let results = tmp.path().join(".vm_agent/results");
        std::fs::create_dir_all(&results).unwrap();
        // Left behind by a command whose caller gave up.
        std::fs::write(results.join("0000dead.json"), r#"{"stdout": "late\n"}"#).unwrap();

        let transport = FilesystemTransport::with_hello(tmp.path(), hello(), AgentConfig::default());
        let agent = tokio::spawn(fake_agent(tmp.path().to_path_buf(), r#"{"stdout": "fresh\n"}"#));
        let result = transport.exec_code("print('fresh')").await.unwrap();
        agent.await.unwrap();

        assert_eq!(result.stdout, "fresh\n");
        assert!(!results.join("0000dead.json").exists());
        assert!(transport.in_flight().is_empty());
    }
}
