//! Agent transport settings

use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Timeouts and interpreter choice for agent transports.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Interpreter used to launch the local kernel
    pub python: String,
    /// Hard limit for one command/result exchange
    pub timeout: Duration,
    /// Result polling interval of the filesystem transport
    pub poll_interval: Duration,
    /// How long a freshly spawned kernel may take to say hello
    pub ready_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            ready_timeout: Duration::from_secs(20),
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with `RUNTIME_PYTHON` and `RUNTIME_AGENT_TIMEOUT_SEC`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(python) = std::env::var("RUNTIME_PYTHON") {
            if !python.trim().is_empty() {
                config.python = python.trim().to_string();
            }
        }
        if let Ok(raw) = std::env::var("RUNTIME_AGENT_TIMEOUT_SEC") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                SandboxError::Config(format!("RUNTIME_AGENT_TIMEOUT_SEC must be an integer, got '{}'", raw))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}
