//! Log subscriber setup for the CLI and embedding services.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SandboxError};

/// Filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info,notebook_sandbox=debug";

/// Install the global subscriber.
///
/// Logs go to stderr so that stdout stays free for command output. With
/// `json` set every event is one JSON object per line.
///
/// # Example
/// ```ignore
/// logging::init_logging(false)?;
/// ```
pub fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| SandboxError::Config(format!("log subscriber already installed: {}", e)))?;

    tracing::debug!(json, "logging initialized");
    Ok(())
}
