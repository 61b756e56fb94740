//! notebook-sandbox - per-session Python execution sandboxes for notebooks
//!
//! Each session owns a VM (a local directory sandbox or a Docker container)
//! whose workspace hosts a long-lived Python kernel. Cells run against the
//! kernel's persistent namespace, either synchronously or as streaming runs
//! whose output is spooled to files and polled by offset.
//!
//! # Modules
//!
//! - `vm` - VM records, backends (local, docker) and the per-session manager
//! - `agent` - the kernel script and the transports that talk to it
//! - `engine` - cell preprocessing, execution and result shaping
//! - `session` - session registry, TTL eviction and workdir file access
//! - `runs` - streaming runs and their stdout/stderr spools
//! - `runtime` - the facade callers use
//! - `metrics` - Prometheus metrics
//! - `logging` - tracing subscriber setup
//!
//! # Quick Start
//!
//! ```ignore
//! use notebook_sandbox::get_runtime;
//!
//! let runtime = get_runtime()?;
//! runtime.create_session("notebook:1").await?;
//! let result = runtime.run_code("notebook:1", "x = 41\nprint(x + 1)").await?;
//! assert_eq!(result.stdout, "42\n");
//! ```

pub mod agent;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod runs;
pub mod runtime;
pub mod session;
pub mod vm;

pub use engine::{ExecutionResult, RunOutcome};
pub use error::{Result, SandboxError};
pub use runs::{RunHandle, RunStatus, StreamStatus};
pub use runtime::{get_runtime, reset_runtime, Runtime, SessionInfo};
pub use vm::{VmConfig, VmManager};
