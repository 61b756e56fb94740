//! Agent side of a session: the kernel and the transports that reach it.
//!
//! # Architecture
//!
//! ```text
//! ExecutionEngine ──AgentCommand──▶ AgentTransport
//!                                     ├─ LocalTransport      (stdio, child process)
//!                                     └─ FilesystemTransport (.vm_agent/commands → results)
//!                                              ↓
//!                                     agent_server.py (kernel, owns the namespace)
//! ```

pub mod config;
pub mod filesystem;
pub mod kernel;
pub mod local;
pub mod protocol;
pub mod transport;

pub use config::AgentConfig;
pub use filesystem::FilesystemTransport;
pub use kernel::KernelHello;
pub use local::LocalTransport;
pub use protocol::{AgentCommand, AgentResult, AgentStatus, Artifact, ExecMode, RichOutput, StreamTarget};
pub use transport::{transport_for, AgentTransport};
