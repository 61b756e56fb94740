//! Streaming runs and their spool files.

pub mod spool;
pub mod streaming;

pub use streaming::{RunHandle, RunRegistry, RunStatus, StreamStatus, StreamingRun};
