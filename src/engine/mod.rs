//! Cell execution on top of an agent transport.
//!
//! - `preprocess` - magic validation, `!` fallback rewriting, rich output cleanup
//! - `values` - bounded variable snapshots
//! - `result` - `ExecutionResult` and run outcomes
//! - `engine` - the per-session `ExecutionEngine`

#[allow(clippy::module_inception)]
pub mod engine;
pub mod preprocess;
pub mod result;
pub mod values;

pub use engine::ExecutionEngine;
pub use result::{ExecutionResult, RunOutcome};
pub use values::Value;
