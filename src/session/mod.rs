//! Sessions: the registry, id helpers and workdir-scoped file access.

pub mod files;
pub mod ids;
pub mod registry;

pub use files::{resolve_in_workdir, FileEntry};
pub use ids::{notebook_session_id, parse_notebook_session_id};
pub use registry::{DataFileKind, RegistryConfig, Session, SessionRegistry};
