//! Session ids for notebook-backed sessions.

pub const NOTEBOOK_SESSION_PREFIX: &str = "notebook:";

pub fn notebook_session_id(notebook_id: u64) -> String {
    format!("{}{}", NOTEBOOK_SESSION_PREFIX, notebook_id)
}

/// Inverse of [`notebook_session_id`]; `None` for any other id shape.
pub fn parse_notebook_session_id(session_id: &str) -> Option<u64> {
    let suffix = session_id.strip_prefix(NOTEBOOK_SESSION_PREFIX)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
