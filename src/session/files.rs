//! File operations scoped to a session workdir.
//!
//! Every user-supplied path goes through [`resolve_in_workdir`]: relative
//! only, no `..`, and after following symlinks it must still land inside
//! the workdir.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::agent::kernel::AGENT_DIR;
use crate::error::{Result, SandboxError};

/// Directory prefix of run spool files.
pub const STREAMS_PREFIX: &str = ".streams";

/// One file as reported by [`list_files`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the workdir, `/`-separated
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Map `user_path` to an absolute path inside `workdir`.
pub fn resolve_in_workdir(workdir: &Path, user_path: &str) -> Result<PathBuf> {
    let root = std::fs::canonicalize(workdir)?;
    let relative = Path::new(user_path);

    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err(escape(user_path, "'..' is not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(escape(user_path, "absolute paths are not allowed"))
            }
        }
    }

    let candidate = root.join(relative);
    for ancestor in candidate.ancestors() {
        if std::fs::symlink_metadata(ancestor).is_err() {
            continue;
        }
        // Present as an entry but not resolvable: a dangling symlink.
        let resolved = std::fs::canonicalize(ancestor)
            .map_err(|_| escape(user_path, "dangling symlink"))?;
        if !resolved.starts_with(&root) {
            return Err(escape(user_path, "path escapes the workdir"));
        }
        break;
    }
    Ok(candidate)
}

fn escape(user_path: &str, reason: &str) -> SandboxError {
    SandboxError::PreconditionViolation(format!("invalid path '{}': {}", user_path, reason))
}

fn require_file_path(user_path: &str) -> Result<()> {
    if Path::new(user_path).components().all(|c| matches!(c, Component::CurDir)) {
        return Err(escape(user_path, "path must name a file"));
    }
    Ok(())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with(STREAMS_PREFIX) || name == AGENT_DIR
}

/// All regular files under `workdir`, sorted by path, spool and agent
/// control directories excluded.
pub fn list_files(workdir: &Path) -> Result<Vec<FileEntry>> {
    let root = std::fs::canonicalize(workdir)?;
    let mut files = Vec::new();

    let walker = WalkDir::new(&root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_hidden(&e.file_name().to_string_lossy()));
    for entry in walker {
        let entry = entry.map_err(|e| SandboxError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| SandboxError::Io(e.into()))?;
        let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        files.push(FileEntry {
            path,
            size: meta.len(),
            modified,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Write `content` at `user_path`, creating parent directories.
pub async fn upload(workdir: &Path, user_path: &str, content: &[u8]) -> Result<PathBuf> {
    require_file_path(user_path)?;
    let target = resolve_in_workdir(workdir, user_path)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, content).await?;
    debug!(path = %target.display(), bytes = content.len(), "file uploaded");
    Ok(target)
}

pub async fn download(workdir: &Path, user_path: &str) -> Result<Vec<u8>> {
    require_file_path(user_path)?;
    let target = resolve_in_workdir(workdir, user_path)?;
    if !target.is_file() {
        return Err(SandboxError::NotFound(format!("file '{}'", user_path)));
    }
    Ok(tokio::fs::read(&target).await?)
}

/// Remove a single file. Directories are refused.
pub async fn delete(workdir: &Path, user_path: &str) -> Result<()> {
    require_file_path(user_path)?;
    let target = resolve_in_workdir(workdir, user_path)?;
    match tokio::fs::symlink_metadata(&target).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SandboxError::NotFound(format!("file '{}'", user_path)))
        }
        Err(e) => Err(e.into()),
        Ok(meta) if meta.is_dir() => Err(SandboxError::PreconditionViolation(format!(
            "'{}' is a directory",
            user_path
        ))),
        Ok(_) => {
            tokio::fs::remove_file(&target).await?;
            debug!(path = %target.display(), "file deleted");
            Ok(())
        }
    }
}
