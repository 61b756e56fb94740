//! Append-only stdout/stderr spool files of a streaming run.
//!
//! The kernel appends while the run executes; readers poll with byte
//! offsets and get at most [`MAX_STREAM_CHUNK_BYTES`] per stream per call.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::agent::protocol::StreamTarget;
use crate::error::Result;
use crate::session::files::STREAMS_PREFIX;

pub const MAX_STREAM_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Same files relative to the workdir, as the kernel addresses them
    pub target: StreamTarget,
}

/// Create empty spool files for `run_id` under `<workdir>/.streams/`.
pub async fn create(workdir: &Path, run_id: &str) -> Result<SpoolPaths> {
    let dir = workdir.join(STREAMS_PREFIX);
    tokio::fs::create_dir_all(&dir).await?;
    let stdout_name = format!("{}.stdout", run_id);
    let stderr_name = format!("{}.stderr", run_id);
    let stdout = dir.join(&stdout_name);
    let stderr = dir.join(&stderr_name);
    tokio::fs::write(&stdout, b"").await?;
    tokio::fs::write(&stderr, b"").await?;
    Ok(SpoolPaths {
        stdout,
        stderr,
        target: StreamTarget {
            stdout: format!("{}/{}", STREAMS_PREFIX, stdout_name),
            stderr: format!("{}/{}", STREAMS_PREFIX, stderr_name),
        },
    })
}

/// Read up to 64 KiB from `offset`.
///
/// Returns the decoded text and the offset to continue from. Negative
/// offsets read from the start; a missing file or an offset at or past EOF
/// yields an empty chunk and the unchanged offset. A multi-byte character
/// cut by the window is left for the next read.
pub async fn read_chunk(path: &Path, offset: i64) -> (String, u64) {
    let offset = offset.max(0) as u64;
    match read_window(path, offset).await {
        Ok(bytes) if !bytes.is_empty() => {
            let keep = complete_prefix_len(&bytes);
            let text = String::from_utf8_lossy(&bytes[..keep]).into_owned();
            (text, offset + keep as u64)
        }
        _ => (String::new(), offset),
    }
}

async fn read_window(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(MAX_STREAM_CHUNK_BYTES);
    file.take(MAX_STREAM_CHUNK_BYTES as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence, but
/// only for a full window; a short read is at EOF and is taken whole.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    if bytes.len() < MAX_STREAM_CHUNK_BYTES {
        return bytes.len();
    }
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

/// Delete both spool files; missing files are ignored.
pub async fn remove(paths: &SpoolPaths) {
    for path in [&paths.stdout, &paths.stderr] {
        let _ = tokio::fs::remove_file(path).await;
    }
}
