//! Atomic file-write helpers
//!
//! Everything the cache persists goes through temp-file + fsync + rename in
//! the destination directory, so readers either see the previous file or the
//! complete new one. A crash mid-write leaves only a `.tmp-` file, which the
//! read path never looks at.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temp path in the same directory as `dest`, so the final rename stays on
/// one filesystem.
fn temp_sibling(dest: &Path) -> PathBuf {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Stream exactly `size` bytes from `body` into `dest` atomically.
pub(crate) async fn write_stream_atomic(
    dest: &Path,
    body: impl AsyncRead + Unpin,
    size: u64,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await.map_err(|source| Error::IoAt {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp = temp_sibling(dest);
    match write_stream(&tmp, body, size).await {
        Ok(()) => fs::rename(&tmp, dest).await.map_err(|source| Error::IoAt {
            path: dest.to_path_buf(),
            source,
        }),
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            Err(err)
        }
    }
}

/// Write a small in-memory payload to `dest` atomically.
pub(crate) async fn write_bytes_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    write_stream_atomic(dest, std::io::Cursor::new(bytes), bytes.len() as u64).await
}

async fn write_stream(path: &Path, body: impl AsyncRead + Unpin, size: u64) -> Result<()> {
    let mut file = fs::File::create(path).await.map_err(|source| Error::IoAt {
        path: path.to_path_buf(),
        source,
    })?;
    let mut limited = body.take(size);
    let copied = tokio::io::copy(&mut limited, &mut file).await?;
    if copied != size {
        return Err(Error::SizeMismatch {
            expected: size,
            actual: copied,
        });
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
