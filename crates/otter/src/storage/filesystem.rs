//! Local filesystem backend.
//!
//! Revisions are `(mtime_ns, size)` pairs rendered as opaque tokens; plain
//! mtime equality is too coarse on filesystems with second granularity.
//! Conditional writes hold an advisory lock file across the stat+write
//! window so the revision check is atomic with the write.

use super::{Revision, StatResult, Storage, StorageError};
use crate::fs::check_destination;
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::Metadata;
use std::path::Path;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::debug;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct FilesystemStorage;

fn mtime_secs(meta: &Metadata) -> Option<f64> {
    let modified = meta.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs_f64())
}

fn revision_of(meta: &Metadata) -> Revision {
    let nanos = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    Revision::new(format!("{nanos}-{}", meta.len()))
}

fn stat_sync(location: &str) -> Result<StatResult, StorageError> {
    let path = Path::new(location);
    let meta = std::fs::metadata(path).map_err(|e| StorageError::from_io(location, &e))?;
    Ok(StatResult {
        is_dir: meta.is_dir(),
        is_reg: meta.is_file(),
        size: Some(meta.len()),
        revision: Some(revision_of(&meta)),
        mtime: mtime_secs(&meta),
    })
}

fn current_revision(location: &str) -> Result<Revision, StorageError> {
    let meta =
        std::fs::metadata(location).map_err(|e| StorageError::from_io(location, &e))?;
    Ok(revision_of(&meta))
}

/// Advisory lock guard; releases the lock and removes the lock file on
/// drop.
struct LockGuard {
    file: std::fs::File,
    path: std::path::PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn acquire_lock(target: &Path) -> Result<LockGuard, StorageError> {
    let lock_path = target.with_extension(match target.extension() {
        Some(ext) => format!("{}.lock", ext.to_string_lossy()),
        None => "lock".to_string(),
    });
    let location = lock_path.display().to_string();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StorageError::from_io(&location, &e))?;

    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                return Ok(LockGuard {
                    file,
                    path: lock_path,
                })
            }
            Err(_) if Instant::now() < deadline => tokio::time::sleep(LOCK_POLL).await,
            Err(_) => return Err(StorageError::Timeout(format!("lock on {location}"))),
        }
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn stat(&self, location: &str) -> Result<StatResult, StorageError> {
        stat_sync(location)
    }

    async fn glob(&self, location: &str, pattern: &str) -> Result<Vec<String>, StorageError> {
        let full = format!("{}/{}", location.trim_end_matches('/'), pattern);
        let paths = glob::glob(&full)
            .map_err(|e| StorageError::InvalidArgument(format!("bad glob {full}: {e}")))?;
        let mut matches = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| StorageError::Other(format!("glob {full}: {e}")))?;
            matches.push(path.display().to_string());
        }
        Ok(matches)
    }

    async fn read(&self, location: &str) -> Result<(Vec<u8>, Revision), StorageError> {
        // read-stable-revision: retry until the revision is the same on
        // both sides of the read
        loop {
            let before = stat_sync(location)?;
            let data =
                std::fs::read(location).map_err(|e| StorageError::from_io(location, &e))?;
            let after = stat_sync(location)?;
            if before.revision == after.revision {
                let revision = after
                    .revision
                    .ok_or_else(|| StorageError::Other(format!("no revision for {location}")))?;
                return Ok((data, revision));
            }
            debug!(location, "file modified during read, retrying");
        }
    }

    async fn write(
        &self,
        location: &str,
        data: &[u8],
        expected_revision: Option<&Revision>,
    ) -> Result<Revision, StorageError> {
        let path = Path::new(location);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::from_io(location, &e))?;
            }
        }

        match expected_revision {
            Some(expected) => {
                let _guard = acquire_lock(path).await?;
                let current = stat_sync(location)?;
                if current.revision.as_ref() != Some(expected) {
                    return Err(StorageError::PreconditionFailed(format!(
                        "revision mismatch at {location}: expected {expected}, found {}",
                        current
                            .revision
                            .map_or_else(|| "none".to_string(), |r| r.to_string()),
                    )));
                }
                std::fs::write(path, data).map_err(|e| StorageError::from_io(location, &e))?;
                current_revision(location)
            }
            None => {
                std::fs::write(path, data).map_err(|e| StorageError::from_io(location, &e))?;
                current_revision(location)
            }
        }
    }

    async fn copy_within(&self, src: &str, dst: &str) -> Result<Revision, StorageError> {
        let src_path = Path::new(src);
        let dst_path = Path::new(dst);

        let meta =
            std::fs::metadata(src_path).map_err(|e| StorageError::from_io(src, &e))?;
        if !meta.is_file() {
            return Err(StorageError::InvalidArgument(format!(
                "can only copy regular files: {src}"
            )));
        }

        // copying a file onto itself is a no-op, not a truncation
        if let (Ok(a), Ok(b)) = (src_path.canonicalize(), dst_path.canonicalize()) {
            if a == b {
                debug!(src, "copy to same file skipped");
                return current_revision(src);
            }
        }

        check_destination(dst_path, true)
            .map_err(|e| StorageError::Other(e.to_string()))?;

        // hard link is free when source and destination share a filesystem
        if std::fs::hard_link(src_path, dst_path).is_err() {
            std::fs::copy(src_path, dst_path).map_err(|e| StorageError::from_io(dst, &e))?;
        }

        current_revision(dst)
    }
}
