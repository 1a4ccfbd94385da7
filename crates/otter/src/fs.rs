//! Local filesystem precondition checks.
//!
//! These guard the work directory at startup and destination paths before
//! copies. They create missing directories rather than failing on them.

use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("directory not writable: {0}")]
    NotWritable(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FsError>;

fn io_err(path: &Path, source: std::io::Error) -> FsError {
    FsError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Make sure a directory exists and is writable, creating it if missing.
pub fn check_dir(path: &Path) -> Result<()> {
    if path.is_file() {
        return Err(FsError::NotADirectory(path.display().to_string()));
    }
    if path.is_dir() {
        let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
        if meta.permissions().readonly() {
            return Err(FsError::NotWritable(path.display().to_string()));
        }
    } else {
        debug!(path = %path.display(), "creating directory");
        std::fs::create_dir_all(path).map_err(|e| io_err(path, e))?;
    }
    Ok(())
}

/// Make sure a source file exists and is a regular file.
pub fn check_source(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(FsError::FileNotFound(path.display().to_string()));
    }
    if !path.is_file() {
        return Err(FsError::NotAFile(path.display().to_string()));
    }
    Ok(())
}

/// Make sure a destination path can be written: the parent directory must
/// exist (it is created if missing) and the file must not already exist
/// unless `delete` allows replacing it.
pub fn check_destination(path: &Path, delete: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            check_dir(parent)?;
        }
    }
    if path.is_file() {
        if delete {
            warn!(path = %path.display(), "destination already exists, deleting it");
            std::fs::remove_file(path).map_err(|e| io_err(path, e))?;
        } else {
            return Err(FsError::AlreadyExists(path.display().to_string()));
        }
    }
    Ok(())
}
