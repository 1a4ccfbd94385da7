//! Storage backends.
//!
//! One backend per URI scheme, all behind the same contract: stat, glob,
//! revision-consistent reads, optionally-conditional writes, and efficient
//! same-backend copies. Revisions are opaque version tokens supplied by
//! the backend and compared only for equality.

pub mod filesystem;
pub mod gcs;
pub mod handle;
pub mod http;
pub mod noop;

pub use handle::StorageHandle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("{op} is not supported by {backend}")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Map an io error at a location onto the storage taxonomy.
    pub fn from_io(location: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(location.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(location.to_string()),
            _ => Self::Other(format!("{location}: {err}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Opaque version token for a stored resource. Produced by a backend,
/// compared by equality, never interpreted by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource metadata. At most one of `is_dir`/`is_reg` is set; sizes and
/// timestamps are optional because not every backend reports them.
#[derive(Debug, Clone, PartialEq)]
pub struct StatResult {
    pub is_dir: bool,
    pub is_reg: bool,
    pub size: Option<u64>,
    pub revision: Option<Revision>,
    /// Seconds since the epoch.
    pub mtime: Option<f64>,
}

/// The backend contract.
///
/// `read` implementations must return an internally consistent
/// `(bytes, revision)` pair: read the revision, read the bytes, re-read the
/// revision, and retry from the top if it moved. `write` implementations
/// must check `expected_revision` atomically with the write.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metadata for a resource. Fails with `NotFound` for missing ones.
    async fn stat(&self, location: &str) -> Result<StatResult>;

    /// Locations under `location` matching a shell-style pattern. Empty
    /// when nothing matches.
    async fn glob(&self, location: &str, pattern: &str) -> Result<Vec<String>>;

    /// The resource contents together with the revision they belong to.
    async fn read(&self, location: &str) -> Result<(Vec<u8>, Revision)>;

    /// `read` decoded as UTF-8. Decoding failures surface as storage
    /// errors.
    async fn read_text(&self, location: &str) -> Result<(String, Revision)> {
        let (data, revision) = self.read(location).await?;
        let text = String::from_utf8(data)
            .map_err(|e| StorageError::Other(format!("error decoding {location}: {e}")))?;
        Ok((text, revision))
    }

    /// Write data, optionally failing with `PreconditionFailed` when the
    /// current revision differs from `expected_revision`.
    async fn write(
        &self,
        location: &str,
        data: &[u8],
        expected_revision: Option<&Revision>,
    ) -> Result<Revision>;

    async fn write_text(
        &self,
        location: &str,
        data: &str,
        expected_revision: Option<&Revision>,
    ) -> Result<Revision> {
        self.write(location, data.as_bytes(), expected_revision).await
    }

    /// Efficient copy within the same backend, without a download/upload
    /// round trip.
    async fn copy_within(&self, src: &str, dst: &str) -> Result<Revision>;
}

/// Select the backend for a location by its URI scheme. Unknown schemes
/// get the noop backend, whose every operation fails with `Unsupported`.
pub fn backend_for(location: &str) -> Arc<dyn Storage> {
    static GCS: OnceLock<Arc<dyn Storage>> = OnceLock::new();
    static HTTP: OnceLock<Arc<dyn Storage>> = OnceLock::new();
    static FS: OnceLock<Arc<dyn Storage>> = OnceLock::new();
    static NOOP: OnceLock<Arc<dyn Storage>> = OnceLock::new();

    if location.starts_with("gs://") {
        Arc::clone(GCS.get_or_init(|| Arc::new(gcs::GcsStorage::new())))
    } else if location.starts_with("http://") || location.starts_with("https://") {
        Arc::clone(HTTP.get_or_init(|| Arc::new(http::HttpStorage::new())))
    } else if location.starts_with('/') {
        Arc::clone(FS.get_or_init(|| Arc::new(filesystem::FilesystemStorage)))
    } else {
        Arc::clone(NOOP.get_or_init(|| Arc::new(noop::NoopStorage)))
    }
}
