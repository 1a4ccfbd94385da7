//! High-level handle over a storage location.
//!
//! Resolves a logical location to a canonical absolute URI once, at
//! construction, picks the backend by scheme, and delegates operations to
//! it. The resolution chain:
//!
//! 1. a location that is already absolute (`://`) is used as-is;
//! 2. otherwise, with a release configured and `force_local` off, the
//!    release URI is prepended;
//! 3. otherwise the work path is prepended.
//!
//! Absolute local paths are rejected on the write side: everything local
//! must live under the work path. Read-side handles for external sources
//! accept them.

use super::{backend_for, Revision, StatResult, Storage, StorageError};
use otter_core::Config;
use std::sync::Arc;
use tracing::debug;

pub struct StorageHandle {
    location: String,
    absolute: String,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("location", &self.location)
            .field("absolute", &self.absolute)
            .field("backend", &self.storage.name())
            .finish()
    }
}

impl StorageHandle {
    /// Resolve through the standard chain: absolute as-is, else release,
    /// else work path.
    pub fn new(location: &str, config: &Config) -> Result<Self, StorageError> {
        Self::resolve(location, config, false)
    }

    /// Resolve to the work path even when a release is configured.
    pub fn local(location: &str, config: &Config) -> Result<Self, StorageError> {
        Self::resolve(location, config, true)
    }

    /// Handle for an external source: an absolute URI or an absolute local
    /// path, no config involved.
    pub fn external(location: &str) -> Result<Self, StorageError> {
        if !location.contains("://") && !location.starts_with('/') {
            return Err(StorageError::InvalidArgument(format!(
                "external location must be absolute: {location}"
            )));
        }
        Ok(Self::from_absolute(location, location.to_string()))
    }

    fn resolve(location: &str, config: &Config, force_local: bool) -> Result<Self, StorageError> {
        if location.starts_with('/') {
            return Err(StorageError::InvalidArgument(format!(
                "absolute local paths are not allowed: {location}"
            )));
        }

        if location.contains("://") {
            debug!(location, "location is absolute, using as is");
            return Ok(Self::from_absolute(location, location.to_string()));
        }

        let absolute = match (&config.release_uri, force_local) {
            (Some(release), false) => {
                let resolved = format!("{release}/{location}");
                debug!(location, resolved, "location resolved to release");
                resolved
            }
            _ => {
                let resolved = format!("{}/{location}", config.work_path_str());
                debug!(location, resolved, "location resolved to work path");
                resolved
            }
        };
        Ok(Self::from_absolute(location, absolute))
    }

    fn from_absolute(location: &str, absolute: String) -> Self {
        let storage = backend_for(&absolute);
        Self {
            location: location.to_string(),
            absolute,
            storage,
        }
    }

    /// The canonical absolute URI this handle resolved to.
    pub fn absolute(&self) -> &str {
        &self.absolute
    }

    /// Whether the original location was already absolute.
    pub fn is_absolute(&self) -> bool {
        self.location == self.absolute
    }

    pub fn backend_name(&self) -> &'static str {
        self.storage.name()
    }

    pub async fn stat(&self) -> Result<StatResult, StorageError> {
        self.storage.stat(&self.absolute).await
    }

    /// Whether the resource exists.
    pub async fn exists(&self) -> bool {
        self.stat().await.is_ok()
    }

    pub async fn glob(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.storage.glob(&self.absolute, pattern).await
    }

    pub async fn read(&self) -> Result<(Vec<u8>, Revision), StorageError> {
        self.storage.read(&self.absolute).await
    }

    pub async fn read_text(&self) -> Result<(String, Revision), StorageError> {
        self.storage.read_text(&self.absolute).await
    }

    pub async fn write(
        &self,
        data: &[u8],
        expected_revision: Option<&Revision>,
    ) -> Result<Revision, StorageError> {
        self.storage
            .write(&self.absolute, data, expected_revision)
            .await
    }

    pub async fn write_text(
        &self,
        data: &str,
        expected_revision: Option<&Revision>,
    ) -> Result<Revision, StorageError> {
        self.storage
            .write_text(&self.absolute, data, expected_revision)
            .await
    }

    /// Copy this resource to another handle.
    ///
    /// Same-backend copies go through `copy_within`; when the backend does
    /// not support that, or the handles use different backends, the bytes
    /// are read and written through memory instead.
    pub async fn copy_to(&self, dest: &StorageHandle) -> Result<Revision, StorageError> {
        let stat = self.stat().await?;
        if !stat.is_reg {
            return Err(StorageError::InvalidArgument(format!(
                "only regular files can be copied: {}",
                self.absolute
            )));
        }

        if self.storage.name() == dest.storage.name() {
            match self
                .storage
                .copy_within(&self.absolute, &dest.absolute)
                .await
            {
                Err(StorageError::Unsupported { .. }) => {
                    debug!(
                        src = %self.absolute,
                        dst = %dest.absolute,
                        "copy_within unsupported, falling back to read/write"
                    );
                }
                other => return other,
            }
        }

        let (data, _) = self.read().await?;
        dest.write(&data, None).await
    }
}
