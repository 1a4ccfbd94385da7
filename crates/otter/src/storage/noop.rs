//! Sentinel backend for unrecognized URI schemes.

use super::{Revision, StatResult, Storage, StorageError};
use async_trait::async_trait;

const fn unsupported(op: &'static str) -> StorageError {
    StorageError::Unsupported {
        backend: "noop",
        op,
    }
}

#[derive(Debug)]
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn stat(&self, _location: &str) -> Result<StatResult, StorageError> {
        Err(unsupported("stat"))
    }

    async fn glob(&self, _location: &str, _pattern: &str) -> Result<Vec<String>, StorageError> {
        Err(unsupported("glob"))
    }

    async fn read(&self, _location: &str) -> Result<(Vec<u8>, Revision), StorageError> {
        Err(unsupported("read"))
    }

    async fn write(
        &self,
        _location: &str,
        _data: &[u8],
        _expected_revision: Option<&Revision>,
    ) -> Result<Revision, StorageError> {
        Err(unsupported("write"))
    }

    async fn copy_within(&self, _src: &str, _dst: &str) -> Result<Revision, StorageError> {
        Err(unsupported("copy_within"))
    }
}
