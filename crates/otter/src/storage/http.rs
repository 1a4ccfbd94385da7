//! HTTP(S) backend, read-only.
//!
//! The `Last-Modified` header doubles as the revision token. Writes,
//! listings, and server-side copies are unsupported.

use super::{Revision, StatResult, Storage, StorageError};
use async_trait::async_trait;
use std::time::Duration;

const STAT_TIMEOUT: Duration = Duration::from_secs(60);
const READ_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct HttpStorage {
    client: reqwest::Client,
}

impl HttpStorage {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn request_error(location: &str, err: &reqwest::Error) -> StorageError {
    if err.is_timeout() {
        StorageError::Timeout(location.to_string())
    } else if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
        StorageError::NotFound(location.to_string())
    } else {
        StorageError::Other(format!("{location}: {err}"))
    }
}

fn check_status(location: &str, resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound(location.to_string()));
    }
    resp.error_for_status()
        .map_err(|e| request_error(location, &e))
}

/// Epoch seconds from an HTTP date header value.
pub(crate) fn parse_http_date(value: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}

fn last_modified(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

#[async_trait]
impl Storage for HttpStorage {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn stat(&self, location: &str) -> Result<StatResult, StorageError> {
        let resp = self
            .client
            .head(location)
            // identity encoding so Content-Length reflects the real size
            .header(reqwest::header::ACCEPT_ENCODING, "identity")
            .timeout(STAT_TIMEOUT)
            .send()
            .await
            .map_err(|e| request_error(location, &e))?;
        let resp = check_status(location, resp)?;

        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let modified = last_modified(&resp);

        Ok(StatResult {
            is_dir: false,
            is_reg: true,
            size,
            revision: modified.clone().map(Revision::new),
            mtime: modified.as_deref().and_then(parse_http_date),
        })
    }

    async fn glob(&self, _location: &str, _pattern: &str) -> Result<Vec<String>, StorageError> {
        Err(StorageError::Unsupported {
            backend: "http",
            op: "glob",
        })
    }

    async fn read(&self, location: &str) -> Result<(Vec<u8>, Revision), StorageError> {
        let resp = self
            .client
            .get(location)
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| request_error(location, &e))?;
        let resp = check_status(location, resp)?;

        // headers and body come from one response, so the pair is
        // internally consistent
        let revision = Revision::new(last_modified(&resp).unwrap_or_default());
        let data = resp
            .bytes()
            .await
            .map_err(|e| request_error(location, &e))?;
        Ok((data.to_vec(), revision))
    }

    async fn write(
        &self,
        _location: &str,
        _data: &[u8],
        _expected_revision: Option<&Revision>,
    ) -> Result<Revision, StorageError> {
        Err(StorageError::Unsupported {
            backend: "http",
            op: "write",
        })
    }

    async fn copy_within(&self, _src: &str, _dst: &str) -> Result<Revision, StorageError> {
        Err(StorageError::Unsupported {
            backend: "http",
            op: "copy_within",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_glob_and_copy_are_unsupported() {
        let storage = HttpStorage::new();
        assert!(matches!(
            storage.write("https://host/x", b"", None).await,
            Err(StorageError::Unsupported { op: "write", .. })
        ));
        assert!(matches!(
            storage.glob("https://host", "*").await,
            Err(StorageError::Unsupported { op: "glob", .. })
        ));
        assert!(matches!(
            storage.copy_within("https://host/a", "https://host/b").await,
            Err(StorageError::Unsupported { op: "copy_within", .. })
        ));
    }

    #[test]
    fn http_date_parses_to_epoch_seconds() {
        let secs = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(secs, 1_445_412_480.0);
        assert!(parse_http_date("not a date").is_none());
    }
}
