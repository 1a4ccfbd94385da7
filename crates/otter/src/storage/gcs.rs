//! Google Cloud Storage backend over the JSON API.
//!
//! Object generations are the revision tokens; conditional writes go
//! through `ifGenerationMatch` so the revision check is atomic with the
//! upload. Auth is a bearer token taken from the environment when present;
//! public buckets work without one.

use super::{Revision, StatResult, Storage, StorageError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";
const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const STAT_TIMEOUT: Duration = Duration::from_secs(60);
const READ_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct GcsStorage {
    client: reqwest::Client,
}

/// Split a `gs://bucket/path` URI into bucket and object name.
fn parse_uri(uri: &str) -> Result<(&str, &str), StorageError> {
    let rest = uri
        .strip_prefix("gs://")
        .ok_or_else(|| StorageError::InvalidArgument(format!("not a gs:// uri: {uri}")))?;
    Ok(match rest.split_once('/') {
        Some((bucket, object)) => (bucket, object),
        None => (rest, ""),
    })
}

/// Percent-encode an object name for use as a single path segment.
fn encode_object(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    size: Option<String>,
    generation: Option<String>,
    updated: Option<chrono::DateTime<chrono::Utc>>,
}

impl ObjectMeta {
    fn revision(&self) -> Option<Revision> {
        self.generation.clone().map(Revision::new)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    items: Option<Vec<ObjectMeta>>,
    next_page_token: Option<String>,
}

fn request_error(location: &str, err: &reqwest::Error) -> StorageError {
    if err.is_timeout() {
        StorageError::Timeout(location.to_string())
    } else {
        StorageError::Other(format!("{location}: {err}"))
    }
}

impl GcsStorage {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.is_empty() => builder.bearer_auth(token),
            _ => builder,
        }
    }

    async fn object_meta(
        &self,
        location: &str,
        bucket: &str,
        object: &str,
    ) -> Result<ObjectMeta, StorageError> {
        let url = format!("{API_BASE}/b/{bucket}/o/{}", encode_object(object));
        let resp = self
            .authorized(self.client.get(&url))
            .timeout(STAT_TIMEOUT)
            .send()
            .await
            .map_err(|e| request_error(location, &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(location.to_string()));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| request_error(location, &e))?;
        resp.json()
            .await
            .map_err(|e| StorageError::Other(format!("{location}: {e}")))
    }

    /// One page of an object listing.
    async fn list_page(
        &self,
        location: &str,
        bucket: &str,
        prefix: &str,
        match_glob: Option<&str>,
        max_results: Option<u32>,
        page_token: Option<&str>,
    ) -> Result<ListResponse, StorageError> {
        let url = format!("{API_BASE}/b/{bucket}/o");
        let mut request = self
            .authorized(self.client.get(&url))
            .timeout(STAT_TIMEOUT)
            .query(&[("prefix", prefix)]);
        if let Some(pattern) = match_glob {
            request = request.query(&[("matchGlob", pattern)]);
        }
        if let Some(max) = max_results {
            request = request.query(&[("maxResults", max.to_string())]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| request_error(location, &e))?
            .error_for_status()
            .map_err(|e| request_error(location, &e))?;
        resp.json()
            .await
            .map_err(|e| StorageError::Other(format!("{location}: {e}")))
    }
}

impl Default for GcsStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for GcsStorage {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn stat(&self, location: &str) -> Result<StatResult, StorageError> {
        let (bucket, object) = parse_uri(location)?;

        // the bucket root behaves as a directory
        if object.is_empty() {
            return Ok(StatResult {
                is_dir: true,
                is_reg: false,
                size: Some(0),
                revision: None,
                mtime: None,
            });
        }

        match self.object_meta(location, bucket, object).await {
            Ok(meta) => Ok(StatResult {
                is_dir: false,
                is_reg: true,
                size: meta.size.as_deref().and_then(|s| s.parse().ok()),
                revision: meta.revision(),
                mtime: meta
                    .updated
                    .map(|dt| dt.timestamp_millis() as f64 / 1000.0),
            }),
            // an object may still exist as a prefix with blobs underneath
            Err(StorageError::NotFound(_)) => {
                let prefix = if object.ends_with('/') {
                    object.to_string()
                } else {
                    format!("{object}/")
                };
                let page = self
                    .list_page(location, bucket, &prefix, None, Some(1), None)
                    .await?;
                if page.items.is_some_and(|items| !items.is_empty()) {
                    Ok(StatResult {
                        is_dir: true,
                        is_reg: false,
                        size: Some(0),
                        revision: None,
                        mtime: None,
                    })
                } else {
                    Err(StorageError::NotFound(location.to_string()))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn glob(&self, location: &str, pattern: &str) -> Result<Vec<String>, StorageError> {
        let (bucket, prefix) = parse_uri(location)?;
        let search_prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        // matchGlob applies to full object names, so anchor the pattern at
        // the search prefix
        let match_glob = format!("{search_prefix}{pattern}");

        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_page(
                    location,
                    bucket,
                    &search_prefix,
                    Some(&match_glob),
                    None,
                    page_token.as_deref(),
                )
                .await?;
            if let Some(items) = page.items {
                names.extend(items.into_iter().map(|o| o.name));
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(names
            .into_iter()
            .map(|name| format!("gs://{bucket}/{name}"))
            .collect())
    }

    async fn read(&self, location: &str) -> Result<(Vec<u8>, Revision), StorageError> {
        let (bucket, object) = parse_uri(location)?;

        // read-stable-revision: download, then confirm the generation did
        // not move underneath us
        loop {
            let before = self.object_meta(location, bucket, object).await?;
            let url = format!(
                "{API_BASE}/b/{bucket}/o/{}?alt=media",
                encode_object(object)
            );
            let resp = self
                .authorized(self.client.get(&url))
                .timeout(READ_TIMEOUT)
                .send()
                .await
                .map_err(|e| request_error(location, &e))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(StorageError::NotFound(location.to_string()));
            }
            let resp = resp
                .error_for_status()
                .map_err(|e| request_error(location, &e))?;
            let data = resp
                .bytes()
                .await
                .map_err(|e| request_error(location, &e))?;

            let after = self.object_meta(location, bucket, object).await?;
            if before.generation == after.generation {
                let revision = after.revision().ok_or_else(|| {
                    StorageError::Other(format!("no generation for {location}"))
                })?;
                return Ok((data.to_vec(), revision));
            }
            debug!(location, "object modified during read, retrying");
        }
    }

    async fn write(
        &self,
        location: &str,
        data: &[u8],
        expected_revision: Option<&Revision>,
    ) -> Result<Revision, StorageError> {
        let (bucket, object) = parse_uri(location)?;
        let url = format!("{UPLOAD_BASE}/b/{bucket}/o");
        let mut request = self
            .authorized(self.client.post(&url))
            .timeout(READ_TIMEOUT)
            .query(&[("uploadType", "media"), ("name", object)]);
        if let Some(expected) = expected_revision {
            let generation: u64 = expected.as_str().parse().map_err(|_| {
                StorageError::InvalidArgument(format!(
                    "expected revision is not a generation: {expected}"
                ))
            })?;
            request = request.query(&[("ifGenerationMatch", generation.to_string())]);
        }

        let resp = request
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| request_error(location, &e))?;
        if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(StorageError::PreconditionFailed(format!(
                "generation mismatch at {location}"
            )));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| request_error(location, &e))?;
        let meta: ObjectMeta = resp
            .json()
            .await
            .map_err(|e| StorageError::Other(format!("{location}: {e}")))?;
        meta.revision()
            .ok_or_else(|| StorageError::Other(format!("no generation for {location}")))
    }

    async fn copy_within(&self, src: &str, dst: &str) -> Result<Revision, StorageError> {
        let (src_bucket, src_object) = parse_uri(src)?;
        let (dst_bucket, dst_object) = parse_uri(dst)?;
        let url = format!(
            "{API_BASE}/b/{src_bucket}/o/{}/copyTo/b/{dst_bucket}/o/{}",
            encode_object(src_object),
            encode_object(dst_object),
        );
        let resp = self
            .authorized(self.client.post(&url))
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| request_error(src, &e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(src.to_string()));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| request_error(src, &e))?;
        let meta: ObjectMeta = resp
            .json()
            .await
            .map_err(|e| StorageError::Other(format!("{dst}: {e}")))?;
        debug!(src, dst, "server-side copy complete");
        meta.revision()
            .ok_or_else(|| StorageError::Other(format!("no generation for {dst}")))
    }
}
