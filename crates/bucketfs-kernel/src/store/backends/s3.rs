//! S3 / MinIO backend built on `aws-sdk-s3`.
//!
//! Directories are key prefixes. An empty directory is represented by a
//! zero-length `dir/` marker object.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use std::path::Path;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;

use crate::store::error::{RemoteError, RemoteResult};
use crate::store::ops::RemoteStore;
use crate::store::types::{ObjectAttr, ObjectPath, RemoteEntry};

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

/// Object store backed by an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client for `config`.
    ///
    /// Uses path-style addressing, which MinIO requires, and static
    /// credentials. No network traffic happens until the first call.
    pub async fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key,
            config.secret_key,
            None,
            None,
            "bucketfs-static",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .endpoint_url(config.endpoint)
            .credentials_provider(credentials)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Probe for any key under `path/`, which makes it a directory.
    async fn prefix_exists(&self, path: &ObjectPath) -> RemoteResult<bool> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(path.dir_prefix())
            .max_keys(1)
            .send()
            .await
            .map_err(|e| classify(path.as_str(), e))?;
        Ok(!resp.contents().is_empty() || !resp.common_prefixes().is_empty())
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn fetch(&self, path: &ObjectPath, dest: &Path) -> RemoteResult<u64> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .send()
            .await
            .map_err(|e| classify(path.as_str(), e))?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = resp.body.into_async_read();
        let written = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }

    async fn store(&self, src: &Path, path: &ObjectPath) -> RemoteResult<()> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| RemoteError::io(format!("{}: {e}", src.display())))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| classify(path.as_str(), e))?;
        Ok(())
    }

    async fn remove(&self, path: &ObjectPath) -> RemoteResult<()> {
        // DeleteObject succeeds on missing keys; head first so callers see NotFound.
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .send()
            .await
            .map_err(|e| classify(path.as_str(), e))?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .send()
            .await
            .map_err(|e| classify(path.as_str(), e))?;
        Ok(())
    }

    async fn remove_dir(&self, path: &ObjectPath) -> RemoteResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path.dir_prefix())
            .send()
            .await
            .map_err(|e| classify(path.as_str(), e))?;
        Ok(())
    }

    async fn list(&self, prefix: &ObjectPath) -> RemoteResult<Vec<RemoteEntry>> {
        let base = prefix.dir_prefix();
        let mut entries = Vec::new();
        let mut saw_marker = false;
        let mut token: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&base)
                .delimiter("/")
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| classify(prefix.as_str(), e))?;

            for common in resp.common_prefixes() {
                let Some(name) = common.prefix().and_then(|p| p.strip_prefix(base.as_str())) else {
                    continue;
                };
                let name = name.trim_end_matches('/');
                if !name.is_empty() {
                    entries.push(RemoteEntry::directory(name));
                }
            }
            for object in resp.contents() {
                let Some(name) = object.key().and_then(|k| k.strip_prefix(base.as_str())) else {
                    continue;
                };
                if name.is_empty() {
                    saw_marker = true;
                    continue;
                }
                let size = object.size().unwrap_or(0).max(0) as u64;
                entries.push(RemoteEntry::file(name, size));
            }

            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        if entries.is_empty() && !saw_marker && !prefix.is_root() {
            return Err(RemoteError::not_found(prefix.as_str()));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn head(&self, path: &ObjectPath) -> RemoteResult<ObjectAttr> {
        if path.is_root() {
            return Ok(ObjectAttr::directory());
        }

        let err = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path.as_str())
            .send()
            .await
        {
            Ok(resp) => {
                let size = resp.content_length().unwrap_or(0).max(0) as u64;
                let modified = resp.last_modified().and_then(|t| SystemTime::try_from(*t).ok());
                return Ok(ObjectAttr::file(size).with_modified(modified));
            }
            Err(e) => classify(path.as_str(), e),
        };

        match err {
            RemoteError::NotFound(_) if self.prefix_exists(path).await? => Ok(ObjectAttr::directory()),
            other => Err(other),
        }
    }

    async fn create_dir(&self, path: &ObjectPath) -> RemoteResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path.dir_prefix())
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| classify(path.as_str(), e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

/// Map an SDK failure onto [`RemoteError`].
fn classify<E>(key: &str, err: SdkError<E, HttpResponse>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().map(str::to_owned);
    classify_code(key, code.as_deref(), status, DisplayErrorContext(&err).to_string())
}

fn classify_code(key: &str, code: Option<&str>, status: Option<u16>, message: String) -> RemoteError {
    match code {
        Some(c) if c.contains("Quota") || c.contains("StorageFull") || c == "EntityTooLarge" => {
            return RemoteError::quota_exceeded(message);
        }
        Some("NoSuchKey" | "NotFound" | "NoSuchBucket") => return RemoteError::not_found(key),
        _ => {}
    }
    if status == Some(404) {
        RemoteError::not_found(key)
    } else {
        RemoteError::io(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = classify_code("a/b", Some("NoSuchKey"), Some(404), "gone".into());
        assert!(matches!(err, RemoteError::NotFound(k) if k == "a/b"));
        // HeadObject has no body, so only the status survives.
        let err = classify_code("a/b", None, Some(404), "".into());
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[test]
    fn test_classify_quota() {
        for code in ["XMinioStorageFull", "QuotaExceeded", "EntityTooLarge"] {
            let err = classify_code("k", Some(code), Some(507), "full".into());
            assert!(matches!(err, RemoteError::QuotaExceeded(_)), "{code}");
        }
    }

    #[test]
    fn test_classify_everything_else_is_io() {
        let err = classify_code("k", Some("SlowDown"), Some(503), "busy".into());
        assert!(err.is_transient());
        let err = classify_code("k", None, None, "dispatch failure".into());
        assert!(matches!(err, RemoteError::Io(_)));
    }
}
