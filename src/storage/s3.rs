//! S3-compatible gateway storage backend.
//!
//! Proxies storage operations to a single upstream S3 (or
//! S3-compatible) bucket, with a key prefix to namespace this
//! deployment's content.  Credentials are resolved via the standard
//! AWS credential chain (env vars, `~/.aws/credentials`, IAM role).

use aws_sdk_s3::Client;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::backend::{
    md5_hex, BackendEntry, BackendError, BackendResult, ContentHead, KeyOrder, StorageBackend,
    StoredContent,
};
use crate::config::S3StorageConfig;

/// Gateway backend that forwards operations to an S3-compatible store.
pub struct S3GatewayBackend {
    /// S3 SDK client.
    client: Client,
    /// The upstream bucket name.
    bucket: String,
    /// Key prefix for all content in the upstream bucket.
    prefix: String,
}

impl S3GatewayBackend {
    /// Create a new gateway backend from configuration.
    pub async fn new(config: &S3StorageConfig) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if !config.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&config.endpoint_url);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.use_path_style)
            .build();
        let client = Client::from_conf(s3_config);

        info!(
            bucket = %config.bucket,
            prefix = %config.prefix,
            "S3 gateway backend initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        })
    }

    /// Map a storage key to an upstream S3 key.
    fn s3_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> BackendError {
        BackendError::Io(anyhow::anyhow!("S3 {context}: {err}"))
    }

    /// Convert an SDK timestamp to `SystemTime`.
    fn to_system_time(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> SystemTime {
        match dt {
            Some(dt) if dt.secs() >= 0 => {
                UNIX_EPOCH
                    + Duration::new(dt.secs() as u64, dt.subsec_nanos())
            }
            _ => UNIX_EPOCH,
        }
    }
}

impl StorageBackend for S3GatewayBackend {
    fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<String>> + Send + '_>> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            // Compute MD5 locally for a consistent ETag (the upstream may
            // return a different ETag with server-side encryption).
            let etag = md5_hex(&data);

            debug!(bucket = %self.bucket, key = %s3_key, "s3 put_object");

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .content_type(&content_type)
                .body(aws_sdk_s3::primitives::ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;

            Ok(etag)
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<StoredContent>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            debug!(bucket = %self.bucket, key = %s3_key, "s3 get_object");

            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        BackendError::not_found(&key)
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;

            let content_type = resp.content_type().map(|s| s.to_string());
            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();
            let data = Bytes::from(body.to_vec());
            let etag = md5_hex(&data);

            Ok(StoredContent {
                data,
                content_type,
                etag,
            })
        })
    }

    fn head(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ContentHead>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            let resp = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        BackendError::not_found(&key)
                    } else {
                        Self::map_sdk_error("head_object", service_err)
                    }
                })?;

            Ok(ContentHead {
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                content_type: resp.content_type().map(|s| s.to_string()),
                mtime: Self::to_system_time(resp.last_modified()),
            })
        })
    }

    fn delete(&self, key: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            // Upstream deletes are idempotent; surface NotFound ourselves
            // so callers get the documented failure kind.
            if !self.exists(&key).await? {
                return Err(BackendError::not_found(&key));
            }

            let s3_key = self.s3_key(&key);
            debug!(bucket = %self.bucket, key = %s3_key, "s3 delete_object");

            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;
            Ok(())
        })
    }

    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<u64>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let s3_prefix = self.s3_key(&prefix);
            let mut removed = 0u64;
            let mut continuation: Option<String> = None;

            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&s3_prefix);
                if let Some(token) = &continuation {
                    req = req.continuation_token(token);
                }
                let page = req
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("list_objects_v2", e))?;

                for object in page.contents() {
                    if let Some(key) = object.key() {
                        self.client
                            .delete_object()
                            .bucket(&self.bucket)
                            .key(key)
                            .send()
                            .await
                            .map_err(|e| Self::map_sdk_error("delete_object", e))?;
                        removed += 1;
                    }
                }

                match page.next_continuation_token() {
                    Some(token) => continuation = Some(token.to_string()),
                    None => break,
                }
            }

            Ok(removed)
        })
    }

    fn list(
        &self,
        prefix: &str,
        limit: u32,
        offset: u32,
        order: KeyOrder,
    ) -> Pin<Box<dyn Future<Output = BackendResult<Vec<BackendEntry>>> + Send + '_>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let s3_prefix = self.s3_key(&prefix);
            let mut entries = Vec::new();
            let mut continuation: Option<String> = None;

            loop {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&s3_prefix);
                if let Some(token) = &continuation {
                    req = req.continuation_token(token);
                }
                let page = req
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("list_objects_v2", e))?;

                for object in page.contents() {
                    if let Some(key) = object.key() {
                        // Strip the deployment prefix back off.
                        let key = key
                            .strip_prefix(&self.prefix)
                            .unwrap_or(key)
                            .to_string();
                        entries.push(BackendEntry {
                            key,
                            size: object.size().unwrap_or(0).max(0) as u64,
                        });
                    }
                }

                match page.next_continuation_token() {
                    Some(token) => continuation = Some(token.to_string()),
                    None => break,
                }
            }

            entries.sort_by(|a, b| a.key.cmp(&b.key));
            if order == KeyOrder::Desc {
                entries.reverse();
            }
            Ok(entries
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        })
    }

    fn copy(
        &self,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<String>> + Send + '_>> {
        let src = src.to_string();
        let dst = dst.to_string();
        Box::pin(async move {
            let src_s3_key = self.s3_key(&src);
            let dst_s3_key = self.s3_key(&dst);
            let copy_source = format!("{}/{}", self.bucket, src_s3_key);

            debug!(src = %src_s3_key, dst = %dst_s3_key, "s3 copy_object");

            let resp = self
                .client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(&copy_source)
                .key(&dst_s3_key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    // Missing copy sources surface as a generic error with
                    // an embedded NoSuchKey code.
                    if format!("{service_err:?}").contains("NoSuchKey") {
                        BackendError::not_found(&src)
                    } else {
                        Self::map_sdk_error("copy_object", service_err)
                    }
                })?;

            // Single-part server-side copies return the MD5 ETag; fall
            // back to re-reading the copy if the upstream omits it.
            let etag = resp
                .copy_object_result()
                .and_then(|r| r.e_tag())
                .map(|t| t.trim_matches('"').to_string());
            match etag {
                Some(etag) => Ok(etag),
                None => Ok(self.get(&dst).await?.etag),
            }
        })
    }

    fn exists(&self, key: &str) -> Pin<Box<dyn Future<Output = BackendResult<bool>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let s3_key = self.s3_key(&key);

            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(Self::map_sdk_error("head_object", service_err))
                    }
                }
            }
        })
    }
}
