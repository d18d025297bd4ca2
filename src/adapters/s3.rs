//! S3 storage adapter (feature `s3`). Supports S3-compatible services via
//! a custom endpoint (LocalStack/MinIO).

use super::storage::{RemoteEntry, StorageAdapter};
use super::{settings_error, AdapterError, AdapterResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3Settings {
    bucket: String,
    region: String,
    #[serde(default)]
    key_prefix: String,
    #[serde(default)]
    endpoint_url: Option<String>,
    #[serde(default)]
    force_path_style: bool,
}

impl S3Settings {
    fn parse(settings: &Value) -> AdapterResult<Self> {
        let parsed: Self = serde_json::from_value(settings.clone()).map_err(settings_error)?;
        if parsed.bucket.is_empty() {
            return Err(AdapterError::InvalidSettings("bucket must not be empty".into()));
        }
        Ok(parsed)
    }

    fn key(&self, remote: &str) -> String {
        if self.key_prefix.is_empty() {
            remote.to_string()
        } else {
            format!("{}/{}", self.key_prefix.trim_end_matches('/'), remote)
        }
    }

    async fn client(&self) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region.clone()));
        if let Some(ref endpoint) = self.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if self.force_path_style {
            builder = builder.force_path_style(true);
        }
        Client::from_conf(builder.build())
    }
}

/// AWS S3 (and S3-compatible) storage adapter
#[derive(Debug, Default)]
pub struct S3Storage;

#[async_trait]
impl StorageAdapter for S3Storage {
    fn id(&self) -> &'static str {
        "s3-aws"
    }

    fn display_name(&self) -> &'static str {
        "Amazon S3"
    }

    fn validate(&self, settings: &Value) -> AdapterResult<()> {
        S3Settings::parse(settings).map(|_| ())
    }

    async fn upload(&self, settings: &Value, remote: &str, local: &Path) -> AdapterResult<()> {
        let cfg = S3Settings::parse(settings)?;
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| AdapterError::Tool(format!("s3 upload body: {}", e)))?;
        cfg.client()
            .await
            .put_object()
            .bucket(&cfg.bucket)
            .key(cfg.key(remote))
            .body(body)
            .send()
            .await
            .map_err(|e| AdapterError::Tool(format!("s3 put_object: {}", e)))?;
        debug!(remote = %remote, bucket = %cfg.bucket, "uploaded to s3");
        Ok(())
    }

    async fn download(&self, settings: &Value, remote: &str, local: &Path) -> AdapterResult<()> {
        let cfg = S3Settings::parse(settings)?;
        let object = cfg
            .client()
            .await
            .get_object()
            .bucket(&cfg.bucket)
            .key(cfg.key(remote))
            .send()
            .await
            .map_err(|e| AdapterError::Tool(format!("s3 get_object: {}", e)))?;

        let mut reader = object.body.into_async_read();
        let mut file = tokio::fs::File::create(local).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        Ok(())
    }

    async fn read(&self, settings: &Value, remote: &str) -> AdapterResult<Option<Vec<u8>>> {
        let cfg = S3Settings::parse(settings)?;
        let result = cfg
            .client()
            .await
            .get_object()
            .bucket(&cfg.bucket)
            .key(cfg.key(remote))
            .send()
            .await;
        match result {
            Ok(object) => {
                let data = object
                    .body
                    .collect()
                    .await
                    .map_err(|e| AdapterError::Tool(format!("s3 read body: {}", e)))?;
                Ok(Some(data.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(AdapterError::Tool(format!("s3 get_object: {}", service_err)))
                }
            }
        }
    }

    async fn list(&self, settings: &Value, prefix: &str) -> AdapterResult<Vec<RemoteEntry>> {
        let cfg = S3Settings::parse(settings)?;
        let full_prefix = cfg.key(prefix);
        let strip = if cfg.key_prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", cfg.key_prefix.trim_end_matches('/'))
        };

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        let client = cfg.client().await;
        loop {
            let mut request = client
                .list_objects_v2()
                .bucket(&cfg.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .map_err(|e| AdapterError::Tool(format!("s3 list_objects: {}", e)))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let path = key.strip_prefix(&strip).unwrap_or(key).to_string();
                entries.push(RemoteEntry {
                    path,
                    size: object.size().unwrap_or_default() as u64,
                    modified: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0)),
                });
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn delete(&self, settings: &Value, remote: &str) -> AdapterResult<()> {
        let cfg = S3Settings::parse(settings)?;
        cfg.client()
            .await
            .delete_object()
            .bucket(&cfg.bucket)
            .key(cfg.key(remote))
            .send()
            .await
            .map_err(|e| AdapterError::Tool(format!("s3 delete_object: {}", e)))?;
        Ok(())
    }
}
