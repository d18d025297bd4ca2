//! The storage adapter contract and the local-filesystem implementation.

use super::{settings_error, AdapterError, AdapterResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One object at a storage destination
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Path relative to the destination root
    pub path: String,
    /// Object size in bytes
    pub size: u64,
    /// Last-modified time, when the backend reports one
    pub modified: Option<DateTime<Utc>>,
}

/// Capability contract for artifact destinations
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Stable registry id ("local-fs")
    fn id(&self) -> &'static str;

    /// Human-readable adapter name
    fn display_name(&self) -> &'static str;

    /// Shape-check an opaque config payload
    fn validate(&self, settings: &Value) -> AdapterResult<()>;

    /// Copy a local file to `remote`
    async fn upload(&self, settings: &Value, remote: &str, local: &Path) -> AdapterResult<()>;

    /// Fetch `remote` into a local file
    async fn download(&self, settings: &Value, remote: &str, local: &Path) -> AdapterResult<()>;

    /// Read a small remote object wholesale; `None` when it does not exist
    async fn read(&self, settings: &Value, remote: &str) -> AdapterResult<Option<Vec<u8>>>;

    /// List objects under `prefix`
    async fn list(&self, settings: &Value, prefix: &str) -> AdapterResult<Vec<RemoteEntry>>;

    /// Delete `remote`; deleting a missing object is not an error
    async fn delete(&self, settings: &Value, remote: &str) -> AdapterResult<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalSettings {
    /// Destination root directory
    root: PathBuf,
}

impl LocalSettings {
    fn parse(settings: &Value) -> AdapterResult<Self> {
        let parsed: Self = serde_json::from_value(settings.clone()).map_err(settings_error)?;
        if parsed.root.as_os_str().is_empty() {
            return Err(AdapterError::InvalidSettings("root must not be empty".into()));
        }
        Ok(parsed)
    }

    /// Join a remote path under the root, refusing traversal components
    fn resolve(&self, remote: &str) -> AdapterResult<PathBuf> {
        let relative = Path::new(remote);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(AdapterError::InvalidSettings(format!(
                "invalid remote path: {}",
                remote
            )));
        }
        Ok(self.root.join(relative))
    }
}

/// Local-filesystem storage adapter
#[derive(Debug, Default)]
pub struct LocalStorage;

#[async_trait]
impl StorageAdapter for LocalStorage {
    fn id(&self) -> &'static str {
        "local-fs"
    }

    fn display_name(&self) -> &'static str {
        "Local filesystem"
    }

    fn validate(&self, settings: &Value) -> AdapterResult<()> {
        LocalSettings::parse(settings).map(|_| ())
    }

    async fn upload(&self, settings: &Value, remote: &str, local: &Path) -> AdapterResult<()> {
        let cfg = LocalSettings::parse(settings)?;
        let dest = cfg.resolve(remote)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &dest).await?;
        debug!(remote = %remote, "uploaded to local storage");
        Ok(())
    }

    async fn download(&self, settings: &Value, remote: &str, local: &Path) -> AdapterResult<()> {
        let cfg = LocalSettings::parse(settings)?;
        let src = cfg.resolve(remote)?;
        if !src.exists() {
            return Err(AdapterError::Tool(format!("remote object not found: {}", remote)));
        }
        tokio::fs::copy(&src, local).await?;
        Ok(())
    }

    async fn read(&self, settings: &Value, remote: &str) -> AdapterResult<Option<Vec<u8>>> {
        let cfg = LocalSettings::parse(settings)?;
        match tokio::fs::read(cfg.resolve(remote)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, settings: &Value, prefix: &str) -> AdapterResult<Vec<RemoteEntry>> {
        let cfg = LocalSettings::parse(settings)?;
        let dir = cfg.resolve(prefix)?;
        let mut entries = Vec::new();
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(RemoteEntry {
                path: format!("{}/{}", prefix.trim_end_matches('/'), name),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        Ok(entries)
    }

    async fn delete(&self, settings: &Value, remote: &str) -> AdapterResult<()> {
        let cfg = LocalSettings::parse(settings)?;
        match tokio::fs::remove_file(cfg.resolve(remote)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
