//! SQLite adapter. Dumps are binary snapshots taken with `sqlite3 .backup`
//! so readers, WAL state, and page checksums are handled by SQLite itself.

use super::database::{
    require_binary, run_tool, ConnectionInfo, DatabaseAdapter, DumpOutput, RestoreOutput,
    RestoreTargetOptions,
};
use super::{settings_error, AdapterError, AdapterResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqliteSettings {
    /// Path of the live database file
    path: PathBuf,
}

impl SqliteSettings {
    fn parse(settings: &Value) -> AdapterResult<Self> {
        let parsed: Self = serde_json::from_value(settings.clone()).map_err(settings_error)?;
        if parsed.path.as_os_str().is_empty() {
            return Err(AdapterError::InvalidSettings("path must not be empty".into()));
        }
        Ok(parsed)
    }

    fn logical_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string())
    }
}

/// SQLite adapter
#[derive(Debug, Default)]
pub struct SqliteAdapter;

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn id(&self) -> &'static str {
        "sqlite"
    }

    fn display_name(&self) -> &'static str {
        "SQLite"
    }

    fn file_extension(&self) -> &'static str {
        "sqlite"
    }

    fn validate(&self, settings: &Value) -> AdapterResult<()> {
        SqliteSettings::parse(settings).map(|_| ())
    }

    async fn test(&self, settings: &Value) -> AdapterResult<ConnectionInfo> {
        let cfg = SqliteSettings::parse(settings)?;
        require_binary("sqlite3")?;
        if !cfg.path.exists() {
            return Err(AdapterError::Connectivity(format!(
                "database file not found: {}",
                cfg.path.display()
            )));
        }

        let output = Command::new("sqlite3")
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AdapterError::Connectivity(format!("sqlite3: failed to spawn: {}", e)))?;
        if !output.status.success() {
            return Err(AdapterError::Connectivity(format!(
                "sqlite3: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // "3.45.1 2024-01-30 16:01:20 ..." reports as 3.45.1
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(ConnectionInfo {
            version,
            message: None,
        })
    }

    async fn prepare_restore(&self, settings: &Value) -> AdapterResult<()> {
        let cfg = SqliteSettings::parse(settings)?;
        require_binary("sqlite3")?;
        let parent = cfg
            .path
            .parent()
            .ok_or_else(|| AdapterError::InvalidSettings("path has no parent directory".into()))?;
        if !parent.exists() {
            return Err(AdapterError::Connectivity(format!(
                "target directory not found: {}",
                parent.display()
            )));
        }
        Ok(())
    }

    async fn dump(&self, settings: &Value, dest: &Path) -> AdapterResult<DumpOutput> {
        let cfg = SqliteSettings::parse(settings)?;
        require_binary("sqlite3")?;

        let mut cmd = Command::new("sqlite3");
        cmd.arg(&cfg.path)
            .arg(format!(".backup '{}'", dest.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        let logs = run_tool(cmd, "sqlite3").await?;
        info!(path = %cfg.path.display(), "sqlite snapshot complete");

        Ok(DumpOutput {
            databases: vec![cfg.logical_name()],
            logs,
        })
    }

    async fn restore(
        &self,
        settings: &Value,
        source: &Path,
        options: &RestoreTargetOptions,
    ) -> AdapterResult<RestoreOutput> {
        let cfg = SqliteSettings::parse(settings)?;
        let name = cfg.logical_name();
        if options.target_for(&name).is_none() {
            return Ok(RestoreOutput {
                logs: vec![format!("skipping database {} (not selected)", name)],
            });
        }

        // snapshot restore replaces the live file wholesale
        tokio::fs::copy(source, &cfg.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                AdapterError::PermissionDenied(format!(
                    "cannot replace {}: {}",
                    cfg.path.display(),
                    e
                ))
            } else {
                AdapterError::Io(e)
            }
        })?;
        info!(path = %cfg.path.display(), "sqlite snapshot restored");

        Ok(RestoreOutput {
            logs: vec![format!("replaced {}", cfg.path.display())],
        })
    }

    fn dump_looks_valid(&self, head: &[u8]) -> bool {
        head.starts_with(SQLITE_MAGIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_validation() {
        let adapter = SqliteAdapter;
        assert!(adapter.validate(&json!({ "path": "/var/data/app.db" })).is_ok());
        assert!(adapter.validate(&json!({ "path": "" })).is_err());
        assert!(adapter.validate(&json!({})).is_err());
    }

    #[test]
    fn test_dump_plausibility_checks_magic_bytes() {
        let adapter = SqliteAdapter;
        assert!(adapter.dump_looks_valid(b"SQLite format 3\0page data"));
        assert!(!adapter.dump_looks_valid(b"-- PostgreSQL database dump"));
    }
}
