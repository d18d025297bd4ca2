//! MySQL/MariaDB adapter, driven through `mysqldump` and `mysql`.
//!
//! `mysqldump --databases` natively emits `-- Current Database:` section
//! markers plus `CREATE DATABASE`/`USE` statements; restore splits on those
//! markers and rewrites the statements when a database is renamed.

use super::database::{
    require_binary, run_tool, split_sections, ConnectionInfo, DatabaseAdapter, DumpOutput,
    RestoreOutput, RestoreTargetOptions,
};
use super::{settings_error, AdapterError, AdapterResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info};

fn section_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new("^-- Current Database: `([^`]+)`").unwrap())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MysqlSettings {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    #[serde(default)]
    password: Option<String>,
    databases: Vec<String>,
}

fn default_port() -> u16 {
    3306
}

impl MysqlSettings {
    fn parse(settings: &Value) -> AdapterResult<Self> {
        let parsed: Self = serde_json::from_value(settings.clone()).map_err(settings_error)?;
        if parsed.host.is_empty() {
            return Err(AdapterError::InvalidSettings("host must not be empty".into()));
        }
        if parsed.databases.is_empty() {
            return Err(AdapterError::InvalidSettings(
                "at least one database is required".into(),
            ));
        }
        Ok(parsed)
    }

    fn base_command(&self, binary: &str, username: &str, password: Option<&str>) -> Command {
        let mut cmd = Command::new(binary);
        cmd.arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--user")
            .arg(username)
            .env("MYSQL_PWD", password.unwrap_or_default());
        cmd
    }
}

/// MySQL/MariaDB adapter
#[derive(Debug, Default)]
pub struct MysqlAdapter;

fn credentials<'a>(
    cfg: &'a MysqlSettings,
    options: &'a RestoreTargetOptions,
) -> (&'a str, Option<&'a str>) {
    match &options.privileged {
        Some(auth) => (auth.username.as_str(), Some(auth.password.as_str())),
        None => (cfg.username.as_str(), cfg.password.as_deref()),
    }
}

/// Rewrite the `CREATE DATABASE`/`USE` statements of one section when the
/// database is restored under a different name.
fn rename_section(section: &Path, original: &str, target: &str) -> std::io::Result<()> {
    use std::io::{BufRead, BufReader, BufWriter, Write};

    if original == target {
        return Ok(());
    }
    let renamed = section.with_extension("renamed.sql");
    {
        let reader = BufReader::new(std::fs::File::open(section)?);
        let mut writer = BufWriter::new(std::fs::File::create(&renamed)?);
        let needle = format!("`{}`", original);
        let replacement = format!("`{}`", target);
        for line in reader.lines() {
            let line = line?;
            let rewritten = if line.starts_with("CREATE DATABASE")
                || line.starts_with("USE ")
                || line.starts_with("-- Current Database:")
            {
                line.replace(&needle, &replacement)
            } else {
                line
            };
            writer.write_all(rewritten.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    std::fs::rename(&renamed, section)
}

#[async_trait]
impl DatabaseAdapter for MysqlAdapter {
    fn id(&self) -> &'static str {
        "mysql"
    }

    fn display_name(&self) -> &'static str {
        "MySQL"
    }

    fn file_extension(&self) -> &'static str {
        "sql"
    }

    fn validate(&self, settings: &Value) -> AdapterResult<()> {
        MysqlSettings::parse(settings).map(|_| ())
    }

    async fn test(&self, settings: &Value) -> AdapterResult<ConnectionInfo> {
        let cfg = MysqlSettings::parse(settings)?;
        require_binary("mysql")?;

        let mut cmd = cfg.base_command("mysql", &cfg.username, cfg.password.as_deref());
        cmd.arg("-N").arg("-e").arg("SELECT VERSION()").stdin(Stdio::null());
        let output = cmd
            .output()
            .await
            .map_err(|e| AdapterError::Connectivity(format!("mysql: failed to spawn: {}", e)))?;
        if !output.status.success() {
            return Err(AdapterError::Connectivity(format!(
                "mysql: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // "8.0.36-0ubuntu0.22.04" reports as 8.0.36
        let version = raw.split('-').next().unwrap_or_default().to_string();
        if version.is_empty() {
            return Err(AdapterError::Connectivity("mysql returned no version".into()));
        }
        debug!(version = %version, host = %cfg.host, "mysql connectivity ok");
        Ok(ConnectionInfo {
            version,
            message: Some(raw),
        })
    }

    async fn prepare_restore(&self, settings: &Value) -> AdapterResult<()> {
        self.test(settings).await.map(|_| ())
    }

    async fn dump(&self, settings: &Value, dest: &Path) -> AdapterResult<DumpOutput> {
        let cfg = MysqlSettings::parse(settings)?;
        require_binary("mysqldump")?;

        let stdout = std::fs::File::create(dest)?;
        let mut cmd = cfg.base_command("mysqldump", &cfg.username, cfg.password.as_deref());
        cmd.arg("--single-transaction")
            .arg("--routines")
            .arg("--databases")
            .args(&cfg.databases)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout));
        let logs = run_tool(cmd, "mysqldump").await?;
        info!(databases = ?cfg.databases, "mysqldump complete");

        Ok(DumpOutput {
            databases: cfg.databases.clone(),
            logs,
        })
    }

    async fn restore(
        &self,
        settings: &Value,
        source: &Path,
        options: &RestoreTargetOptions,
    ) -> AdapterResult<RestoreOutput> {
        let cfg = MysqlSettings::parse(settings)?;
        require_binary("mysql")?;

        let scratch = source
            .parent()
            .ok_or_else(|| AdapterError::Tool("dump file has no parent directory".into()))?
            .to_path_buf();
        let fallback = cfg.databases[0].clone();
        let source_owned = source.to_path_buf();
        let sections = tokio::task::spawn_blocking(move || {
            split_sections(&source_owned, &scratch, section_pattern(), &fallback)
        })
        .await
        .map_err(|e| AdapterError::Tool(format!("section split task failed: {}", e)))??;

        let mut logs = Vec::new();
        for (name, section_file) in &sections {
            let target = match options.target_for(name) {
                Some(target) => target.to_string(),
                None => {
                    logs.push(format!("skipping database {} (not selected)", name));
                    continue;
                }
            };
            rename_section(section_file, name, &target)?;

            let (user, pass) = credentials(&cfg, options);
            let stdin = std::fs::File::open(section_file)?;
            let mut cmd = cfg.base_command("mysql", user, pass);
            cmd.stdin(Stdio::from(stdin)).stdout(Stdio::null());
            logs.extend(run_tool(cmd, "mysql").await?);
            info!(database = %name, target = %target, "mysql section restored");
        }

        Ok(RestoreOutput { logs })
    }

    fn dump_looks_valid(&self, head: &[u8]) -> bool {
        let text = String::from_utf8_lossy(head);
        text.contains("MySQL dump") || text.contains("-- Current Database:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_settings_validation() {
        let adapter = MysqlAdapter;
        assert!(adapter
            .validate(&json!({
                "host": "db.internal",
                "username": "backup",
                "databases": ["app", "sessions"]
            }))
            .is_ok());
        assert!(adapter
            .validate(&json!({ "host": "db.internal", "username": "backup", "databases": [] }))
            .is_err());
    }

    #[test]
    fn test_rename_rewrites_only_structure_lines() {
        let dir = tempfile::tempdir().unwrap();
        let section = dir.path().join("section_000.sql");
        let mut f = std::fs::File::create(&section).unwrap();
        writeln!(f, "-- Current Database: `app`").unwrap();
        writeln!(f, "CREATE DATABASE /*!32312 IF NOT EXISTS*/ `app`;").unwrap();
        writeln!(f, "USE `app`;").unwrap();
        writeln!(f, "INSERT INTO t VALUES ('keep `app` literal');").unwrap();
        drop(f);

        rename_section(&section, "app", "app_copy").unwrap();
        let content = std::fs::read_to_string(&section).unwrap();
        assert!(content.contains("CREATE DATABASE /*!32312 IF NOT EXISTS*/ `app_copy`;"));
        assert!(content.contains("USE `app_copy`;"));
        assert!(content.contains("'keep `app` literal'"));
    }

    #[test]
    fn test_dump_plausibility() {
        let adapter = MysqlAdapter;
        assert!(adapter.dump_looks_valid(b"-- MySQL dump 10.13  Distrib 8.0.36\n"));
        assert!(!adapter.dump_looks_valid(b"-- PostgreSQL database dump\n"));
    }
}
