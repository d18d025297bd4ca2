//! PostgreSQL adapter, driven through `pg_dump` and `psql`.
//!
//! Multi-database artifacts are plain-format dumps concatenated behind
//! `-- dbackup:database <name>` section markers; restore splits on the same
//! markers so individual databases can be skipped or renamed.

use super::database::{
    require_binary, run_tool, split_sections, tool_failure, ConnectionInfo, DatabaseAdapter,
    DumpOutput, RestoreOutput, RestoreTargetOptions,
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

/// Section marker written between databases in a multi-database artifact
pub const SECTION_MARKER: &str = "-- dbackup:database";

fn section_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^-- dbackup:database (\S+)").unwrap())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostgresSettings {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    #[serde(default)]
    password: Option<String>,
    databases: Vec<String>,
}

fn default_port() -> u16 {
    5432
}

impl PostgresSettings {
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
            .arg("--username")
            .arg(username)
            .arg("--no-password")
            .env("PGPASSWORD", password.unwrap_or_default());
        cmd
    }
}

/// PostgreSQL adapter
#[derive(Debug, Default)]
pub struct PostgresAdapter;

impl PostgresAdapter {
    async fn server_version(&self, cfg: &PostgresSettings) -> AdapterResult<String> {
        require_binary("psql")?;
        let mut cmd = cfg.base_command("psql", &cfg.username, cfg.password.as_deref());
        cmd.arg("--dbname")
            .arg(&cfg.databases[0])
            .arg("-tA")
            .arg("-c")
            .arg("SHOW server_version")
            .stdin(Stdio::null());
        let output = cmd
            .output()
            .await
            .map_err(|e| AdapterError::Connectivity(format!("psql: failed to spawn: {}", e)))?;
        if !output.status.success() {
            return Err(AdapterError::Connectivity(format!(
                "psql: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        if version.is_empty() {
            return Err(AdapterError::Connectivity(
                "psql returned no server version".into(),
            ));
        }
        Ok(version)
    }

    async fn ensure_database(&self, cfg: &PostgresSettings, options: &RestoreTargetOptions, name: &str) -> AdapterResult<Vec<String>> {
        let (user, pass) = credentials(cfg, options);
        let mut cmd = cfg.base_command("psql", user, pass);
        cmd.arg("--dbname")
            .arg("postgres")
            .arg("-c")
            .arg(format!("CREATE DATABASE \"{}\"", name))
            .stdin(Stdio::null());
        let output = cmd
            .output()
            .await
            .map_err(|e| AdapterError::Tool(format!("psql: failed to spawn: {}", e)))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !stderr.contains("already exists") {
            return Err(tool_failure("psql", &stderr));
        }
        Ok(stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| format!("psql: {}", l))
            .collect())
    }
}

fn credentials<'a>(
    cfg: &'a PostgresSettings,
    options: &'a RestoreTargetOptions,
) -> (&'a str, Option<&'a str>) {
    match &options.privileged {
        Some(auth) => (auth.username.as_str(), Some(auth.password.as_str())),
        None => (cfg.username.as_str(), cfg.password.as_deref()),
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn id(&self) -> &'static str {
        "postgres"
    }

    fn display_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn file_extension(&self) -> &'static str {
        "sql"
    }

    fn validate(&self, settings: &Value) -> AdapterResult<()> {
        PostgresSettings::parse(settings).map(|_| ())
    }

    async fn test(&self, settings: &Value) -> AdapterResult<ConnectionInfo> {
        let cfg = PostgresSettings::parse(settings)?;
        let version = self.server_version(&cfg).await?;
        debug!(version = %version, host = %cfg.host, "postgres connectivity ok");
        Ok(ConnectionInfo {
            version,
            message: None,
        })
    }

    async fn prepare_restore(&self, settings: &Value) -> AdapterResult<()> {
        let cfg = PostgresSettings::parse(settings)?;
        require_binary("psql")?;
        self.server_version(&cfg).await.map(|_| ())
    }

    async fn dump(&self, settings: &Value, dest: &Path) -> AdapterResult<DumpOutput> {
        let cfg = PostgresSettings::parse(settings)?;
        require_binary("pg_dump")?;

        let mut logs = Vec::new();
        for db in &cfg.databases {
            {
                use std::io::Write;
                let mut f = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dest)?;
                writeln!(f, "{} {}", SECTION_MARKER, db)?;
            }
            let stdout = std::fs::OpenOptions::new().append(true).open(dest)?;
            let mut cmd = cfg.base_command("pg_dump", &cfg.username, cfg.password.as_deref());
            cmd.arg("--format=plain")
                .arg(db)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout));
            logs.extend(run_tool(cmd, "pg_dump").await?);
            info!(database = %db, "pg_dump section complete");
        }

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
        let cfg = PostgresSettings::parse(settings)?;
        require_binary("psql")?;

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
            logs.extend(self.ensure_database(&cfg, options, &target).await?);

            let (user, pass) = credentials(&cfg, options);
            let stdin = std::fs::File::open(section_file)?;
            let mut cmd = cfg.base_command("psql", user, pass);
            cmd.arg("--dbname")
                .arg(&target)
                .arg("--set")
                .arg("ON_ERROR_STOP=1")
                .stdin(Stdio::from(stdin))
                .stdout(Stdio::null());
            logs.extend(run_tool(cmd, "psql").await?);
            info!(database = %name, target = %target, "postgres section restored");
        }

        Ok(RestoreOutput { logs })
    }

    fn dump_looks_valid(&self, head: &[u8]) -> bool {
        let text = String::from_utf8_lossy(head);
        text.contains(SECTION_MARKER) || text.contains("PostgreSQL database dump")
    }
}
