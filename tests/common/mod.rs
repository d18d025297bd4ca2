//! Shared test fixtures: a scripted database adapter that needs no
//! external tools, plus service builders wired to temp directories.

use async_trait::async_trait;
use dbackup::adapters::{
    AdapterCategory, AdapterError, AdapterRegistry, AdapterResult, ConnectionInfo,
    DatabaseAdapter, DumpOutput, RestoreOutput, RestoreTargetOptions,
};
use dbackup::jobs::JobSpec;
use dbackup::service::{BackupService, EngineConfig};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Magic first line every scripted dump starts with
pub const DUMP_HEADER: &str = "-- scripted dump v1";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScriptedSettings {
    /// Version the fake server reports
    #[serde(default = "default_version")]
    version: String,
    /// Payload written into the dump body
    #[serde(default)]
    payload: Option<String>,
    /// Directory restored dumps land in, one file per database
    #[serde(default)]
    restore_dir: Option<String>,
    /// Stage to fail at ("dump" | "restore" | "prepare")
    #[serde(default)]
    fail_stage: Option<String>,
    /// Milliseconds the dump sleeps, for concurrency tests
    #[serde(default)]
    dump_sleep_ms: Option<u64>,
    /// Refuse restore with a permission error unless privileged
    /// credentials are supplied
    #[serde(default)]
    require_privileged_restore: bool,
}

fn default_version() -> String {
    "14.0".to_string()
}

/// In-process database adapter driven entirely by its settings payload
#[derive(Debug, Default)]
pub struct ScriptedDatabase;

impl ScriptedDatabase {
    fn parse(settings: &Value) -> AdapterResult<ScriptedSettings> {
        serde_json::from_value(settings.clone())
            .map_err(|e| AdapterError::InvalidSettings(e.to_string()))
    }
}

#[async_trait]
impl DatabaseAdapter for ScriptedDatabase {
    fn id(&self) -> &'static str {
        "scripted"
    }

    fn display_name(&self) -> &'static str {
        "Scripted test database"
    }

    fn file_extension(&self) -> &'static str {
        "sql"
    }

    fn validate(&self, settings: &Value) -> AdapterResult<()> {
        Self::parse(settings).map(|_| ())
    }

    async fn test(&self, settings: &Value) -> AdapterResult<ConnectionInfo> {
        let cfg = Self::parse(settings)?;
        Ok(ConnectionInfo {
            version: cfg.version,
            message: None,
        })
    }

    async fn prepare_restore(&self, settings: &Value) -> AdapterResult<()> {
        let cfg = Self::parse(settings)?;
        if cfg.fail_stage.as_deref() == Some("prepare") {
            return Err(AdapterError::Connectivity("scripted prepare failure".into()));
        }
        Ok(())
    }

    async fn dump(&self, settings: &Value, dest: &Path) -> AdapterResult<DumpOutput> {
        let cfg = Self::parse(settings)?;
        if let Some(ms) = cfg.dump_sleep_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if cfg.fail_stage.as_deref() == Some("dump") {
            return Err(AdapterError::Tool("scripted dump failure".into()));
        }
        let payload = cfg.payload.unwrap_or_else(|| "INSERT INTO t VALUES (1);".into());
        tokio::fs::write(dest, format!("{}\n{}\n", DUMP_HEADER, payload))
            .await
            .map_err(AdapterError::Io)?;
        Ok(DumpOutput {
            databases: vec!["main".to_string()],
            logs: vec!["scripted: dumped 1 database".to_string()],
        })
    }

    async fn restore(
        &self,
        settings: &Value,
        source: &Path,
        options: &RestoreTargetOptions,
    ) -> AdapterResult<RestoreOutput> {
        let cfg = Self::parse(settings)?;
        if cfg.fail_stage.as_deref() == Some("restore") {
            return Err(AdapterError::Tool("scripted restore failure".into()));
        }
        if cfg.require_privileged_restore && options.privileged.is_none() {
            return Err(AdapterError::PermissionDenied(
                "scripted: Access denied for user".into(),
            ));
        }
        let restore_dir = cfg
            .restore_dir
            .ok_or_else(|| AdapterError::InvalidSettings("restoreDir is required".into()))?;

        let mut logs = Vec::new();
        match options.target_for("main") {
            Some(target) => {
                let dest = Path::new(&restore_dir).join(format!("{}.sql", target));
                tokio::fs::copy(source, &dest).await.map_err(AdapterError::Io)?;
                logs.push(format!("scripted: restored main into {}", target));
            }
            None => logs.push("skipping database main (not selected)".to_string()),
        }
        Ok(RestoreOutput { logs })
    }

    fn dump_looks_valid(&self, head: &[u8]) -> bool {
        String::from_utf8_lossy(head).starts_with(DUMP_HEADER)
    }
}

/// Registry with the scripted adapter registered on top of the built-ins
pub fn test_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::builtin();
    registry.register_database(std::sync::Arc::new(ScriptedDatabase));
    registry
}

/// Fixture owning the temp dirs a service test needs
pub struct Harness {
    pub service: BackupService,
    pub storage_root: tempfile::TempDir,
    pub restore_dir: tempfile::TempDir,
    pub temp_root: tempfile::TempDir,
}

impl Harness {
    pub fn new(max_concurrent: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();

        let storage_root = tempfile::tempdir().unwrap();
        let restore_dir = tempfile::tempdir().unwrap();
        let temp_root = tempfile::tempdir().unwrap();
        let config = EngineConfig::default()
            .with_max_concurrent_jobs(max_concurrent)
            .with_temp_dir(temp_root.path());
        let service = BackupService::with_registry(config, test_registry());
        Self {
            service,
            storage_root,
            restore_dir,
            temp_root,
        }
    }

    /// Register a scripted source with extra settings merged in
    pub fn scripted_source(&self, name: &str, extra: Value) -> Uuid {
        let mut settings = json!({
            "version": "14.0",
            "restoreDir": self.restore_dir.path().to_string_lossy(),
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut settings, extra) {
            for (k, v) in extra {
                base.insert(k, v);
            }
        }
        self.service
            .register_adapter_config("tests", name, AdapterCategory::Database, "scripted", settings)
            .unwrap()
            .id
    }

    /// Register a local-fs destination rooted in the harness storage dir
    pub fn local_destination(&self, name: &str) -> Uuid {
        self.service
            .register_adapter_config(
                "tests",
                name,
                AdapterCategory::Storage,
                "local-fs",
                json!({ "root": self.storage_root.path().to_string_lossy() }),
            )
            .unwrap()
            .id
    }

    /// A job spec over the given source/destination with sane defaults
    pub fn job_spec(&self, name: &str, source_id: Uuid, destination_id: Uuid) -> JobSpec {
        JobSpec {
            name: name.into(),
            cron: "0 0 3 * * *".into(),
            source_id,
            destination_id,
            encryption_profile_id: None,
            compression: dbackup::crypto::CompressionMode::None,
            retention: dbackup::retention::RetentionPolicy::None,
            notification_ids: vec![],
            enabled: true,
        }
    }

    /// Poll an execution until it reaches a terminal status
    pub async fn wait_terminal(&self, execution_id: Uuid) -> dbackup::execution::Execution {
        use dbackup::execution::ExecutionStatus;
        for _ in 0..200 {
            if let Some(execution) = self.service.get_execution(execution_id, true) {
                if matches!(
                    execution.status,
                    ExecutionStatus::Success | ExecutionStatus::Failed
                ) {
                    return execution;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("execution {} never reached a terminal state", execution_id);
    }

    /// Number of scratch directories still present under the temp root
    pub fn scratch_leftovers(&self) -> usize {
        std::fs::read_dir(self.temp_root.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}
