//! Execution records: the persisted state machine for one backup or
//! restore run.
//!
//! An execution is created `Pending`, flips `Running` at admission, and
//! terminates at `Success` or `Failed`. Every pipeline stage appends a
//! structured log entry so progress can be followed live. Records are an
//! audit trail: the engine never deletes them.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Kind of run an execution tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionKind {
    /// A backup pipeline
    Backup,
    /// A restore pipeline
    Restore,
}

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Created, waiting for an admission slot
    Pending,
    /// Admitted; a pipeline is driving it
    Running,
    /// Terminal: the pipeline completed
    Success,
    /// Terminal: a stage failed; the error field holds the trigger
    Failed,
}

/// Pipeline stage labels, shared by the backup and restore paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Resolve configs and adapters, probe the source
    Prepare,
    /// Produce the dump
    Dump,
    /// Apply the compression codec
    Compress,
    /// Apply the encryption codec
    Encrypt,
    /// Move the artifact to the destination
    Upload,
    /// Rotate old artifacts
    Retention,
    /// Emit notifications
    Notify,
    /// Remove local scratch files
    Cleanup,
    /// Fetch the artifact from the destination
    Download,
    /// Decrypt and decompress the artifact
    Decode,
    /// Feed the dump back into the target
    Restore,
}

impl Stage {
    /// Stable label used in logs and error messages
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Dump => "dump",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
            Stage::Upload => "upload",
            Stage::Retention => "retention",
            Stage::Notify => "notify",
            Stage::Cleanup => "cleanup",
            Stage::Download => "download",
            Stage::Decode => "decode",
            Stage::Restore => "restore",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Progress information
    Info,
    /// Something degraded but the run continues
    Warn,
    /// The failure that terminated the run
    Error,
}

/// One structured, append-only log entry on an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Stage the entry belongs to, if any
    pub stage: Option<Stage>,
    /// Human-readable message
    pub message: String,
    /// Structured extras
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One backup or restore run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Record id
    pub id: Uuid,
    /// Job this run belongs to; `None` for manual runs
    pub job_id: Option<Uuid>,
    /// Backup or restore
    pub kind: ExecutionKind,
    /// Lifecycle state
    pub status: ExecutionStatus,
    /// When the record was created
    pub started_at: DateTime<Utc>,
    /// When the run terminated
    pub ended_at: Option<DateTime<Utc>>,
    /// Coarse progress, 0-100
    pub progress: u8,
    /// Stage currently executing
    pub stage: Option<Stage>,
    /// Append-only structured log
    pub logs: Vec<ExecutionLogEntry>,
    /// Pipeline-written metadata (artifact path, recovered profile id)
    pub metadata: Value,
    /// The error that terminated a failed run
    pub error: Option<String>,
}

/// In-memory execution store. Single-record upserts by id; no cross-record
/// locking.
#[derive(Default)]
pub struct ExecutionStore {
    records: DashMap<Uuid, Execution>,
}

impl ExecutionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `Pending` execution and return a snapshot of it
    pub fn create(&self, kind: ExecutionKind, job_id: Option<Uuid>) -> Execution {
        let execution = Execution {
            id: Uuid::new_v4(),
            job_id,
            kind,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            progress: 0,
            stage: None,
            logs: Vec::new(),
            metadata: Value::Object(Default::default()),
            error: None,
        };
        self.records.insert(execution.id, execution.clone());
        execution
    }

    /// Snapshot an execution
    pub fn get(&self, id: Uuid) -> Option<Execution> {
        self.records.get(&id).map(|r| r.clone())
    }

    /// All executions, newest first
    pub fn list(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    /// Flip a pending execution to running
    pub fn mark_running(&self, id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.status = ExecutionStatus::Running;
        }
    }

    /// Enter a stage: updates the stage label and progress, logs the
    /// transition
    pub fn enter_stage(&self, id: Uuid, stage: Stage, progress: u8) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.stage = Some(stage);
            record.progress = progress;
            record.logs.push(ExecutionLogEntry {
                timestamp: Utc::now(),
                level: LogLevel::Info,
                stage: Some(stage),
                message: format!("entering stage {}", stage.label()),
                details: None,
            });
        }
        debug!(execution = %id, stage = stage.label(), "stage transition");
    }

    /// Append a structured log entry
    pub fn log(
        &self,
        id: Uuid,
        level: LogLevel,
        stage: Option<Stage>,
        message: impl Into<String>,
        details: Option<Value>,
    ) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.logs.push(ExecutionLogEntry {
                timestamp: Utc::now(),
                level,
                stage,
                message: message.into(),
                details,
            });
        }
    }

    /// Merge a key into the execution's metadata object
    pub fn set_metadata(&self, id: Uuid, key: &str, value: Value) {
        if let Some(mut record) = self.records.get_mut(&id) {
            if let Value::Object(map) = &mut record.metadata {
                map.insert(key.to_string(), value);
            }
        }
    }

    /// Terminate a run successfully
    pub fn finish_success(&self, id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.status = ExecutionStatus::Success;
            record.progress = 100;
            record.stage = None;
            record.ended_at = Some(Utc::now());
        }
    }

    /// Terminate a run with the triggering error preserved
    pub fn finish_failure(&self, id: Uuid, error: impl Into<String>) {
        let error = error.into();
        if let Some(mut record) = self.records.get_mut(&id) {
            record.status = ExecutionStatus::Failed;
            record.ended_at = Some(Utc::now());
            record.error = Some(error.clone());
            let stage = record.stage;
            record.logs.push(ExecutionLogEntry {
                timestamp: Utc::now(),
                level: LogLevel::Error,
                stage,
                message: error,
                details: None,
            });
        }
    }

    /// Number of executions currently `Running`
    pub fn running_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == ExecutionStatus::Running)
            .count()
    }

    /// Reconcile executions stuck `Running` longer than `threshold`
    /// (process died mid-pipeline). Called once at engine startup.
    pub fn reconcile_stale(&self, threshold: Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - threshold;
        let mut reconciled = Vec::new();
        for mut record in self.records.iter_mut() {
            if record.status == ExecutionStatus::Running && record.started_at < cutoff {
                record.status = ExecutionStatus::Failed;
                record.ended_at = Some(Utc::now());
                record.error = Some("reconciled: execution was stale after engine restart".into());
                reconciled.push(record.id);
            }
        }
        if !reconciled.is_empty() {
            warn!(count = reconciled.len(), "reconciled stale running executions");
        }
        reconciled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let store = ExecutionStore::new();
        let execution = store.create(ExecutionKind::Backup, None);
        assert_eq!(execution.status, ExecutionStatus::Pending);

        store.mark_running(execution.id);
        store.enter_stage(execution.id, Stage::Dump, 20);
        store.log(execution.id, LogLevel::Info, Some(Stage::Dump), "dumping", None);
        store.finish_success(execution.id);

        let record = store.get(execution.id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.progress, 100);
        assert!(record.ended_at.is_some());
        assert!(record.logs.len() >= 2);
    }

    #[test]
    fn test_failure_preserves_error_and_appends_log() {
        let store = ExecutionStore::new();
        let execution = store.create(ExecutionKind::Restore, None);
        store.mark_running(execution.id);
        store.enter_stage(execution.id, Stage::Decode, 40);
        store.finish_failure(execution.id, "Integrity error: chunk authentication failed");

        let record = store.get(execution.id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("Integrity"));
        assert_eq!(record.logs.last().unwrap().level, LogLevel::Error);
    }

    #[test]
    fn test_reconcile_stale_marks_only_old_running() {
        let store = ExecutionStore::new();
        let stale = store.create(ExecutionKind::Backup, None);
        store.mark_running(stale.id);
        // age the record past the threshold
        if let Some(mut record) = store.records.get_mut(&stale.id) {
            record.started_at = Utc::now() - Duration::hours(3);
        }
        let fresh = store.create(ExecutionKind::Backup, None);
        store.mark_running(fresh.id);

        let reconciled = store.reconcile_stale(Duration::hours(1));
        assert_eq!(reconciled, vec![stale.id]);
        assert_eq!(store.get(stale.id).unwrap().status, ExecutionStatus::Failed);
        assert_eq!(store.get(fresh.id).unwrap().status, ExecutionStatus::Running);
    }
}
