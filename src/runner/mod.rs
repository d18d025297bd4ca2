//! The backup pipeline.
//!
//! One invocation drives a single execution through
//! prepare → dump → compress → encrypt → upload → retention → notify,
//! with cleanup of local scratch files guaranteed on every exit path. A
//! stage failure flips the execution to `Failed` with the triggering
//! error preserved, then still runs the failure notification and cleanup.

use crate::adapters::{
    AdapterRegistry, EventKind, NotificationDispatcher, NotificationEvent,
};
use crate::artifact::{self, Sidecar, SidecarEncryption};
use crate::crypto::{self, CompressionMode};
use crate::execution::{ExecutionStore, LogLevel, Stage};
use crate::jobs::{AdapterConfigStore, EncryptionProfileStore, Job, JobStore};
use crate::retention;
use crate::{DbackupError, Result};
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Shared dependencies handed to every pipeline
pub struct PipelineDeps {
    /// Adapter registry
    pub registry: Arc<AdapterRegistry>,
    /// Job store
    pub jobs: Arc<JobStore>,
    /// Adapter config store
    pub configs: Arc<AdapterConfigStore>,
    /// Encryption profile store
    pub profiles: Arc<EncryptionProfileStore>,
    /// Execution store
    pub executions: Arc<ExecutionStore>,
    /// Fire-and-forget notification dispatcher
    pub notifier: NotificationDispatcher,
    /// Root directory for per-execution scratch space
    pub temp_root: PathBuf,
}

impl PipelineDeps {
    /// Create a scratch directory for one execution
    pub(crate) fn scratch_dir(&self) -> std::io::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.temp_root)?;
        tempfile::Builder::new()
            .prefix("dbackup-")
            .tempdir_in(&self.temp_root)
    }

    /// Deliver an event to every notification target of a job, best-effort
    pub(crate) fn notify(&self, notification_ids: &[Uuid], event: NotificationEvent) {
        for id in notification_ids {
            let Some(config) = self.configs.get(*id) else {
                warn!(config = %id, "notification config vanished; skipping");
                continue;
            };
            match self.registry.notification(&config.adapter) {
                Ok(adapter) => {
                    self.notifier
                        .dispatch(adapter, config.settings.clone(), event.clone());
                }
                Err(e) => warn!(config = %id, "notification adapter unavailable: {}", e),
            }
        }
    }
}

fn stage_error(stage: Stage, err: impl std::fmt::Display) -> DbackupError {
    DbackupError::PipelineStage {
        stage: stage.label().to_string(),
        message: err.to_string(),
    }
}

/// SHA-256 of a file, hex-encoded
pub(crate) async fn file_checksum(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; crypto::CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await?
}

/// Drive one backup execution to a terminal state. Never returns an
/// error: failures land on the execution record.
#[instrument(skip(deps, job), fields(job = %job.name, execution = %execution_id))]
pub async fn run_backup(deps: Arc<PipelineDeps>, job: Job, execution_id: Uuid) {
    let executions = Arc::clone(&deps.executions);
    executions.mark_running(execution_id);

    let scratch = match deps.scratch_dir() {
        Ok(scratch) => scratch,
        Err(e) => {
            executions.finish_failure(execution_id, format!("cannot create scratch dir: {}", e));
            return;
        }
    };

    let result = execute_stages(&deps, &job, execution_id, scratch.path()).await;

    match result {
        Ok(()) => {
            cleanup(&executions, execution_id, scratch);
            executions.finish_success(execution_id);
            info!("backup pipeline complete");
        }
        Err(e) => {
            error!("backup pipeline failed: {}", e);
            let message = e.to_string();
            deps.notify(
                &job.notification_ids,
                NotificationEvent {
                    kind: EventKind::BackupFailed,
                    job_name: Some(job.name.clone()),
                    execution_id,
                    message: format!("backup of {} failed: {}", job.name, message),
                    timestamp: Utc::now(),
                    details: json!({ "error": message }),
                },
            );
            cleanup(&executions, execution_id, scratch);
            executions.finish_failure(execution_id, message);
        }
    }
}

/// Remove the scratch directory; runs on every exit path
fn cleanup(executions: &ExecutionStore, execution_id: Uuid, scratch: tempfile::TempDir) {
    executions.enter_stage(execution_id, Stage::Cleanup, 97);
    let path = scratch.path().to_path_buf();
    match scratch.close() {
        Ok(()) => executions.log(
            execution_id,
            LogLevel::Info,
            Some(Stage::Cleanup),
            "scratch directory removed",
            None,
        ),
        Err(e) => executions.log(
            execution_id,
            LogLevel::Warn,
            Some(Stage::Cleanup),
            format!("scratch cleanup failed for {}: {}", path.display(), e),
            None,
        ),
    }
}

async fn execute_stages(
    deps: &Arc<PipelineDeps>,
    job: &Job,
    execution_id: Uuid,
    scratch: &Path,
) -> Result<()> {
    let executions = &deps.executions;

    // Prepare: resolve configs and adapters, probe the source
    executions.enter_stage(execution_id, Stage::Prepare, 5);
    let source = deps
        .configs
        .get(job.source_id)
        .ok_or_else(|| stage_error(Stage::Prepare, "source config not found"))?;
    let destination = deps
        .configs
        .get(job.destination_id)
        .ok_or_else(|| stage_error(Stage::Prepare, "destination config not found"))?;
    let database = deps
        .registry
        .database(&source.adapter)
        .map_err(|e| stage_error(Stage::Prepare, e))?;
    let storage = deps
        .registry
        .storage(&destination.adapter)
        .map_err(|e| stage_error(Stage::Prepare, e))?;
    let connection = database
        .test(&source.settings)
        .await
        .map_err(|e| stage_error(Stage::Prepare, e))?;
    executions.log(
        execution_id,
        LogLevel::Info,
        Some(Stage::Prepare),
        format!("{} reachable, version {}", database.display_name(), connection.version),
        None,
    );

    // Dump
    executions.enter_stage(execution_id, Stage::Dump, 25);
    let created_at = Utc::now();
    let base_name = artifact::artifact_base_name(created_at, database.file_extension());
    let dump_path = scratch.join(&base_name);
    let dump = database
        .dump(&source.settings, &dump_path)
        .await
        .map_err(|e| stage_error(Stage::Dump, e))?;
    for line in &dump.logs {
        executions.log(execution_id, LogLevel::Info, Some(Stage::Dump), line, None);
    }

    // Compress
    let mut upload_path = dump_path.clone();
    if job.compression != CompressionMode::None {
        executions.enter_stage(execution_id, Stage::Compress, 40);
        let suffix = job.compression.suffix().unwrap_or_default();
        let compressed = scratch.join(format!("{}{}", base_name, suffix));
        let (src, dest, mode) = (upload_path.clone(), compressed.clone(), job.compression);
        tokio::task::spawn_blocking(move || crypto::compress_file(&src, &dest, mode))
            .await?
            .map_err(|e| stage_error(Stage::Compress, e))?;
        executions.log(
            execution_id,
            LogLevel::Info,
            Some(Stage::Compress),
            format!("compressed with {}", job.compression),
            None,
        );
        upload_path = compressed;
    }

    // Encrypt
    let mut encryption: Option<SidecarEncryption> = None;
    if let Some(profile_id) = job.encryption_profile_id {
        executions.enter_stage(execution_id, Stage::Encrypt, 55);
        let profile = deps.profiles.get(profile_id).ok_or_else(|| {
            stage_error(
                Stage::Encrypt,
                format!("encryption profile {} not found", profile_id),
            )
        })?;
        let encrypted = PathBuf::from(format!("{}.enc", upload_path.display()));
        let (src, dest) = (upload_path.clone(), encrypted.clone());
        let key = profile.master_key.clone();
        let params = tokio::task::spawn_blocking(move || crypto::encrypt_file(&src, &dest, &key))
            .await?
            .map_err(|e| stage_error(Stage::Encrypt, e))?;
        encryption = Some(SidecarEncryption::from_params(profile.id, &params));
        executions.log(
            execution_id,
            LogLevel::Info,
            Some(Stage::Encrypt),
            format!("encrypted with profile {}", profile.name),
            None,
        );
        upload_path = encrypted;
    }

    // Upload artifact, plus the sidecar whenever it is needed to decode
    executions.enter_stage(execution_id, Stage::Upload, 75);
    let dir = artifact::artifact_dir(Some(&job.name));
    let remote_path = artifact::remote_artifact_path(
        &dir,
        &base_name,
        job.compression,
        encryption.is_some(),
    );
    storage
        .upload(&destination.settings, &remote_path, &upload_path)
        .await
        .map_err(|e| stage_error(Stage::Upload, e))?;
    executions.set_metadata(execution_id, "artifactPath", json!(remote_path));

    if encryption.is_some() || dump.databases.len() > 1 {
        let sidecar = Sidecar {
            engine_version: connection.version.clone(),
            databases: dump.databases.clone(),
            compression: job.compression,
            encryption,
            checksum: Some(file_checksum(&upload_path).await?),
            created_at,
        };
        let sidecar_local = scratch.join("artifact.meta.json");
        tokio::fs::write(&sidecar_local, serde_json::to_vec_pretty(&sidecar)?).await?;
        storage
            .upload(
                &destination.settings,
                &artifact::sidecar_path(&remote_path),
                &sidecar_local,
            )
            .await
            .map_err(|e| stage_error(Stage::Upload, e))?;
    }
    executions.log(
        execution_id,
        LogLevel::Info,
        Some(Stage::Upload),
        format!("uploaded {}", remote_path),
        None,
    );

    // Retention runs synchronously before the record flips Success so its
    // outcome stays visible on this execution
    executions.enter_stage(execution_id, Stage::Retention, 85);
    match retention::apply(
        &job.retention,
        storage.as_ref(),
        &destination.settings,
        &dir,
        Utc::now(),
    )
    .await
    {
        Ok(outcome) => {
            if !outcome.deleted.is_empty() {
                executions.log(
                    execution_id,
                    LogLevel::Info,
                    Some(Stage::Retention),
                    format!("rotated out {} artifacts", outcome.deleted.len()),
                    Some(json!({ "deleted": outcome.deleted })),
                );
            }
        }
        Err(e) => {
            // the artifact is already safe; surface the failure, keep going
            executions.log(
                execution_id,
                LogLevel::Warn,
                Some(Stage::Retention),
                format!("retention failed: {}", e),
                None,
            );
        }
    }

    // Notify success, best-effort
    executions.enter_stage(execution_id, Stage::Notify, 92);
    deps.notify(
        &job.notification_ids,
        NotificationEvent {
            kind: EventKind::BackupSucceeded,
            job_name: Some(job.name.clone()),
            execution_id,
            message: format!("backup of {} complete", job.name),
            timestamp: Utc::now(),
            details: json!({ "artifactPath": remote_path }),
        },
    );

    Ok(())
}
