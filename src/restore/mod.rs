//! The restore pipeline: pre-flight checks, version compatibility guard,
//! artifact decode, smart key recovery, and the database mapping applied
//! on the way back into the target.
//!
//! Pre-flight and the version guard run before any execution record
//! exists, so those failures return synchronously to the caller. Once the
//! execution is created the call returns its id immediately and the
//! pipeline continues in the background behind the admission queue.

use crate::adapters::{
    DatabaseAdapter, DatabaseMapping, PrivilegedAuth, RestoreTargetOptions,
};
use crate::artifact::{self, Sidecar};
use crate::crypto::{self, CompressionMode, CryptoError, EncryptionParams};
use crate::execution::{ExecutionKind, LogLevel, Stage};
use crate::jobs::AdapterConfig;
use crate::queue::QueueManager;
use crate::runner::PipelineDeps;
use crate::{DbackupError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Caller input for one restore
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    /// Storage config holding the artifact
    pub storage_config_id: Uuid,
    /// Remote artifact path ("nightly/2026-03-14T09-26-53Z.sql.gz.enc")
    pub file: String,
    /// Database config to restore into
    pub target_source_id: Uuid,
    /// Shorthand mapping for single-database artifacts
    #[serde(default)]
    pub target_database_name: Option<String>,
    /// Full per-database mapping for multi-database artifacts
    #[serde(default)]
    pub database_mapping: Vec<DatabaseMapping>,
    /// One-shot elevated credentials for a privileged retry
    #[serde(default)]
    pub privileged_auth: Option<PrivilegedAuth>,
}

/// Restore orchestrator
pub struct RestoreService {
    deps: Arc<PipelineDeps>,
    queue: Arc<QueueManager>,
}

struct RestoreContext {
    request: RestoreRequest,
    storage_config: AdapterConfig,
    target_config: AdapterConfig,
    sidecar: Option<Sidecar>,
}

impl RestoreService {
    /// Create the restore service over shared pipeline dependencies
    pub fn new(deps: Arc<PipelineDeps>, queue: Arc<QueueManager>) -> Self {
        Self { deps, queue }
    }

    /// Start a restore. Pre-flight failures (missing target, refused
    /// prepare, version incompatibility) return here synchronously; once
    /// the execution exists its id is returned immediately and all later
    /// failures land on the record.
    #[instrument(skip(self, request), fields(file = %request.file))]
    pub async fn restore(&self, request: RestoreRequest) -> Result<Uuid> {
        let deps = &self.deps;

        let storage_config = deps
            .configs
            .get(request.storage_config_id)
            .ok_or_else(|| DbackupError::NotFound("storage config not found".into()))?;
        let target_config = deps
            .configs
            .get(request.target_source_id)
            .ok_or_else(|| DbackupError::NotFound("target source not found".into()))?;

        let storage = deps.registry.storage(&storage_config.adapter)?;
        let database = deps.registry.database(&target_config.adapter)?;

        database.prepare_restore(&target_config.settings).await?;
        let connection = database.test(&target_config.settings).await?;

        let sidecar = match storage
            .read(
                &storage_config.settings,
                &artifact::sidecar_path(&request.file),
            )
            .await?
        {
            Some(bytes) => Some(serde_json::from_slice::<Sidecar>(&bytes)?),
            None => None,
        };

        // one-directional guard: a backup from a newer engine never goes
        // into an older target; older-or-equal always proceeds
        if let Some(sidecar) = &sidecar {
            check_version_compat(&sidecar.engine_version, &connection.version)?;
        }

        if sidecar.is_none() && request.file.ends_with(".enc") {
            return Err(DbackupError::Configuration(format!(
                "encrypted artifact {} has no sidecar; cannot determine decode parameters",
                request.file
            )));
        }

        let execution = deps.executions.create(ExecutionKind::Restore, None);
        deps.executions
            .set_metadata(execution.id, "artifactPath", json!(request.file));
        deps.executions.set_metadata(
            execution.id,
            "targetVersion",
            json!(connection.version),
        );
        deps.executions.log(
            execution.id,
            LogLevel::Info,
            None,
            format!("restore of {} into {} accepted", request.file, target_config.name),
            None,
        );

        let context = RestoreContext {
            request,
            storage_config,
            target_config,
            sidecar,
        };
        let deps = Arc::clone(&self.deps);
        let execution_id = execution.id;
        self.queue.submit(async move {
            run_restore(deps, context, execution_id).await;
        });

        Ok(execution_id)
    }
}

/// Drive one restore execution to a terminal state
async fn run_restore(deps: Arc<PipelineDeps>, context: RestoreContext, execution_id: Uuid) {
    let executions = Arc::clone(&deps.executions);
    executions.mark_running(execution_id);

    let scratch = match deps.scratch_dir() {
        Ok(scratch) => scratch,
        Err(e) => {
            executions.finish_failure(execution_id, format!("cannot create scratch dir: {}", e));
            return;
        }
    };

    let result = restore_stages(&deps, &context, execution_id, scratch.path()).await;

    // cleanup runs on every exit path
    executions.enter_stage(execution_id, Stage::Cleanup, 97);
    if let Err(e) = scratch.close() {
        executions.log(
            execution_id,
            LogLevel::Warn,
            Some(Stage::Cleanup),
            format!("scratch cleanup failed: {}", e),
            None,
        );
    }

    match result {
        Ok(()) => {
            executions.finish_success(execution_id);
            info!(execution = %execution_id, "restore pipeline complete");
        }
        Err(e) => {
            if matches!(e, DbackupError::PrivilegedAuthRequired(_)) {
                // signal the caller that a resubmission with elevated
                // credentials can succeed
                executions.set_metadata(execution_id, "privilegedAuthRequired", json!(true));
            }
            error!(execution = %execution_id, "restore pipeline failed: {}", e);
            executions.finish_failure(execution_id, e.to_string());
        }
    }
}

async fn restore_stages(
    deps: &Arc<PipelineDeps>,
    context: &RestoreContext,
    execution_id: Uuid,
    scratch: &Path,
) -> Result<()> {
    let executions = &deps.executions;
    let storage = deps.registry.storage(&context.storage_config.adapter)?;
    let database = deps.registry.database(&context.target_config.adapter)?;

    // Download
    executions.enter_stage(execution_id, Stage::Download, 15);
    let file_name = context
        .request
        .file
        .rsplit('/')
        .next()
        .unwrap_or("artifact");
    let downloaded = scratch.join(file_name);
    storage
        .download(&context.storage_config.settings, &context.request.file, &downloaded)
        .await?;

    // Decode: the sidecar, when present, fully determines the pipeline
    executions.enter_stage(execution_id, Stage::Decode, 35);
    let decoded = decode_artifact(
        deps,
        execution_id,
        database.as_ref(),
        context,
        scratch,
        &downloaded,
    )
    .await?;

    // Restore into the target
    executions.enter_stage(execution_id, Stage::Restore, 70);
    let options = RestoreTargetOptions {
        mapping: build_mapping(context),
        privileged: context.request.privileged_auth.clone(),
    };
    let output = database
        .restore(&context.target_config.settings, &decoded, &options)
        .await?;
    for line in &output.logs {
        executions.log(execution_id, LogLevel::Info, Some(Stage::Restore), line, None);
    }

    Ok(())
}

/// Resolve the effective database mapping for this request
fn build_mapping(context: &RestoreContext) -> Vec<DatabaseMapping> {
    if !context.request.database_mapping.is_empty() {
        return context.request.database_mapping.clone();
    }
    if let Some(target_name) = &context.request.target_database_name {
        // shorthand for single-database artifacts
        let original = context
            .sidecar
            .as_ref()
            .and_then(|s| s.databases.first().cloned());
        if let Some(original) = original {
            return vec![DatabaseMapping {
                original,
                target: target_name.clone(),
                selected: true,
            }];
        }
    }
    Vec::new()
}

/// Decrypt (resolving the key, falling back to smart recovery) and
/// decompress the downloaded artifact. Returns the plaintext dump path.
async fn decode_artifact(
    deps: &Arc<PipelineDeps>,
    execution_id: Uuid,
    database: &dyn DatabaseAdapter,
    context: &RestoreContext,
    scratch: &Path,
    downloaded: &Path,
) -> Result<PathBuf> {
    let executions = &deps.executions;
    let (compression, encryption) = match &context.sidecar {
        Some(sidecar) => (sidecar.compression, sidecar.encryption.clone()),
        None => (artifact::compression_from_path(&context.request.file), None),
    };

    let Some(encryption) = encryption else {
        let plain = scratch.join("decoded.dump");
        let (src, dest) = (downloaded.to_path_buf(), plain.clone());
        tokio::task::spawn_blocking(move || crypto::decompress_file(&src, &dest, compression))
            .await?
            .map_err(DbackupError::from)?;
        return Ok(plain);
    };

    let params = encryption.to_params().map_err(|e| {
        DbackupError::Configuration(format!("corrupt sidecar encryption block: {}", e))
    })?;

    if let Some(profile) = deps.profiles.get(encryption.profile_id) {
        let plain = scratch.join("decoded.dump");
        decode_with_key(
            downloaded,
            scratch,
            &plain,
            profile.master_key.clone(),
            params,
            compression,
        )
        .await?;
        return Ok(plain);
    }

    // Smart recovery: the recorded profile is gone (rotated or deleted).
    // Sweep every configured profile; accept only a candidate that both
    // authenticates and yields a plausible dump for the target adapter.
    executions.log(
        execution_id,
        LogLevel::Warn,
        Some(Stage::Decode),
        format!(
            "encryption profile {} no longer exists; starting key recovery sweep",
            encryption.profile_id
        ),
        None,
    );
    let candidates = deps.profiles.list();
    let total = candidates.len();
    for (index, profile) in candidates.into_iter().enumerate() {
        let plain = scratch.join(format!("recovery_{:02}.dump", index));
        match decode_with_key(
            downloaded,
            scratch,
            &plain,
            profile.master_key.clone(),
            params.clone(),
            compression,
        )
        .await
        {
            Ok(()) => {
                let head = read_head(&plain, 1024).await?;
                if database.dump_looks_valid(&head) {
                    executions.log(
                        execution_id,
                        LogLevel::Info,
                        Some(Stage::Decode),
                        format!("recovered key using profile {} ({})", profile.name, profile.id),
                        None,
                    );
                    executions.set_metadata(
                        execution_id,
                        "recoveredProfileId",
                        json!(profile.id),
                    );
                    return Ok(plain);
                }
                warn!(profile = %profile.id, "candidate decrypted but dump is implausible");
            }
            Err(DbackupError::Integrity(_)) => {
                // expected for non-matching keys; keep sweeping
            }
            Err(e) => return Err(e),
        }
    }
    Err(DbackupError::KeyRecoveryExhausted(format!(
        "profile {} is gone and none of the {} configured profiles decrypted {}",
        encryption.profile_id, total, context.request.file
    )))
}

/// Blocking decrypt + decompress behind `spawn_blocking`
async fn decode_with_key(
    downloaded: &Path,
    scratch: &Path,
    plain: &Path,
    master_key: Vec<u8>,
    params: EncryptionParams,
    compression: CompressionMode,
) -> Result<()> {
    let downloaded = downloaded.to_path_buf();
    let decrypted = scratch.join(format!(
        "{}.dec",
        plain.file_name().unwrap_or_default().to_string_lossy()
    ));
    let plain = plain.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::result::Result<(), CryptoError> {
        crypto::decrypt_file(&downloaded, &decrypted, &master_key, &params)?;
        crypto::decompress_file(&decrypted, &plain, compression)?;
        let _ = std::fs::remove_file(&decrypted);
        Ok(())
    })
    .await?
    .map_err(DbackupError::from)
}

async fn read_head(path: &Path, len: usize) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == len {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Refuse restoring a backup produced by a strictly newer engine than the
/// target. Older-or-equal backups always proceed.
pub fn check_version_compat(backup: &str, target: &str) -> Result<()> {
    if compare_versions(backup, target) == Ordering::Greater {
        return Err(DbackupError::VersionIncompatibility {
            backup: backup.to_string(),
            target: target.to_string(),
        });
    }
    Ok(())
}

/// Numeric dotted comparison; missing components count as zero,
/// non-numeric suffixes within a component are ignored ("15.4beta" -> 15.4)
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse::<u64>()
                    .unwrap_or(0)
            })
            .collect()
    };
    let left = parse(a);
    let right = parse(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
