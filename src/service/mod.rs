//! The service facade consumed by the dashboard/CLI layer.
//!
//! All job mutations flow through here so that every create/update/delete
//! rebuilds the scheduler and emits an audit record. Trigger and restore
//! calls return an execution id immediately; the pipelines run in the
//! background behind the admission queue and are followed by polling the
//! execution record.

use crate::adapters::{AdapterCategory, AdapterRegistry, NotificationDispatcher};
use crate::execution::{Execution, ExecutionStore};
use crate::jobs::{
    AdapterConfig, AdapterConfigStore, EncryptionProfile, EncryptionProfileStore, Job, JobSpec,
    JobStore,
};
use crate::queue::QueueManager;
use crate::restore::{RestoreRequest, RestoreService};
use crate::runner::{self, PipelineDeps};
use crate::scheduler::{normalize_cron, Scheduler};
use crate::security::{ApiKeyService, AuditAction, AuditTrail};
use crate::{DbackupError, Result};
use cron::Schedule;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on simultaneously running pipelines
    pub max_concurrent_jobs: usize,
    /// Root directory for per-execution scratch space
    pub temp_dir: PathBuf,
    /// Running executions older than this are reconciled to failed at
    /// startup
    pub stale_execution_threshold: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: num_cpus::get().max(1),
            temp_dir: std::env::temp_dir().join("dbackup"),
            stale_execution_threshold: chrono::Duration::hours(1),
        }
    }
}

impl EngineConfig {
    /// Set the concurrency bound
    pub fn with_max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.max_concurrent_jobs = limit.max(1);
        self
    }

    /// Set the scratch root
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Set the staleness threshold for startup reconciliation
    pub fn with_stale_execution_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.stale_execution_threshold = threshold;
        self
    }
}

/// A job joined with the display names of its adapter configs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    /// The job record
    #[serde(flatten)]
    pub job: Job,
    /// Name of the source adapter config, if it still exists
    pub source_name: Option<String>,
    /// Name of the destination adapter config, if it still exists
    pub destination_name: Option<String>,
}

/// The backup/restore orchestration service
pub struct BackupService {
    deps: Arc<PipelineDeps>,
    queue: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    restores: RestoreService,
    audit: AuditTrail,
    api_keys: ApiKeyService,
}

impl BackupService {
    /// Build the engine with the built-in adapter registry
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, AdapterRegistry::builtin())
    }

    /// Build the engine with a custom adapter registry: registry, stores,
    /// queue, scheduler, background workers. Reconciles stale executions
    /// left over from a previous process.
    pub fn with_registry(config: EngineConfig, registry: AdapterRegistry) -> Self {
        let jobs = Arc::new(JobStore::new());
        let deps = Arc::new(PipelineDeps {
            registry: Arc::new(registry),
            jobs: Arc::clone(&jobs),
            configs: Arc::new(AdapterConfigStore::new()),
            profiles: Arc::new(EncryptionProfileStore::new()),
            executions: Arc::new(ExecutionStore::new()),
            notifier: NotificationDispatcher::start(),
            temp_root: config.temp_dir.clone(),
        });

        deps.executions
            .reconcile_stale(config.stale_execution_threshold);

        let queue = Arc::new(QueueManager::new(config.max_concurrent_jobs));
        let (scheduler, mut trigger_rx) = Scheduler::new(jobs);
        scheduler.refresh();

        // scheduler-fired triggers run through the same path as manual ones
        {
            let deps = Arc::clone(&deps);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(job_id) = trigger_rx.recv().await {
                    if let Err(e) = submit_backup(&deps, &queue, job_id) {
                        tracing::warn!(job = %job_id, "scheduled trigger dropped: {}", e);
                    }
                }
            });
        }

        let restores = RestoreService::new(Arc::clone(&deps), Arc::clone(&queue));
        info!(
            max_concurrent = queue.limit(),
            "backup service started"
        );

        Self {
            deps,
            queue,
            scheduler,
            restores,
            audit: AuditTrail::start(),
            api_keys: ApiKeyService::new(),
        }
    }

    // ------------------------------------------------------------------
    // Adapter configs & encryption profiles
    // ------------------------------------------------------------------

    /// Register a backend configuration. The adapter id must be known and
    /// the payload must pass the adapter's validation; both failures are
    /// configuration errors raised here, never mid-pipeline.
    pub fn register_adapter_config(
        &self,
        actor: &str,
        name: &str,
        category: AdapterCategory,
        adapter_id: &str,
        settings: serde_json::Value,
    ) -> Result<AdapterConfig> {
        self.deps
            .registry
            .validate_config(category, adapter_id, &settings)?;
        let config = self
            .deps
            .configs
            .insert(name, category, adapter_id, settings);
        self.audit.record(
            AuditAction::Create,
            "adapter_config",
            config.id,
            actor,
            json!({ "name": config.name, "adapter": config.adapter }),
        );
        Ok(config)
    }

    /// Delete a backend configuration that no job references
    pub fn delete_adapter_config(&self, actor: &str, id: Uuid) -> Result<()> {
        let in_use = self.deps.jobs.list().into_iter().any(|job| {
            job.source_id == id
                || job.destination_id == id
                || job.notification_ids.contains(&id)
        });
        if in_use {
            return Err(DbackupError::Configuration(
                "adapter config is referenced by a job".into(),
            ));
        }
        self.deps
            .configs
            .remove(id)
            .ok_or_else(|| DbackupError::NotFound("adapter config not found".into()))?;
        self.audit
            .record(AuditAction::Delete, "adapter_config", id, actor, json!({}));
        Ok(())
    }

    /// All registered configs, newest first
    pub fn get_adapter_configs(&self) -> Vec<AdapterConfig> {
        self.deps.configs.list()
    }

    /// Register an encryption profile
    pub fn create_encryption_profile(
        &self,
        actor: &str,
        name: &str,
        master_key: Vec<u8>,
    ) -> Result<EncryptionProfile> {
        if master_key.len() < 16 {
            return Err(DbackupError::Configuration(
                "master key must be at least 16 bytes".into(),
            ));
        }
        let profile = self.deps.profiles.insert(name, master_key);
        self.audit.record(
            AuditAction::Create,
            "encryption_profile",
            profile.id,
            actor,
            json!({ "name": profile.name }),
        );
        Ok(profile)
    }

    /// Delete an encryption profile. Old artifacts encrypted under it
    /// remain recoverable only through the smart-recovery sweep.
    pub fn delete_encryption_profile(&self, actor: &str, id: Uuid) -> Result<()> {
        self.deps
            .profiles
            .remove(id)
            .ok_or_else(|| DbackupError::NotFound("encryption profile not found".into()))?;
        self.audit
            .record(AuditAction::Delete, "encryption_profile", id, actor, json!({}));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Create a job, rebuild the scheduler, emit an audit record
    pub fn create_job(&self, actor: &str, spec: JobSpec) -> Result<Job> {
        self.validate_job_spec(&spec)?;
        let job = self.deps.jobs.insert(spec);
        self.scheduler.refresh();
        self.audit.record(
            AuditAction::Create,
            "job",
            job.id,
            actor,
            json!({ "name": job.name, "cron": job.cron }),
        );
        Ok(job)
    }

    /// Update a job, rebuild the scheduler, emit an audit record
    pub fn update_job(&self, actor: &str, id: Uuid, spec: JobSpec) -> Result<Job> {
        self.validate_job_spec(&spec)?;
        let job = self
            .deps
            .jobs
            .update(id, spec)
            .ok_or_else(|| DbackupError::NotFound("job not found".into()))?;
        self.scheduler.refresh();
        self.audit.record(
            AuditAction::Update,
            "job",
            job.id,
            actor,
            json!({ "name": job.name, "cron": job.cron }),
        );
        Ok(job)
    }

    /// Delete a job, rebuild the scheduler, emit an audit record
    pub fn delete_job(&self, actor: &str, id: Uuid) -> Result<()> {
        let job = self
            .deps
            .jobs
            .remove(id)
            .ok_or_else(|| DbackupError::NotFound("job not found".into()))?;
        self.scheduler.refresh();
        self.audit.record(
            AuditAction::Delete,
            "job",
            job.id,
            actor,
            json!({ "name": job.name }),
        );
        Ok(())
    }

    /// Jobs ordered by creation date descending, joined with their
    /// adapter config names
    pub fn get_jobs(&self) -> Vec<JobView> {
        self.deps
            .jobs
            .list()
            .into_iter()
            .map(|job| {
                let source_name = self.deps.configs.get(job.source_id).map(|c| c.name);
                let destination_name =
                    self.deps.configs.get(job.destination_id).map(|c| c.name);
                JobView {
                    job,
                    source_name,
                    destination_name,
                }
            })
            .collect()
    }

    /// Trigger a job now. Returns the execution id immediately; the
    /// pipeline queues behind the admission limit.
    pub fn trigger_job(&self, actor: &str, job_id: Uuid) -> Result<Uuid> {
        let execution_id = submit_backup(&self.deps, &self.queue, job_id)?;
        self.audit.record(
            AuditAction::Execute,
            "job",
            job_id,
            actor,
            json!({ "executionId": execution_id }),
        );
        Ok(execution_id)
    }

    // ------------------------------------------------------------------
    // Restore & executions
    // ------------------------------------------------------------------

    /// Start a restore. Pre-flight failures return synchronously; on
    /// acceptance the execution id is returned immediately.
    pub async fn restore(&self, actor: &str, request: RestoreRequest) -> Result<Uuid> {
        let file = request.file.clone();
        let execution_id = self.restores.restore(request).await?;
        self.audit.record(
            AuditAction::Execute,
            "restore",
            execution_id,
            actor,
            json!({ "file": file }),
        );
        Ok(execution_id)
    }

    /// Fetch an execution; `include_logs=false` strips the log tail
    pub fn get_execution(&self, id: Uuid, include_logs: bool) -> Option<Execution> {
        let mut execution = self.deps.executions.get(id)?;
        if !include_logs {
            execution.logs.clear();
        }
        Some(execution)
    }

    /// All executions, newest first
    pub fn get_executions(&self) -> Vec<Execution> {
        self.deps.executions.list()
    }

    // ------------------------------------------------------------------
    // Engine controls
    // ------------------------------------------------------------------

    /// Change the admission limit; running pipelines are unaffected
    pub fn set_max_concurrent_jobs(&self, limit: usize) {
        self.queue.set_limit(limit);
    }

    /// Number of currently running pipelines
    pub fn running_pipelines(&self) -> usize {
        self.queue.running()
    }

    /// The API key service
    pub fn api_keys(&self) -> &ApiKeyService {
        &self.api_keys
    }

    /// The audit trail
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    fn validate_job_spec(&self, spec: &JobSpec) -> Result<()> {
        Schedule::from_str(&normalize_cron(&spec.cron))
            .map_err(|e| DbackupError::Schedule(format!("invalid cron {:?}: {}", spec.cron, e)))?;

        let source = self
            .deps
            .configs
            .get(spec.source_id)
            .ok_or_else(|| DbackupError::Configuration("source config not found".into()))?;
        if source.category != AdapterCategory::Database {
            return Err(DbackupError::Configuration(format!(
                "config {} is not a database source",
                source.name
            )));
        }
        let destination = self
            .deps
            .configs
            .get(spec.destination_id)
            .ok_or_else(|| DbackupError::Configuration("destination config not found".into()))?;
        if destination.category != AdapterCategory::Storage {
            return Err(DbackupError::Configuration(format!(
                "config {} is not a storage destination",
                destination.name
            )));
        }
        for id in &spec.notification_ids {
            let config = self.deps.configs.get(*id).ok_or_else(|| {
                DbackupError::Configuration("notification config not found".into())
            })?;
            if config.category != AdapterCategory::Notification {
                return Err(DbackupError::Configuration(format!(
                    "config {} is not a notification channel",
                    config.name
                )));
            }
        }
        if let Some(profile_id) = spec.encryption_profile_id {
            if self.deps.profiles.get(profile_id).is_none() {
                return Err(DbackupError::Configuration(
                    "encryption profile not found".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Create an execution for `job_id` and queue its pipeline
fn submit_backup(
    deps: &Arc<PipelineDeps>,
    queue: &Arc<QueueManager>,
    job_id: Uuid,
) -> Result<Uuid> {
    let job = deps
        .jobs
        .get(job_id)
        .ok_or_else(|| DbackupError::NotFound("job not found".into()))?;
    let execution = deps
        .executions
        .create(crate::execution::ExecutionKind::Backup, Some(job_id));
    let deps = Arc::clone(deps);
    let execution_id = execution.id;
    queue.submit(async move {
        runner::run_backup(deps, job, execution_id).await;
    });
    Ok(execution_id)
}
