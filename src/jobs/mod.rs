//! Job, adapter config, and encryption profile records with their
//! in-memory stores.
//!
//! Jobs are mutated only through the service facade so that every
//! create/update/delete rebuilds the scheduler and lands in the audit
//! trail. Adapter config identity is immutable once created.

use crate::adapters::AdapterCategory;
use crate::crypto::CompressionMode;
use crate::retention::RetentionPolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A scheduled backup job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Record id
    pub id: Uuid,
    /// Display name; also the artifact directory slug
    pub name: String,
    /// Cron expression driving the schedule
    pub cron: String,
    /// Source database adapter config
    pub source_id: Uuid,
    /// Destination storage adapter config
    pub destination_id: Uuid,
    /// Encryption profile; `None` stores artifacts in the clear
    pub encryption_profile_id: Option<Uuid>,
    /// Compression applied before encryption
    pub compression: CompressionMode,
    /// Post-success rotation policy
    pub retention: RetentionPolicy,
    /// Notification adapter configs to inform about outcomes
    pub notification_ids: Vec<Uuid>,
    /// Disabled jobs keep their configuration but never fire
    pub enabled: bool,
    /// When the job was created
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied fields for creating or updating a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Display name
    pub name: String,
    /// Cron expression
    pub cron: String,
    /// Source database adapter config
    pub source_id: Uuid,
    /// Destination storage adapter config
    pub destination_id: Uuid,
    /// Encryption profile
    #[serde(default)]
    pub encryption_profile_id: Option<Uuid>,
    /// Compression mode
    #[serde(default)]
    pub compression: CompressionMode,
    /// Rotation policy
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Notification targets
    #[serde(default)]
    pub notification_ids: Vec<Uuid>,
    /// Whether the job fires
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A registered backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    /// Record id; immutable once created
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Capability category
    pub category: AdapterCategory,
    /// Registry id of the adapter this config drives
    pub adapter: String,
    /// Opaque payload, validated by the adapter at registration
    pub settings: Value,
    /// When the config was created
    pub created_at: DateTime<Utc>,
}

/// Key material for artifact encryption
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionProfile {
    /// Record id, referenced from artifact sidecars
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Master key; per-artifact keys are derived from it
    pub master_key: Vec<u8>,
    /// When the profile was created
    pub created_at: DateTime<Utc>,
}

/// In-memory job store
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<Uuid, Job>,
}

impl JobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new job built from `spec`
    pub fn insert(&self, spec: JobSpec) -> Job {
        let job = Job {
            id: Uuid::new_v4(),
            name: spec.name,
            cron: spec.cron,
            source_id: spec.source_id,
            destination_id: spec.destination_id,
            encryption_profile_id: spec.encryption_profile_id,
            compression: spec.compression,
            retention: spec.retention,
            notification_ids: spec.notification_ids,
            enabled: spec.enabled,
            created_at: Utc::now(),
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    /// Replace an existing job's mutable fields from `spec`
    pub fn update(&self, id: Uuid, spec: JobSpec) -> Option<Job> {
        let mut entry = self.jobs.get_mut(&id)?;
        entry.name = spec.name;
        entry.cron = spec.cron;
        entry.source_id = spec.source_id;
        entry.destination_id = spec.destination_id;
        entry.encryption_profile_id = spec.encryption_profile_id;
        entry.compression = spec.compression;
        entry.retention = spec.retention;
        entry.notification_ids = spec.notification_ids;
        entry.enabled = spec.enabled;
        Some(entry.clone())
    }

    /// Remove a job
    pub fn remove(&self, id: Uuid) -> Option<Job> {
        self.jobs.remove(&id).map(|(_, job)| job)
    }

    /// Snapshot a job
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<Job> {
        let mut all: Vec<Job> = self.jobs.iter().map(|j| j.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }
}

/// In-memory adapter config store
#[derive(Default)]
pub struct AdapterConfigStore {
    configs: DashMap<Uuid, AdapterConfig>,
}

impl AdapterConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated config
    pub fn insert(
        &self,
        name: impl Into<String>,
        category: AdapterCategory,
        adapter: impl Into<String>,
        settings: Value,
    ) -> AdapterConfig {
        let config = AdapterConfig {
            id: Uuid::new_v4(),
            name: name.into(),
            category,
            adapter: adapter.into(),
            settings,
            created_at: Utc::now(),
        };
        self.configs.insert(config.id, config.clone());
        config
    }

    /// Snapshot a config
    pub fn get(&self, id: Uuid) -> Option<AdapterConfig> {
        self.configs.get(&id).map(|c| c.clone())
    }

    /// All configs, newest first
    pub fn list(&self) -> Vec<AdapterConfig> {
        let mut all: Vec<AdapterConfig> = self.configs.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Remove a config
    pub fn remove(&self, id: Uuid) -> Option<AdapterConfig> {
        self.configs.remove(&id).map(|(_, config)| config)
    }
}

/// In-memory encryption profile store
#[derive(Default)]
pub struct EncryptionProfileStore {
    profiles: DashMap<Uuid, EncryptionProfile>,
}

impl EncryptionProfileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a profile
    pub fn insert(&self, name: impl Into<String>, master_key: Vec<u8>) -> EncryptionProfile {
        let profile = EncryptionProfile {
            id: Uuid::new_v4(),
            name: name.into(),
            master_key,
            created_at: Utc::now(),
        };
        self.profiles.insert(profile.id, profile.clone());
        profile
    }

    /// Snapshot a profile
    pub fn get(&self, id: Uuid) -> Option<EncryptionProfile> {
        self.profiles.get(&id).map(|p| p.clone())
    }

    /// All profiles, oldest first (stable order for key recovery sweeps)
    pub fn list(&self) -> Vec<EncryptionProfile> {
        let mut all: Vec<EncryptionProfile> = self.profiles.iter().map(|p| p.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Remove a profile. Artifacts encrypted under it stay restorable
    /// through smart key recovery as long as an equivalent key exists.
    pub fn remove(&self, id: Uuid) -> Option<EncryptionProfile> {
        self.profiles.remove(&id).map(|(_, profile)| profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: name.into(),
            cron: "0 0 3 * * *".into(),
            source_id: Uuid::new_v4(),
            destination_id: Uuid::new_v4(),
            encryption_profile_id: None,
            compression: CompressionMode::Gzip,
            retention: RetentionPolicy::Simple { keep: 7 },
            notification_ids: vec![],
            enabled: true,
        }
    }

    #[test]
    fn test_job_crud_and_ordering() {
        let store = JobStore::new();
        let first = store.insert(spec("first"));
        let second = store.insert(spec("second"));

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at >= listed[1].created_at);

        let mut updated_spec = spec("first-renamed");
        updated_spec.enabled = false;
        let updated = store.update(first.id, updated_spec).unwrap();
        assert_eq!(updated.name, "first-renamed");
        assert!(!updated.enabled);

        assert!(store.remove(second.id).is_some());
        assert!(store.get(second.id).is_none());
    }

    #[test]
    fn test_adapter_config_store() {
        let store = AdapterConfigStore::new();
        let config = store.insert(
            "prod-db",
            AdapterCategory::Database,
            "postgres",
            json!({ "host": "db", "username": "u", "databases": ["a"] }),
        );
        assert_eq!(store.get(config.id).unwrap().adapter, "postgres");
    }
}
