//! # dbackup
//!
//! A self-hosted backup/restore orchestration engine. dbackup schedules,
//! executes, and reverses data-protection jobs against pluggable database
//! sources, storage destinations, and notification channels.
//!
//! ## Overview
//!
//! The engine is built around a small number of cooperating parts:
//!
//! - [`adapters`]: capability contracts for database, storage, and
//!   notification backends, resolved through a string-keyed registry
//! - [`crypto`]: authenticated streaming encryption and compression codecs
//! - [`execution`]: the persisted state machine for a single run
//! - [`runner`]: the backup pipeline (prepare, dump, compress, encrypt,
//!   upload, notify, cleanup)
//! - [`queue`]: admission control bounding concurrently running pipelines
//! - [`scheduler`]: cron-driven trigger source, rebuilt on every job change
//! - [`retention`]: post-success artifact rotation (simple count or GFS)
//! - [`restore`]: the restore pipeline with version guard and smart key
//!   recovery
//! - [`service`]: the service facade consumed by the dashboard/CLI layer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dbackup::service::{BackupService, EngineConfig};
//!
//! # async fn example() -> dbackup::Result<()> {
//! let service = BackupService::new(EngineConfig::default());
//! let jobs = service.get_jobs();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use thiserror::Error;

/// Result type for dbackup operations
pub type Result<T> = std::result::Result<T, DbackupError>;

/// Main error type for dbackup operations
#[derive(Error, Debug)]
pub enum DbackupError {
    /// Invalid configuration (unknown adapter id, malformed settings).
    /// Fatal before any pipeline starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An adapter connectivity probe failed; no pipeline was started
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A pipeline stage failed; the execution records the triggering error
    #[error("Stage {stage} failed: {message}")]
    PipelineStage {
        /// Label of the stage that failed
        stage: String,
        /// The triggering error, preserved verbatim
        message: String,
    },

    /// Authentication-tag verification failed while decoding an artifact.
    /// No plaintext from the failing chunk was emitted.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The backup was produced by a database engine newer than the target
    #[error("backup engine version {backup} is newer than target version {target}")]
    VersionIncompatibility {
        /// Version recorded in the artifact sidecar
        backup: String,
        /// Version reported by the live target
        target: String,
    },

    /// Every configured encryption profile was tried and none decrypted
    /// the artifact. Distinct from [`DbackupError::Integrity`]: the data
    /// may be intact, we just no longer hold a matching key.
    #[error("no matching key: {0}")]
    KeyRecoveryExhausted(String),

    /// A referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An adapter operation failed (tool exit status, storage I/O)
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// The adapter reported a permission failure; the caller may retry
    /// once with elevated credentials
    #[error("privileged auth required: {0}")]
    PrivilegedAuthRequired(String),

    /// Invalid cron expression or scheduling failure
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crypto::CryptoError> for DbackupError {
    fn from(err: crypto::CryptoError) -> Self {
        match err {
            crypto::CryptoError::Integrity(msg) => DbackupError::Integrity(msg),
            crypto::CryptoError::Io(e) => DbackupError::Io(e),
            other => DbackupError::Internal(other.to_string()),
        }
    }
}

impl From<adapters::AdapterError> for DbackupError {
    fn from(err: adapters::AdapterError) -> Self {
        match err {
            adapters::AdapterError::UnknownAdapter(id) => {
                DbackupError::Configuration(format!("unknown adapter id: {}", id))
            }
            adapters::AdapterError::InvalidSettings(msg) => DbackupError::Configuration(msg),
            adapters::AdapterError::Connectivity(msg) => DbackupError::Connectivity(msg),
            adapters::AdapterError::PermissionDenied(msg) => {
                DbackupError::PrivilegedAuthRequired(msg)
            }
            adapters::AdapterError::Tool(msg) => DbackupError::Adapter(msg),
            adapters::AdapterError::Io(e) => DbackupError::Io(e),
        }
    }
}

/// Adapter contracts, concrete adapters, and the adapter registry
pub mod adapters;

/// Artifact path layout and sidecar metadata
pub mod artifact;

/// Authenticated streaming encryption and compression codecs
pub mod crypto;

/// Execution records: the per-run state machine and its store
pub mod execution;

/// Job, adapter config, and encryption profile models and stores
pub mod jobs;

/// Admission control for concurrently running pipelines
pub mod queue;

/// The backup pipeline
pub mod runner;

/// The restore pipeline, version guard, and smart key recovery
pub mod restore;

/// Artifact rotation policies
pub mod retention;

/// Cron-driven trigger source
pub mod scheduler;

/// API keys and the audit trail
pub mod security;

/// Service facade consumed by the dashboard/CLI layer
pub mod service;
