//! Adapter contracts and the registry that resolves them.
//!
//! Every external system the engine touches sits behind one of three
//! capability traits: [`DatabaseAdapter`] for dump/restore sources,
//! [`StorageAdapter`] for artifact destinations, and
//! [`NotificationAdapter`] for event channels. A stable string id
//! ("postgres", "local-fs", "webhook") resolves to an instance through the
//! [`AdapterRegistry`]; an unknown id is a configuration error raised when
//! the config is registered, never mid-pipeline.

pub mod database;
pub mod mysql;
pub mod notification;
pub mod postgres;
pub mod registry;
#[cfg(feature = "s3")]
pub mod s3;
pub mod sqlite;
pub mod storage;

pub use database::{
    ConnectionInfo, DatabaseAdapter, DatabaseMapping, DumpOutput, PrivilegedAuth, RestoreOutput,
    RestoreTargetOptions,
};
pub use notification::{
    EventKind, LogNotifier, NotificationAdapter, NotificationDispatcher, NotificationEvent,
    WebhookNotifier,
};
pub use registry::AdapterRegistry;
pub use storage::{LocalStorage, RemoteEntry, StorageAdapter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capability category an adapter config belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterCategory {
    /// Dump/restore source
    Database,
    /// Artifact destination
    Storage,
    /// Event channel
    Notification,
}

impl std::fmt::Display for AdapterCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterCategory::Database => f.write_str("database"),
            AdapterCategory::Storage => f.write_str("storage"),
            AdapterCategory::Notification => f.write_str("notification"),
        }
    }
}

/// Errors produced by adapters and the registry
#[derive(Error, Debug)]
pub enum AdapterError {
    /// No adapter is registered under the requested id
    #[error("unknown adapter id: {0}")]
    UnknownAdapter(String),

    /// The config payload does not match the adapter's expected shape
    #[error("invalid adapter settings: {0}")]
    InvalidSettings(String),

    /// The backend could not be reached or refused the probe
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The backend refused the operation for lack of privileges
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An external tool exited unsuccessfully
    #[error("tool failure: {0}")]
    Tool(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for adapter operations
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

pub(crate) fn settings_error(err: impl std::fmt::Display) -> AdapterError {
    AdapterError::InvalidSettings(err.to_string())
}
