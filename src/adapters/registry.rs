//! The adapter registry: stable id strings resolved to instances once at
//! startup, with exhaustive validation at config-registration time.

use super::database::DatabaseAdapter;
use super::mysql::MysqlAdapter;
use super::notification::{LogNotifier, NotificationAdapter, WebhookNotifier};
use super::postgres::PostgresAdapter;
use super::sqlite::SqliteAdapter;
use super::storage::{LocalStorage, StorageAdapter};
use super::{AdapterCategory, AdapterError, AdapterResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves stable adapter ids to instances, per capability category
pub struct AdapterRegistry {
    databases: HashMap<&'static str, Arc<dyn DatabaseAdapter>>,
    storages: HashMap<&'static str, Arc<dyn StorageAdapter>>,
    notifications: HashMap<&'static str, Arc<dyn NotificationAdapter>>,
}

impl AdapterRegistry {
    /// Registry with every built-in adapter registered
    pub fn builtin() -> Self {
        let mut registry = Self {
            databases: HashMap::new(),
            storages: HashMap::new(),
            notifications: HashMap::new(),
        };
        registry.register_database(Arc::new(PostgresAdapter));
        registry.register_database(Arc::new(MysqlAdapter));
        registry.register_database(Arc::new(SqliteAdapter));
        registry.register_storage(Arc::new(LocalStorage));
        #[cfg(feature = "s3")]
        registry.register_storage(Arc::new(super::s3::S3Storage));
        registry.register_notification(Arc::new(WebhookNotifier::new()));
        registry.register_notification(Arc::new(LogNotifier));
        registry
    }

    /// Register a database adapter (replaces any previous id holder)
    pub fn register_database(&mut self, adapter: Arc<dyn DatabaseAdapter>) {
        self.databases.insert(adapter.id(), adapter);
    }

    /// Register a storage adapter
    pub fn register_storage(&mut self, adapter: Arc<dyn StorageAdapter>) {
        self.storages.insert(adapter.id(), adapter);
    }

    /// Register a notification adapter
    pub fn register_notification(&mut self, adapter: Arc<dyn NotificationAdapter>) {
        self.notifications.insert(adapter.id(), adapter);
    }

    /// Resolve a database adapter id
    pub fn database(&self, id: &str) -> AdapterResult<Arc<dyn DatabaseAdapter>> {
        self.databases
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(id.to_string()))
    }

    /// Resolve a storage adapter id
    pub fn storage(&self, id: &str) -> AdapterResult<Arc<dyn StorageAdapter>> {
        self.storages
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(id.to_string()))
    }

    /// Resolve a notification adapter id
    pub fn notification(&self, id: &str) -> AdapterResult<Arc<dyn NotificationAdapter>> {
        self.notifications
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(id.to_string()))
    }

    /// Validate an opaque config payload against the adapter it names.
    /// This is the single gate between "configuration error now" and
    /// "pipeline failure later".
    pub fn validate_config(
        &self,
        category: AdapterCategory,
        adapter_id: &str,
        settings: &Value,
    ) -> AdapterResult<()> {
        match category {
            AdapterCategory::Database => self.database(adapter_id)?.validate(settings),
            AdapterCategory::Storage => self.storage(adapter_id)?.validate(settings),
            AdapterCategory::Notification => self.notification(adapter_id)?.validate(settings),
        }
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
