//! Audit trail for mutating service calls.
//!
//! Every create/update/delete/execute on the service facade emits an
//! audit record as a fire-and-forget side channel: the initiating call
//! never waits on (or fails because of) the trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;
use uuid::Uuid;

/// What kind of mutation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    /// A record was created
    Create,
    /// A record was updated
    Update,
    /// A record was deleted
    Delete,
    /// A pipeline was triggered
    Execute,
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Record id
    pub id: Uuid,
    /// Mutation kind
    pub action: AuditAction,
    /// Resource type ("job", "execution")
    pub resource: String,
    /// Id of the mutated resource
    pub resource_id: String,
    /// Who performed the mutation
    pub user_id: String,
    /// Structured extras
    pub details: Value,
    /// When the mutation happened
    pub timestamp: DateTime<Utc>,
}

/// Fire-and-forget audit sink with an in-memory tail for inspection
#[derive(Clone)]
pub struct AuditTrail {
    tx: mpsc::UnboundedSender<AuditRecord>,
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl AuditTrail {
    /// Start the trail worker
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<AuditRecord>();
        let records = Arc::new(RwLock::new(Vec::new()));
        let sink = Arc::clone(&records);
        tokio::spawn(async move {
            let mut stream = UnboundedReceiverStream::new(rx);
            while let Some(record) = stream.next().await {
                info!(
                    action = ?record.action,
                    resource = %record.resource,
                    resource_id = %record.resource_id,
                    user = %record.user_id,
                    "audit"
                );
                sink.write().await.push(record);
            }
        });
        Self { tx, records }
    }

    /// Queue one record. Never blocks, never fails the caller.
    pub fn record(
        &self,
        action: AuditAction,
        resource: impl Into<String>,
        resource_id: impl std::fmt::Display,
        user_id: impl Into<String>,
        details: Value,
    ) {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            action,
            resource: resource.into(),
            resource_id: resource_id.to_string(),
            user_id: user_id.into(),
            details,
            timestamp: Utc::now(),
        };
        let _ = self.tx.send(record);
    }

    /// Snapshot of recorded entries (worker-ordered)
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_records_arrive_without_blocking_caller() {
        let trail = AuditTrail::start();
        trail.record(
            AuditAction::Create,
            "job",
            Uuid::new_v4(),
            "admin",
            json!({ "name": "nightly" }),
        );
        trail.record(AuditAction::Execute, "job", Uuid::new_v4(), "scheduler", json!({}));

        // drain happens on the worker; give it a beat
        tokio::time::sleep(Duration::from_millis(50)).await;
        let records = trail.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, AuditAction::Create);
        assert_eq!(records[1].action, AuditAction::Execute);
    }
}
