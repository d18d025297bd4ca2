//! Notification adapters and the fire-and-forget dispatcher.
//!
//! Notification delivery is best-effort by contract: failures are logged
//! on the dispatcher worker and never abort or delay a pipeline.

use super::{settings_error, AdapterError, AdapterResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A backup pipeline finished successfully
    BackupSucceeded,
    /// A backup pipeline failed
    BackupFailed,
}

/// Event payload delivered to notification channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// What happened
    pub kind: EventKind,
    /// Job the execution belongs to, if any
    pub job_name: Option<String>,
    /// The execution this event is about
    pub execution_id: Uuid,
    /// Human-readable summary
    pub message: String,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// Structured extras (artifact path, error text)
    #[serde(default)]
    pub details: Value,
}

/// Capability contract for event channels
#[async_trait]
pub trait NotificationAdapter: Send + Sync {
    /// Stable registry id ("webhook")
    fn id(&self) -> &'static str;

    /// Human-readable adapter name
    fn display_name(&self) -> &'static str;

    /// Shape-check an opaque config payload
    fn validate(&self, settings: &Value) -> AdapterResult<()>;

    /// Deliver one event
    async fn send(&self, settings: &Value, event: &NotificationEvent) -> AdapterResult<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookSettings {
    url: String,
    #[serde(default)]
    auth_header: Option<String>,
}

/// JSON webhook channel
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Create the webhook notifier with a shared HTTP client
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationAdapter for WebhookNotifier {
    fn id(&self) -> &'static str {
        "webhook"
    }

    fn display_name(&self) -> &'static str {
        "Webhook"
    }

    fn validate(&self, settings: &Value) -> AdapterResult<()> {
        let cfg: WebhookSettings =
            serde_json::from_value(settings.clone()).map_err(settings_error)?;
        if !cfg.url.starts_with("http://") && !cfg.url.starts_with("https://") {
            return Err(AdapterError::InvalidSettings(format!(
                "invalid webhook url: {}",
                cfg.url
            )));
        }
        Ok(())
    }

    async fn send(&self, settings: &Value, event: &NotificationEvent) -> AdapterResult<()> {
        let cfg: WebhookSettings =
            serde_json::from_value(settings.clone()).map_err(settings_error)?;
        let mut request = self.client.post(&cfg.url).json(event);
        if let Some(header) = &cfg.auth_header {
            request = request.header("Authorization", header);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Tool(format!("webhook: {}", e)))?;
        if !response.status().is_success() {
            return Err(AdapterError::Tool(format!(
                "webhook: {} returned {}",
                cfg.url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Channel that writes events to the engine log. Doubles as the default
/// sink in tests.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationAdapter for LogNotifier {
    fn id(&self) -> &'static str {
        "log"
    }

    fn display_name(&self) -> &'static str {
        "Engine log"
    }

    fn validate(&self, _settings: &Value) -> AdapterResult<()> {
        Ok(())
    }

    async fn send(&self, _settings: &Value, event: &NotificationEvent) -> AdapterResult<()> {
        info!(
            kind = ?event.kind,
            job = event.job_name.as_deref().unwrap_or("manual"),
            execution = %event.execution_id,
            "{}",
            event.message
        );
        Ok(())
    }
}

struct DispatchTask {
    adapter: Arc<dyn NotificationAdapter>,
    settings: Value,
    event: NotificationEvent,
}

/// Fire-and-forget dispatcher. Pipelines hand events to [`dispatch`] and
/// move on; a background worker owns delivery and failure logging.
///
/// [`dispatch`]: NotificationDispatcher::dispatch
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<DispatchTask>,
}

impl NotificationDispatcher {
    /// Start the dispatcher worker
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<DispatchTask>();
        tokio::spawn(async move {
            let mut stream = UnboundedReceiverStream::new(rx);
            while let Some(task) = stream.next().await {
                if let Err(e) = task.adapter.send(&task.settings, &task.event).await {
                    warn!(
                        adapter = task.adapter.id(),
                        execution = %task.event.execution_id,
                        "notification delivery failed: {}",
                        e
                    );
                }
            }
        });
        Self { tx }
    }

    /// Queue one event for delivery. Never blocks, never fails the caller.
    pub fn dispatch(
        &self,
        adapter: Arc<dyn NotificationAdapter>,
        settings: Value,
        event: NotificationEvent,
    ) {
        let task = DispatchTask {
            adapter,
            settings,
            event,
        };
        if self.tx.send(task).is_err() {
            warn!("notification dispatcher is gone; event dropped");
        }
    }
}
