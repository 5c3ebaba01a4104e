//! Notification sink for task outcomes

use crate::error::AppResult;
use crate::evolution::task::{EvolutionStatus, EvolutionTask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Receives completion, approval-required and error notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str, task: &EvolutionTask) -> AppResult<()>;
}

/// Webhook body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub message: String,
    pub task_id: String,
    pub status: EvolutionStatus,
    pub change_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn new(message: &str, task: &EvolutionTask) -> Self {
        Self {
            message: message.to_string(),
            task_id: task.task_id.clone(),
            status: task.status,
            change_count: task.changes.len(),
            timestamp: Utc::now(),
        }
    }
}

/// Logs every notification and POSTs it to a webhook when one is configured.
/// Delivery is best-effort: failures are logged, never returned.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, webhook_url })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, message: &str, task: &EvolutionTask) -> AppResult<()> {
        info!(task_id = %task.task_id, status = %task.status, "📣 {}", message);

        let Some(url) = &self.webhook_url else {
            return Ok(());
        };

        let payload = NotificationPayload::new(message, task);
        match self.client.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(
                task_id = %task.task_id,
                "Webhook notification rejected with status {}",
                resp.status()
            ),
            Err(e) => warn!(task_id = %task.task_id, "Webhook notification failed: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_payload_shape() {
        let task = EvolutionTask::new(vec![]);
        let payload = NotificationPayload::new("Evolution completed", &task);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["message"], "Evolution completed");
        assert_eq!(json["taskId"], task.task_id.as_str());
        assert_eq!(json["status"], "idle");
        assert_eq!(json["changeCount"], 0);
        assert!(json.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_log_only_notifier() {
        let notifier = WebhookNotifier::new(None).unwrap();
        let task = EvolutionTask::new(vec![]);
        assert_ok!(notifier.notify("Approval required", &task).await);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_not_an_error() {
        let notifier = WebhookNotifier::new(Some("http://127.0.0.1:9/hook".to_string())).unwrap();
        let task = EvolutionTask::new(vec![]);
        assert_ok!(notifier.notify("Evolution failed", &task).await);
    }
}
