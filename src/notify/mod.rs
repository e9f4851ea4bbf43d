//! Webhook Notification Module
//!
//! Delivers per-request notifications to the webhook URLs supplied by callers
//! when their output's transaction changes state.

use crate::config::NotifierConfig;
use crate::types::WebhookNotification;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook unreachable: {0}")]
    Unreachable(String),

    #[error("webhook answered HTTP {0}")]
    Status(u16),
}

/// Outbound delivery of webhook notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification. `Ok` only for a 2xx answer.
    async fn notify(&self, url: &str, notification: &WebhookNotification) -> Result<(), NotifyError>;
}

pub type NotifierRef = Arc<dyn Notifier>;

/// Posts notifications as JSON over HTTP.
pub struct WebhookNotifier {
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotifyError::Unreachable(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, url: &str, notification: &WebhookNotification) -> Result<(), NotifyError> {
        debug!("Notifying {} for request {}", url, notification.batch_request_id);

        let response = self
            .http
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| {
                warn!("Webhook {} failed: {}", url, e);
                NotifyError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            warn!("Webhook {} answered {}", url, status);
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unreachable_webhook() {
        let notifier = WebhookNotifier::new(&NotifierConfig { timeout_secs: 2 }).unwrap();
        let notification = WebhookNotification {
            batch_request_id: 1,
            batch_id: 1,
            cn_batcher_id: 1,
            request_count_in_batch: 1,
            status: Some("confirmed".into()),
            txid: Some("abc".into()),
            hash: None,
            details: json!({}),
        };
        let err = notifier
            .notify("http://127.0.0.1:1/hook", &notification)
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Unreachable(_)));
    }
}
