//! Alert dispatch for the abuse defense engine.
//!
//! Threshold-crossing notifications are handed to an external
//! dispatcher. Delivery failures are logged and swallowed; nothing on
//! the request path waits for an alert to land.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NotificationSettings, Severity};

/// Errors that can occur during alert delivery
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Dispatch error: {0}")]
    Dispatch(String),
}

/// A threshold-crossing notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(alert_type: &str, severity: Severity, title: &str, message: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type: alert_type.to_string(),
            severity,
            title: title.to_string(),
            message: message.to_string(),
            source: "abuse_defense".to_string(),
            data: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// External alert delivery contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn send_alert(
        &self,
        alert: &Alert,
        notify: &NotificationSettings,
    ) -> Result<(), AlertError>;
}

/// Dispatcher that posts alerts to the tenant's configured webhook.
/// Email notifications are relayed by the external dispatcher and are
/// only logged here.
pub struct WebhookAlertDispatcher {
    client: Client,
}

impl WebhookAlertDispatcher {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebhookAlertDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertDispatcher for WebhookAlertDispatcher {
    async fn send_alert(
        &self,
        alert: &Alert,
        notify: &NotificationSettings,
    ) -> Result<(), AlertError> {
        if notify.email {
            info!(
                "Email alert queued: [{}] {} - {}",
                alert.severity, alert.title, alert.message
            );
        }

        if !notify.webhook {
            return Ok(());
        }
        let url = notify
            .webhook_url
            .as_deref()
            .ok_or_else(|| AlertError::Dispatch("webhook enabled without a URL".to_string()))?;

        let response = self.client.post(url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Dispatch(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Dispatcher that only writes alerts to the log. Used when no
/// delivery channel is configured.
pub struct LogAlertDispatcher;

#[async_trait]
impl AlertDispatcher for LogAlertDispatcher {
    async fn send_alert(
        &self,
        alert: &Alert,
        _notify: &NotificationSettings,
    ) -> Result<(), AlertError> {
        info!(
            "Alert: [{}] {} - {}",
            alert.severity, alert.title, alert.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn webhook_dispatcher_skips_delivery_when_webhook_disabled() {
        let dispatcher = WebhookAlertDispatcher::new();
        let alert = Alert::new("attack_volume", Severity::High, "High attack volume", "10 attacks in the last hour");
        let notify = NotificationSettings {
            email: false,
            webhook: false,
            webhook_url: None,
        };

        assert!(dispatcher.send_alert(&alert, &notify).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_without_url_is_a_dispatch_error() {
        let dispatcher = WebhookAlertDispatcher::new();
        let alert = Alert::new("attack_volume", Severity::Critical, "Critical attack volume", "50 attacks in the last hour");
        let notify = NotificationSettings {
            email: false,
            webhook: true,
            webhook_url: None,
        };

        assert!(matches!(
            dispatcher.send_alert(&alert, &notify).await,
            Err(AlertError::Dispatch(_))
        ));
    }
}
