//! Outbound notifications.
//!
//! Template rendering and delivery live outside this service. Notifications
//! are either POSTed as JSON to a delivery webhook or, when none is
//! configured, only logged. Delivery failures are never fatal to the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value, json};
use strum::AsRefStr;

use crate::error::{AppError, Result};
use crate::util::format_date;

/// Semantic tag selecting which rule-based e-mail to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerEvent {
    TrialStarted,
    TrialDenied,
    SubscriptionStarted,
    AdminGrantCreated,
    AdminGrantAdded,
}

pub type EmailVars = Map<String, Value>;

/// What happened to a license, as seen by the notification side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub trigger_event: TriggerEvent,
    pub family: String,
    pub email: String,
    pub license_key: Option<String>,
    pub trial_end_date: Option<i64>,
    pub granted_skus: Vec<String>,
}

impl DomainEvent {
    pub fn vars(&self) -> EmailVars {
        let mut vars = Map::new();
        if let Some(key) = &self.license_key {
            vars.insert("license_key".into(), json!(key));
        }
        if let Some(end) = self.trial_end_date {
            vars.insert("trial_end_date".into(), json!(format_date(end)));
        }
        vars.insert("granted_skus".into(), json!(self.granted_skus));
        vars
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_license_key(&self, email: &str, license_key: &str, family: &str) -> Result<()>;

    async fn send_rule_based_email(
        &self,
        trigger: TriggerEvent,
        family: &str,
        email: &str,
        vars: &EmailVars,
    ) -> Result<()>;

    async fn send_admin_alert(&self, family: &str, subject: &str, body: &str) -> Result<()>;
}

/// A notification queued during a write and sent after it commits.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    LicenseKey {
        email: String,
        license_key: String,
        family: String,
    },
    RuleBased(DomainEvent),
    AdminAlert {
        family: String,
        subject: String,
        body: String,
    },
}

/// Family used for alerts that cannot be attributed to one.
pub const SYSTEM_ALERT_FAMILY: &str = "system";

impl Notification {
    pub fn admin_alert(family: &str, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Notification::AdminAlert {
            family: family.to_string(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Send every notification, logging failures instead of returning them.
pub async fn dispatch(notifier: &dyn Notifier, notifications: Vec<Notification>) {
    for notification in notifications {
        let result = match &notification {
            Notification::LicenseKey {
                email,
                license_key,
                family,
            } => notifier.send_license_key(email, license_key, family).await,
            Notification::RuleBased(event) => {
                notifier
                    .send_rule_based_email(
                        event.trigger_event,
                        &event.family,
                        &event.email,
                        &event.vars(),
                    )
                    .await
            }
            Notification::AdminAlert {
                family,
                subject,
                body,
            } => notifier.send_admin_alert(family, subject, body).await,
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, ?notification, "notification delivery failed");
        }
    }
}

#[derive(Debug, Serialize)]
struct DeliveryPayload<'a> {
    event: &'static str,
    family: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trigger: Option<TriggerEvent>,
    data: Value,
}

/// Notifier that POSTs to a delivery webhook, or logs when none is configured.
#[derive(Clone)]
pub struct EmailService {
    http_client: Client,
    webhook_url: Option<String>,
}

impl EmailService {
    pub fn new(webhook_url: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            http_client,
            webhook_url,
        })
    }

    async fn deliver(&self, payload: DeliveryPayload<'_>) -> Result<()> {
        let Some(webhook_url) = &self.webhook_url else {
            tracing::info!(
                event = payload.event,
                family = payload.family,
                email = payload.email,
                "Notification delivery disabled, logging only"
            );
            return Ok(());
        };

        let response = self
            .http_client
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .header("X-Licensor-Event", payload.event)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, webhook_url = %webhook_url, "Failed to call notification webhook");
                AppError::Internal(format!("Webhook call failed: {}", e))
            })?;

        if response.status().is_success() {
            tracing::debug!(event = payload.event, family = payload.family, "Notification delivered");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Notification webhook returned error");
            Err(AppError::Internal(format!(
                "Notification webhook returned {}",
                status
            )))
        }
    }
}

#[async_trait]
impl Notifier for EmailService {
    async fn send_license_key(&self, email: &str, license_key: &str, family: &str) -> Result<()> {
        self.deliver(DeliveryPayload {
            event: "license_key",
            family,
            email: Some(email),
            trigger: None,
            data: json!({ "license_key": license_key }),
        })
        .await
    }

    async fn send_rule_based_email(
        &self,
        trigger: TriggerEvent,
        family: &str,
        email: &str,
        vars: &EmailVars,
    ) -> Result<()> {
        self.deliver(DeliveryPayload {
            event: "rule_based_email",
            family,
            email: Some(email),
            trigger: Some(trigger),
            data: Value::Object(vars.clone()),
        })
        .await
    }

    async fn send_admin_alert(&self, family: &str, subject: &str, body: &str) -> Result<()> {
        self.deliver(DeliveryPayload {
            event: "admin_alert",
            family,
            email: None,
            trigger: None,
            data: json!({ "subject": subject, "body": body }),
        })
        .await
    }
}
