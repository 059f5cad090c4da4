use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;

use crate::db::{AppState, queries};
use crate::error::Result;
use crate::models::EmailStatus;
use crate::notify::{self, Notification, SYSTEM_ALERT_FAMILY};

/// One delivery event from the e-mail provider.
#[derive(Debug, Deserialize)]
pub struct DeliveryEvent {
    pub email: String,
    pub event: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, rename = "type")]
    pub bounce_type: Option<String>,
}

fn status_for(event: &str) -> Option<EmailStatus> {
    match event {
        "bounce" | "dropped" => Some(EmailStatus::Bounced),
        "spamreport" => Some(EmailStatus::SpamReport),
        "delivered" => Some(EmailStatus::Ok),
        _ => None,
    }
}

/// Record the event on every license with that address. Returns alerts owed.
fn apply_delivery_event(state: &AppState, event: &DeliveryEvent) -> Result<Vec<Notification>> {
    let Some(status) = status_for(&event.event) else {
        tracing::debug!(event = %event.event, email = %event.email, "unmapped delivery event");
        return Ok(Vec::new());
    };

    let conn = state.db.get()?;
    let updated = queries::set_email_status(&conn, &event.email, status)?;
    tracing::info!(email = %event.email, status = status.as_ref(), updated, "e-mail status changed");

    let (subject, body) = match status {
        EmailStatus::Ok => return Ok(Vec::new()),
        EmailStatus::Bounced => (
            format!("E-mail delivery failed for {}", event.email),
            format!(
                "Delivery to {} failed permanently. Reason: {} (type: {})",
                event.email,
                event.reason.as_deref().unwrap_or("unspecified"),
                event.bounce_type.as_deref().unwrap_or("n/a"),
            ),
        ),
        EmailStatus::SpamReport => (
            format!("Spam report from {}", event.email),
            format!("{} marked one of our e-mails as spam.", event.email),
        ),
    };

    let mut families: Vec<String> = queries::list_licenses_by_email(&conn, &event.email)?
        .into_iter()
        .map(|l| l.family)
        .collect();
    families.sort();
    families.dedup();
    if families.is_empty() {
        families.push(SYSTEM_ALERT_FAMILY.to_string());
    }

    Ok(families
        .iter()
        .map(|family| Notification::admin_alert(family, subject.clone(), body.clone()))
        .collect())
}

pub async fn handle_email_events(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let events: Vec<DeliveryEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            tracing::error!("Failed to parse e-mail events: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid JSON payload");
        }
    };

    let mut notifications = Vec::new();
    for event in &events {
        match apply_delivery_event(&state, event) {
            Ok(alerts) => notifications.extend(alerts),
            Err(e) => {
                tracing::error!(email = %event.email, error = %e, "failed to record delivery event");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Processing failed");
            }
        }
    }

    notify::dispatch(state.notifier.as_ref(), notifications).await;
    (StatusCode::OK, "Events received")
}
