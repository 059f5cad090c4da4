//! Shared utility functions.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

pub const SECONDS_PER_DAY: i64 = 86400;

/// Current Unix timestamp in seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

pub fn gen_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Unix timestamp `days` days after `base_time`.
pub fn days_from(base_time: i64, days: i64) -> i64 {
    base_time + days.saturating_mul(SECONDS_PER_DAY)
}

/// Calendar month (`YYYY-MM`, UTC) containing the timestamp.
pub fn month_key(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%Y-%m")
        .to_string()
}

/// Format a Unix timestamp as a day-first date (e.g., "15/01/2024") for e-mail variables.
pub fn format_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%d/%m/%Y").to_string())
        .unwrap_or_default()
}

/// Extract a Bearer token from the Authorization header.
///
/// Returns the token string without the "Bearer " prefix, or None if
/// the header is missing, malformed, or empty after the prefix.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_key_uses_utc_calendar_month() {
        // 2024-01-31T23:59:59Z
        assert_eq!(month_key(1_706_745_599), "2024-01");
        // 2024-02-01T00:00:00Z
        assert_eq!(month_key(1_706_745_600), "2024-02");
    }

    #[test]
    fn bearer_token_requires_prefix_and_content() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", "Bearer  secret ".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("secret"));

        headers.insert("Authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert("Authorization", "Bearer ".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }
}
