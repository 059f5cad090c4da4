use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub dev_mode: bool,
    /// Secret key for read-only billing provider lookups
    pub stripe_secret_key: Option<String>,
    /// Shared secret for webhook signatures (required outside dev mode)
    pub stripe_webhook_secret: Option<String>,
    /// Seconds a signed webhook timestamp may lag behind our clock
    pub signature_tolerance_secs: i64,
    /// Bearer token for the admin routes (admin routes are disabled when unset)
    pub admin_api_key: Option<String>,
    /// Delivery endpoint for outbound notifications (log-only when unset)
    pub notify_webhook_url: Option<String>,
    /// Trial length when a family has no explicit duration
    pub default_trial_days: i64,
    /// Upper bound on one webhook delivery's processing time
    pub webhook_timeout: Duration,
    /// Attempts for a storage operation that fails transiently
    pub db_retry_attempts: u32,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("LICENSOR_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(9292);

        let webhook_timeout_secs: u64 = env::var("WEBHOOK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "licensor.db".to_string()),
            dev_mode,
            stripe_secret_key: non_empty_var("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: non_empty_var("STRIPE_WEBHOOK_SECRET"),
            signature_tolerance_secs: env::var("SIGNATURE_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            admin_api_key: non_empty_var("ADMIN_API_KEY"),
            notify_webhook_url: non_empty_var("NOTIFY_WEBHOOK_URL"),
            default_trial_days: env::var("DEFAULT_TRIAL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|days: &i64| *days > 0)
                .unwrap_or(7),
            webhook_timeout: Duration::from_secs(webhook_timeout_secs),
            db_retry_attempts: env::var("DB_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(3),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9292,
            database_path: "licensor.db".to_string(),
            dev_mode: false,
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            signature_tolerance_secs: 300,
            admin_api_key: None,
            notify_webhook_url: None,
            default_trial_days: 7,
            webhook_timeout: Duration::from_secs(10),
            db_retry_attempts: 3,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
