use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use licensor::config::Config;
use licensor::db::{AppState, create_pool, init_db};
use licensor::notify::EmailService;
use licensor::payments::StripeClient;

#[derive(Parser)]
#[command(name = "licensor", version, about = "License and entitlement lifecycle server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Create the database schema and exit
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "licensor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let pool = create_pool(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path))?;
    {
        let conn = pool.get().context("acquiring database connection")?;
        init_db(&conn).context("initializing schema")?;
    }

    if matches!(cli.command, Some(Command::InitDb)) {
        tracing::info!(path = %config.database_path, "database initialized");
        return Ok(());
    }

    if config.dev_mode {
        tracing::warn!("running in dev mode");
    }
    if config.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set, billing webhooks will be refused outside dev mode");
    }
    if config.admin_api_key.is_none() {
        tracing::warn!("ADMIN_API_KEY not set, admin routes are disabled");
    }

    let addr = config.addr();
    let notifier = EmailService::new(config.notify_webhook_url.clone(), config.webhook_timeout)
        .context("building notification client")?;
    let billing_api = StripeClient::new(config.stripe_secret_key.clone(), config.webhook_timeout)
        .context("building billing client")?;
    let state = AppState {
        db: pool,
        notifier: Arc::new(notifier),
        billing_api: Arc::new(billing_api),
        config: Arc::new(config),
    };

    let app = licensor::router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
