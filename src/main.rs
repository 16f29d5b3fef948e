//! Concierge server - bounded-context task router with human approval gating

use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use concierge::config::Settings;
use concierge::store::Store;
use concierge::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "concierge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::parse();

    // Database connection
    let options = SqliteConnectOptions::from_str(&settings.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    // Catalog errors are fatal
    let catalog = settings.load_catalog()?;
    tracing::info!(
        capabilities = catalog.registry.len(),
        specialists = catalog.specialists.len(),
        "Catalog loaded"
    );

    let store = Store::new(pool.clone());
    let executor = settings.executor(&catalog);
    let orchestrator = Arc::new(
        catalog
            .into_orchestrator(executor)
            .with_config(settings.orchestrator_config())
            .with_escalation_handler(Arc::new(store.clone())),
    );
    store.record_events(orchestrator.clone());
    orchestrator.spawn_sweeper(Duration::from_secs(60));

    let state = AppState::new(pool, orchestrator);
    let app = concierge::app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
