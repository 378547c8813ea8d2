use std::sync::Arc;

use anyhow::Context;
use silentsignal::{
    config::Config,
    hub::{Hub, HubSettings},
    participants::SqliteParticipants,
    router, AppState,
};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("silentsignal=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let db_pool = SqlitePoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let participants = SqliteParticipants::new(db_pool);
    participants.init().await.context("creating participants table")?;

    let hub = Hub::new(Arc::new(participants), HubSettings::from(&config));
    let app = router(AppState { hub: hub.clone() });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    hub.shutdown().await;
    Ok(())
}
