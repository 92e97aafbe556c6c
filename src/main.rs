//! Gamehall - workstation reservation and timeout release engine

use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gamehall::{
    api::{self, AppState},
    config::Config,
    db,
    services::{Engine, LedgerError},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gamehall=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gamehall reservation engine...");

    // Load configuration
    let config = Config::load_with_env(Path::new("config.yml"))?;
    tracing::info!("Configuration loaded");

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    // Run migrations
    db::migrations::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let mut engine = Engine::new(pool, &config.booking);

    let seeded = engine.fleet.seed(&config.fleet).await?;
    tracing::info!("Fleet seeded: {} new of {} configured", seeded, config.fleet.len());

    // Rebuild in-memory state and re-arm open holds before taking traffic.
    // Recovery logs each integrity violation and the reconcile report itself.
    match engine.ledger.recover().await {
        Ok(_) => {}
        Err(LedgerError::Integrity(violations)) => {
            anyhow::bail!(
                "Startup aborted: {} integrity violation(s) need manual repair",
                violations.len()
            );
        }
        Err(e) => return Err(e.into()),
    }

    let shutdown = install_signal_handler();
    let tasks = engine.spawn(&shutdown);

    let state = AppState::new(&engine, config.server.admin_token.clone());
    let app = api::build_router(state, &config.server.cors_origin)?;

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // The server may also stop on its own; make sure the engine follows.
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("Engine task ended abnormally: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Cancel the returned token on Ctrl+C or SIGTERM
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    tracing::info!("Received Ctrl+C, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Received Ctrl+C, shutting down");
        }

        trigger.cancel();
    });

    token
}
