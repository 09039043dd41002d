//! Botberi event relay
//!
//! Listens for row-change notifications on a Postgres channel and republishes
//! each valid envelope on a RabbitMQ topic exchange, keyed by its routing key.

use std::sync::Arc;

use anyhow::Result;
use botberi_event_relay::{api, config::Config, db, EventBridge};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the process environment still applies.
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to RELAY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting botberi event relay");
    info!(
        channel = %config.relay.listen_channel,
        exchange = %config.relay.outgoing_exchange,
        workers = config.relay.dispatch.workers,
        "Configuration loaded"
    );

    if config.dev_mode {
        info!("Installing notify trigger (dev mode)");
        if let Err(e) = db::run_migrations(&config.relay.database_url).await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let bridge = Arc::new(EventBridge::from_config(config.relay.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = match config.health_addr {
        Some(addr) => {
            let app = api::create_router(api::AppState::new(Arc::clone(&bridge)));
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(addr = %addr, "Health server listening");

            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let mut shutdown_rx = shutdown_rx;
                        let _ = shutdown_rx.wait_for(|stop| *stop).await;
                        info!("Health server shutting down");
                    })
                    .await
            }))
        }
        None => {
            info!("Health server disabled");
            None
        }
    };

    let mut connecting = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { bridge.connect().await }
    });
    let connected = tokio::select! {
        result = &mut connecting => result?,
        _ = shutdown_signal() => {
            info!("Received shutdown signal during start-up");
            bridge.disconnect().await;
            let _ = connecting.await;
            let _ = shutdown_tx.send(true);
            return Ok(());
        }
    };
    if let Err(e) = connected {
        error!(error = %e, "Event relay failed to start");
        let _ = shutdown_tx.send(true);
        return Err(e.into());
    }

    shutdown_signal().await;
    info!("Received shutdown signal");

    bridge.disconnect().await;
    let _ = shutdown_tx.send(true);

    if let Some(handle) = server_handle {
        match tokio::time::timeout(std::time::Duration::from_secs(10), handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(error = %e, "Health server error"),
            Ok(Err(e)) => error!(error = %e, "Health server task panicked"),
            Err(_) => warn!("Health server did not shut down in time"),
        }
    }

    info!("Event relay shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
