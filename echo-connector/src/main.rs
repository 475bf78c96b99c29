use std::sync::Arc;

use anyhow::{Context, Result};
use echo_connector::EchoHandler;
use tether::api::{create_router, ApiState};
use tether::{load_settings, ConnectorCore, ConnectorRegistry, ConnectorSettings};
use tracing::{error, info, warn};

// Exit codes for missing required configuration, one per variable so
// orchestrators can tell them apart.
const EXIT_MISSING_AUTH_TOKEN: i32 = 2;
const EXIT_MISSING_SOURCES: i32 = 3;
const EXIT_MISSING_SERVER_URL: i32 = 4;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echo_connector=info,tether=info".into()),
        )
        .init();

    info!("Echo connector starting...");

    // Read configuration from environment
    let auth_token = match std::env::var("TETHER_AUTH_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => {
            error!("TETHER_AUTH_TOKEN is required");
            std::process::exit(EXIT_MISSING_AUTH_TOKEN);
        }
    };

    let sources: Vec<String> = std::env::var("TETHER_SOURCES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    if sources.is_empty() {
        error!("TETHER_SOURCES is required (comma-separated source names)");
        std::process::exit(EXIT_MISSING_SOURCES);
    }

    let server_url = match std::env::var("TETHER_SERVER_URL") {
        Ok(url) if !url.is_empty() => url,
        _ => {
            error!("TETHER_SERVER_URL is required");
            std::process::exit(EXIT_MISSING_SERVER_URL);
        }
    };

    let settings = match std::env::var("TETHER_SETTINGS") {
        Ok(path) => load_settings(&path)?,
        Err(_) => ConnectorSettings::default(),
    };

    let status_port: u16 = std::env::var("TETHER_STATUS_PORT")
        .unwrap_or_else(|_| "8090".to_string())
        .parse()
        .context("TETHER_STATUS_PORT must be a valid port number")?;

    info!(
        server_url = %server_url,
        sources = sources.len(),
        status_port = status_port,
        "Configuration loaded"
    );

    // One connector instance per source, all sharing the tunables
    let registry = Arc::new(ConnectorRegistry::new());
    for source in &sources {
        let core = ConnectorCore::new(
            settings.session(&server_url, &auth_token, source),
            Arc::new(EchoHandler::new()),
            &settings,
        );
        if let Err(e) = registry.register(core) {
            warn!(source = %source, error = %e, "skipping source");
        }
    }

    let started = registry.start_all(settings.connect_timeout()).await;
    if started == 0 {
        warn!("no sources came up; serving status endpoints anyway");
    }

    // Start status HTTP server
    let router = create_router(ApiState {
        registry: Arc::clone(&registry),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", status_port))
        .await
        .context("Failed to bind status port")?;
    info!(port = status_port, "Status API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Status API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    server_handle.abort();
    registry.stop_all().await;
    info!("Echo connector stopped");

    Ok(())
}
