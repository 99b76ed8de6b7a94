use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::TurnstileConfig;
use turnstile::http::{build_admission_layer, HttpServer};
use turnstile::ratelimit::{LimiterRegistry, Sweeper};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(about = "HTTP server with per-client admission control")]
struct Args {
    /// Path to a configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let settings = config.rate_limit.resolve();
    let registry = Arc::new(LimiterRegistry::new(
        settings.quota(),
        settings.registry,
        Arc::new(SystemClock),
    ));

    let mut router = Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/health", get(health_handler));

    let shutdown = CancellationToken::new();
    let sweeper = match build_admission_layer(&settings, registry.clone()) {
        Some(layer) => {
            info!(
                limit = settings.limit.get(),
                window = ?settings.window,
                "Rate limiting enabled"
            );
            router = router.layer(layer);
            Some(Sweeper::start(
                registry,
                settings.registry.sweep_interval,
                shutdown.child_token(),
            ))
        }
        None => None,
    };

    let server = HttpServer::new(config.server.listen_addr, router);
    let signal_token = shutdown.clone();
    server
        .serve_with_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await?;

    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }

    info!("Turnstile stopped");
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
