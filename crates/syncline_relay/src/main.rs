use std::path::PathBuf;
use std::sync::Arc;

use axum::{Router, routing::get};
use clap::Parser;
use syncline_relay::{BroadcastHub, Compactor, Relay, UpdateStore, ws::ws_handler};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Syncline sync relay: durable update log and broadcast fabric.
#[derive(Debug, Parser)]
#[command(name = "syncline-relay", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 3030)]
    port: u16,

    /// Path of the SQLite database file.
    #[arg(long, default_value = "./syncline.db")]
    db_path: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncline_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("starting syncline-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("database path: {:?}", args.db_path);

    let store = match UpdateStore::open(&args.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open database {:?}: {}", args.db_path, e);
            std::process::exit(1);
        }
    };

    let hub = Arc::new(BroadcastHub::new());
    let relay = Arc::new(Relay::new(store.clone(), hub));

    let compactor = Compactor::new(store);
    tokio::spawn(compactor.run());

    let app = Router::new()
        .route("/", get(|| async { "Syncline Relay" }))
        .route("/health", get(|| async { "OK" }))
        .route("/sync", get(ws_handler).with_state(relay))
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("listening on ws://{}/sync", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {}", e);
        std::process::exit(1);
    }

    info!("shut down cleanly");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
