use std::path::PathBuf;

use clap::Parser;
use syncline_folder::{Config, Daemon};

/// Syncline folder daemon: sync a directory through a relay.
#[derive(Debug, Parser)]
#[command(name = "syncline-folder", version)]
struct Args {
    /// Directory to watch and sync.
    #[arg(long)]
    dir: PathBuf,

    /// Relay WebSocket endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:3030/sync")]
    url: String,

    /// Human-readable identity announced to the relay; also used for
    /// conflict-loser file names.
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let dir = match args.dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("cannot open vault directory {:?}: {e}", args.dir);
            std::process::exit(1);
        }
    };
    let name = args.name.unwrap_or_else(|| {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "syncline".to_string())
    });

    log::info!(
        "syncline-folder v{}: syncing {:?} as '{}' via {}",
        env!("CARGO_PKG_VERSION"),
        dir,
        name,
        args.url
    );

    let (daemon, updates_rx) = match Daemon::new(Config {
        dir,
        url: args.url,
        name,
    }) {
        Ok(daemon) => daemon,
        Err(e) => {
            log::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = daemon.run(updates_rx) => {
            if let Err(e) = result {
                log::error!("daemon stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted; shutting down");
        }
    }
}
