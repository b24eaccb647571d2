//! Coordination server daemon.
//!
//! Usage:
//!   switchboard --host 127.0.0.1 --port 29323
//!   switchboard --unix /run/switchboard.sock
//!   switchboard --txn-listen 127.0.0.1:29317   # enable the txn mux

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;

use switchboard_server::{BindAddr, Coordinator};

#[derive(Debug, Parser)]
#[command(
    name = "switchboard",
    about = "Coordination server for sharded bridge workers"
)]
struct Cli {
    /// IP address to listen on.
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 29323)]
    port: u16,

    /// Listen on a Unix socket at this path instead of TCP.
    #[arg(short, long)]
    unix: Option<PathBuf>,

    /// File of tracing filter directives, overriding RUST_LOG.
    #[arg(long)]
    log_config: Option<PathBuf>,

    /// Bind address for the transaction multiplexer (disabled when
    /// unset), e.g. 127.0.0.1:29317.
    #[arg(long)]
    txn_listen: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_config.as_deref()) {
        eprintln!("switchboard: logging setup failed: {e}");
        process::exit(1);
    }

    let addr = match &cli.unix {
        Some(path) => BindAddr::Unix(path.clone()),
        None => BindAddr::Tcp {
            host: cli.host.clone(),
            port: cli.port,
        },
    };

    let coordinator = Coordinator::new();
    let (local, mut serve_task) = match coordinator.spawn_listener(&addr).await {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(address = %addr, error = %e, "failed to bind listener");
            process::exit(1);
        }
    };
    tracing::info!(address = %local, "listening");

    let _txn_task = match &cli.txn_listen {
        Some(txn_addr) => match coordinator.spawn_txn_mux(txn_addr).await {
            Ok((txn_local, task)) => {
                tracing::info!(address = %txn_local, "transaction multiplexer listening");
                Some(task)
            }
            Err(e) => {
                tracing::error!(address = %txn_addr, error = %e, "failed to bind transaction multiplexer");
                process::exit(1);
            }
        },
        None => None,
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            coordinator.manager().close_all().await;
        }
        result = &mut serve_task => {
            match result {
                Ok(Err(e)) => tracing::error!(error = %e, "fatal error in accept loop"),
                Err(e) => tracing::error!(error = %e, "accept loop task failed"),
                Ok(Ok(())) => tracing::error!("accept loop exited unexpectedly"),
            }
            process::exit(10);
        }
    }
}

fn init_logging(config: Option<&Path>) -> Result<(), String> {
    use tracing_subscriber::EnvFilter;

    let filter = match config {
        Some(path) => {
            let directives = std::fs::read_to_string(path)
                .map_err(|e| format!("{}: {e}", path.display()))?;
            let directives = directives
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect::<Vec<_>>()
                .join(",");
            EnvFilter::try_new(directives).map_err(|e| e.to_string())?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
