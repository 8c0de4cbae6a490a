//! `rkvol`: volume manager and CSI node agent.
//!
//! * `rkvol manager` runs the control plane: metadata store, backend
//!   registry and the HTTP API.
//! * `rkvol csi-plugin` runs the per-node agent that serves CSI over QUIC and
//!   forwards every call to the manager.

mod logging;
mod manager;
mod plugin;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use logging::{LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "rkvol", version, about = "Volume lifecycle management for rk8s")]
struct Cli {
    /// Minimum level of emitted log records. `RUST_LOG` takes precedence.
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Log record format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the volume manager (control plane)
    Manager(manager::ManagerArgs),
    /// Run the CSI node agent
    CsiPlugin(plugin::PluginArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level, cli.log_format)?;
    info!(version = env!("CARGO_PKG_VERSION"), "rkvol starting");

    match cli.command {
        Command::Manager(args) => manager::run(args).await,
        Command::CsiPlugin(args) => plugin::run(args).await,
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
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
    info!("shutdown requested");
}
