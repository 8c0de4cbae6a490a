//! `rkvol csi-plugin`: the per-node CSI agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use libcsi::transport::tls;
use libcsi::{CsiServer, VolumeDriver};
use libvolume::api::ManagerClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct PluginArgs {
    /// QUIC address the CSI services listen on
    #[arg(long, env = "CSI_ENDPOINT", default_value = "0.0.0.0:10000")]
    pub csi_endpoint: SocketAddr,

    /// Identifier recorded in volume node sets; defaults to the hostname
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,

    /// Base URL of the volume manager API
    #[arg(long, env = "MANAGER_URL", default_value = "http://rkvol-manager:9789")]
    pub manager_url: String,

    /// PEM certificate chain served to CSI clients
    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`
    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Volume limit reported by NodeGetInfo, 0 for unlimited
    #[arg(long, env = "MAX_VOLUMES", default_value_t = 0)]
    pub max_volumes: u64,
}

pub async fn run(args: PluginArgs) -> Result<()> {
    let node_id = match args.node_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => hostname()?,
    };
    info!(%node_id, manager = %args.manager_url, endpoint = %args.csi_endpoint, "CSI plugin configuration");

    let tls_config = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => tls::server_config_from_pem(cert, key)
            .with_context(|| format!("failed to load TLS material from {}", cert.display()))?,
        _ => {
            warn!("no TLS certificate configured, serving a self-signed one");
            let pair = tls::self_signed(&[node_id.clone(), "localhost".to_owned()])
                .context("failed to generate self-signed certificate")?;
            tls::server_config(vec![pair.cert], pair.key)?
        }
    };

    let client = ManagerClient::new(&args.manager_url).context("failed to build manager client")?;
    let driver = VolumeDriver::new(client, node_id).with_max_volumes(args.max_volumes);
    let server = CsiServer::new(args.csi_endpoint, tls_config, Arc::new(driver))
        .context("failed to start CSI server")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            crate::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.serve(shutdown).await?;
    info!("CSI plugin stopped");
    Ok(())
}

fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname().context("failed to read hostname")?;
    match name.into_string() {
        Ok(name) if !name.is_empty() => Ok(name),
        _ => bail!("hostname is not valid UTF-8; pass --node-id"),
    }
}
