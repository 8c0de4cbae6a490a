//! `rkvol manager`: the control-plane process.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use libvolume::backend::local::LOCAL_BACKEND;
use libvolume::backend::{BackendRegistry, LocalBackend, MountMode};
use libvolume::store::{ClusterLayout, ConsensusConfig, ConsensusStore, MemoryStore};
use libvolume::{MetadataStore, VolumeLifecycle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ManagerArgs {
    /// Address the HTTP API binds
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// HTTP API port
    #[arg(long, env = "PORT", default_value_t = 9789, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Directory for persistent state (raft log)
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/rkvol")]
    pub data_dir: PathBuf,

    /// Replicate metadata through the embedded raft group instead of keeping
    /// it in memory
    #[arg(long, env = "CONSENSUS_ENABLED")]
    pub consensus_enabled: bool,

    /// Number of manager replicas in the raft group
    #[arg(long, env = "CLUSTER_SIZE", default_value_t = 1)]
    pub cluster_size: u64,

    /// Service name replicas are addressed by (`<service>.<slot>`)
    #[arg(long, env = "SERVICE_NAME", default_value = "rkvol")]
    pub service_name: String,

    /// Ordinal of this replica, `1..=cluster-size`
    #[arg(long, env = "TASK_SLOT", default_value_t = 1)]
    pub task_slot: u64,

    /// Port of the raft peer listener
    #[arg(long, env = "PEER_PORT", default_value_t = 2380, value_parser = clap::value_parser!(u16).range(1..))]
    pub peer_port: u16,

    /// Seconds to wait for the raft group to elect a leader at startup
    #[arg(long, env = "READY_TIMEOUT_SECS", default_value_t = 60)]
    pub ready_timeout_secs: u64,

    /// Deadline in seconds for a single metadata operation
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    pub request_timeout_secs: u64,

    /// How the local backend publishes volumes (bind, marker)
    #[arg(long, env = "MOUNT_MODE", default_value = "bind")]
    pub mount_mode: MountMode,
}

pub async fn run(args: ManagerArgs) -> Result<()> {
    let mut registry = BackendRegistry::new();
    registry
        .register(LOCAL_BACKEND, LocalBackend::factory(args.mount_mode))
        .context("failed to register local backend")?;
    info!(mount_mode = %args.mount_mode, "storage backends registered");

    let store = open_store(&args).await?;
    let lifecycle = Arc::new(VolumeLifecycle::new(Arc::clone(&store), Arc::new(registry)));

    let addr = SocketAddr::new(args.host, args.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            crate::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let served = libvolume::api::serve(listener, lifecycle, shutdown).await;
    if let Err(e) = store.close().await {
        warn!(error = %e, "metadata store did not close cleanly");
    }
    served.context("API server failed")?;
    info!("volume manager stopped");
    Ok(())
}

async fn open_store(args: &ManagerArgs) -> Result<Arc<dyn MetadataStore>> {
    if !args.consensus_enabled {
        warn!("consensus disabled, volume metadata is kept in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let layout = ClusterLayout::derive(
        &args.service_name,
        args.cluster_size,
        args.task_slot,
        args.peer_port,
    )
    .context("invalid cluster layout")?;
    info!(
        member = %layout.member_name(&args.service_name),
        cluster_size = args.cluster_size,
        "starting consensus member"
    );

    let mut config = ConsensusConfig::new(
        layout,
        &args.data_dir,
        SocketAddr::new(args.host, args.peer_port),
    );
    config.ready_timeout = Duration::from_secs(args.ready_timeout_secs);
    config.request_timeout = Duration::from_secs(args.request_timeout_secs);

    let store = ConsensusStore::open(config)
        .await
        .context("consensus member failed to start")?;
    Ok(Arc::new(store))
}
