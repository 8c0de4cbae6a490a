//! Consensus-backed metadata store.
//!
//! Volume records live in a replicated key-value map (see
//! [`state_machine`]) driven by an embedded raft member (see [`node`]).
//!
//! ```text
//! /volumes/<id>          -> JSON volume record
//! /volume-names/<name>   -> <id>
//! ```
//!
//! Writes are conditional transactions so uniqueness checks and dual writes
//! commit atomically. Reads go through a read-index barrier and are therefore
//! linearizable. Every call is bounded by the configured request timeout.

pub mod cluster;
pub mod node;
pub mod state_machine;
pub mod storage;
pub mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::{MetadataStore, VOLUME_PREFIX, volume_key, volume_name_key};
use crate::error::StoreError;
use crate::types::Volume;

pub use cluster::ClusterLayout;
use node::RaftMember;
use state_machine::{Compare, KvStateMachine, Op, Txn, TxnResponse};

/// Errors raised while starting or running the raft member.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid cluster layout: {0}")]
    Layout(String),

    #[error("raft: {0}")]
    Raft(#[from] raft::Error),

    #[error("raft log storage: {0}")]
    Storage(#[from] sled::Error),

    #[error("raft codec: {0}")]
    Codec(String),

    #[error("consensus member not ready after {0:?}")]
    NotReady(Duration),

    #[error("peer listener: {0}")]
    Io(#[from] std::io::Error),

    #[error("consensus member stopped")]
    Stopped,
}

impl From<protobuf::ProtobufError> for ConsensusError {
    fn from(e: protobuf::ProtobufError) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<ConsensusError> for StoreError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::NotReady(_) | ConsensusError::Stopped => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Internal(other.to_string()),
        }
    }
}

/// Settings for the embedded raft member.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub layout: ClusterLayout,
    /// Directory holding the raft log (`<data_dir>/consensus`).
    pub data_dir: PathBuf,
    /// Address the peer listener binds when the group has remote members.
    pub listen_addr: SocketAddr,
    pub tick_interval: Duration,
    /// Startup fails if no leader emerges within this window.
    pub ready_timeout: Duration,
    /// Deadline applied to every store call.
    pub request_timeout: Duration,
}

impl ConsensusConfig {
    pub fn new(layout: ClusterLayout, data_dir: impl Into<PathBuf>, listen_addr: SocketAddr) -> Self {
        Self {
            layout,
            data_dir: data_dir.into(),
            listen_addr,
            tick_interval: Duration::from_millis(100),
            ready_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// [`MetadataStore`] replicated through raft.
pub struct ConsensusStore {
    member: RaftMember,
    request_timeout: Duration,
}

impl ConsensusStore {
    /// Start the embedded member and wait for it to become ready.
    pub async fn open(config: ConsensusConfig) -> Result<Self, ConsensusError> {
        let member = RaftMember::start(&config).await?;
        info!(
            data_dir = %config.data_dir.display(),
            "consensus-backed metadata store opened"
        );
        Ok(Self {
            member,
            request_timeout: config.request_timeout,
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        tokio::time::timeout(self.request_timeout, self.member.propose(txn))
            .await
            .map_err(|_| StoreError::Timeout(self.request_timeout))?
    }

    /// Run `read` against the local state machine after a read barrier.
    async fn read<R>(&self, read: impl FnOnce(&KvStateMachine) -> R) -> Result<R, StoreError> {
        tokio::time::timeout(self.request_timeout, self.member.read_barrier())
            .await
            .map_err(|_| StoreError::Timeout(self.request_timeout))??;
        let sm = self.member.state().read().await;
        Ok(read(&sm))
    }

    async fn read_raw(&self, id: &str) -> Result<Option<String>, StoreError> {
        let key = volume_key(id);
        self.read(|sm| sm.get(&key).map(str::to_owned)).await
    }
}

#[async_trait]
impl MetadataStore for ConsensusStore {
    #[instrument(skip_all, fields(id = %volume.id, name = %volume.name))]
    async fn create_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let value = serde_json::to_string(volume)?;
        let name_key = volume_name_key(&volume.name);
        let key = volume_key(&volume.id);
        let txn = Txn::when(vec![
            Compare::Absent(name_key.clone()),
            Compare::Absent(key.clone()),
        ])
        .and_then(vec![
            Op::Put { key, value },
            Op::Put {
                key: name_key,
                value: volume.id.clone(),
            },
        ]);

        if self.txn(txn).await?.succeeded {
            return Ok(());
        }
        let name_key = volume_name_key(&volume.name);
        let name_taken = self.read(|sm| sm.get(&name_key).is_some()).await?;
        if name_taken {
            Err(StoreError::AlreadyExists(volume.name.clone()))
        } else {
            Err(StoreError::AlreadyExists(volume.id.clone()))
        }
    }

    async fn get_volume(&self, id: &str) -> Result<Volume, StoreError> {
        let raw = self
            .read_raw(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn get_volume_by_name(&self, name: &str) -> Result<Volume, StoreError> {
        let name_key = volume_name_key(name);
        let raw = self
            .read(|sm| {
                sm.get(&name_key)
                    .and_then(|id| sm.get(&volume_key(id)))
                    .map(str::to_owned)
            })
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, StoreError> {
        let raw: Vec<(String, String)> = self
            .read(|sm| {
                sm.scan_prefix(VOLUME_PREFIX)
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .collect()
            })
            .await?;

        let mut volumes = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_str(&value) {
                Ok(volume) => volumes.push(volume),
                Err(e) => warn!(%key, error = %e, "skipping undecodable volume record"),
            }
        }
        Ok(volumes)
    }

    #[instrument(skip_all, fields(id = %volume.id))]
    async fn update_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let key = volume_key(&volume.id);
        let value = serde_json::to_string(volume)?;
        let txn = Txn::when(vec![Compare::Present(key.clone())])
            .and_then(vec![Op::Put { key, value }]);

        if !self.txn(txn).await?.succeeded {
            return Err(StoreError::NotFound(volume.id.clone()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(id = %current.id))]
    async fn compare_and_update(&self, current: &Volume, next: &Volume) -> Result<(), StoreError> {
        let key = volume_key(&current.id);
        let txn = Txn::when(vec![Compare::ValueEquals {
            key: key.clone(),
            value: serde_json::to_string(current)?,
        }])
        .and_then(vec![Op::Put {
            key,
            value: serde_json::to_string(next)?,
        }]);

        if self.txn(txn).await?.succeeded {
            return Ok(());
        }
        match self.read_raw(&current.id).await? {
            Some(_) => Err(StoreError::Conflict(current.id.clone())),
            None => Err(StoreError::NotFound(current.id.clone())),
        }
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, id: &str) -> Result<(), StoreError> {
        let volume = self.get_volume(id).await?;
        let key = volume_key(id);
        let txn = Txn::when(vec![Compare::Present(key.clone())]).and_then(vec![
            Op::Delete { key },
            Op::Delete {
                key: volume_name_key(&volume.name),
            },
        ]);

        if !self.txn(txn).await?.succeeded {
            return Err(StoreError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(id = %current.id))]
    async fn compare_and_delete(&self, current: &Volume) -> Result<(), StoreError> {
        let key = volume_key(&current.id);
        let txn = Txn::when(vec![Compare::ValueEquals {
            key: key.clone(),
            value: serde_json::to_string(current)?,
        }])
        .and_then(vec![
            Op::Delete { key },
            Op::Delete {
                key: volume_name_key(&current.name),
            },
        ]);

        if self.txn(txn).await?.succeeded {
            return Ok(());
        }
        match self.read_raw(&current.id).await? {
            Some(_) => Err(StoreError::Conflict(current.id.clone())),
            None => Err(StoreError::NotFound(current.id.clone())),
        }
    }

    async fn is_ready(&self) -> bool {
        self.member.is_ready()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.member.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::types::Parameters;

    fn local_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn test_config(layout: ClusterLayout, dir: &std::path::Path, listen: SocketAddr) -> ConsensusConfig {
        let mut config = ConsensusConfig::new(layout, dir, listen);
        config.tick_interval = Duration::from_millis(20);
        config.ready_timeout = Duration::from_secs(20);
        config
    }

    async fn single_node(dir: &std::path::Path) -> ConsensusStore {
        let layout = ClusterLayout::single("127.0.0.1:0");
        ConsensusStore::open(test_config(layout, dir, local_addr()))
            .await
            .unwrap()
    }

    fn volume(name: &str) -> Volume {
        Volume::new(
            name,
            "local",
            Parameters::from([("path".into(), format!("/data/{name}"))]),
        )
    }

    #[tokio::test]
    async fn single_node_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = single_node(dir.path()).await;
        assert!(store.is_ready().await);

        let vol = volume("demo");
        store.create_volume(&vol).await.unwrap();
        assert_eq!(store.get_volume(&vol.id).await.unwrap(), vol);
        assert_eq!(store.get_volume_by_name("demo").await.unwrap().id, vol.id);

        let mut updated = vol.clone();
        updated.staged_on.insert("n1".into());
        updated.refresh_status();
        store.update_volume(&updated).await.unwrap();
        assert_eq!(store.get_volume(&vol.id).await.unwrap(), updated);

        assert_eq!(store.list_volumes().await.unwrap().len(), 1);

        store.delete_volume(&vol.id).await.unwrap();
        assert!(matches!(
            store.get_volume(&vol.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.get_volume_by_name("demo").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_volume(&vol.id).await,
            Err(StoreError::NotFound(_))
        ));

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_creates_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(single_node(dir.path()).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.create_volume(&volume("shared")).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(StoreError::AlreadyExists(name)) => assert_eq!(name, "shared"),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.list_volumes().await.unwrap().len(), 1);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn stale_compare_and_update_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = single_node(dir.path()).await;
        let vol = volume("demo");
        store.create_volume(&vol).await.unwrap();

        let mut first = vol.clone();
        first.published_on.insert("n1".into());
        store.compare_and_update(&vol, &first).await.unwrap();

        let err = store.compare_and_update(&vol, &vol).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        assert!(matches!(
            store.compare_and_delete(&vol).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.get_volume(&vol.id).await.unwrap(), first);

        store.compare_and_delete(&first).await.unwrap();
        assert!(matches!(
            store.get_volume_by_name("demo").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.compare_and_delete(&first).await,
            Err(StoreError::NotFound(_))
        ));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_id_reports_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = single_node(dir.path()).await;
        let vol = volume("first");
        store.create_volume(&vol).await.unwrap();

        let mut same_id = volume("second");
        same_id.id = vol.id.clone();
        match store.create_volume(&same_id).await {
            Err(StoreError::AlreadyExists(key)) => assert_eq!(key, vol.id),
            other => panic!("unexpected result {other:?}"),
        }
        match store.create_volume(&volume("first")).await {
            Err(StoreError::AlreadyExists(key)) => assert_eq!(key, "first"),
            other => panic!("unexpected result {other:?}"),
        }
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn lost_quorum_times_out() {
        let mut ports = Vec::new();
        for _ in 0..2 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            ports.push(listener.local_addr().unwrap().port());
        }
        let peers: BTreeMap<u64, String> = ports
            .iter()
            .enumerate()
            .map(|(i, port)| (i as u64 + 1, format!("127.0.0.1:{port}")))
            .collect();
        let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
        let configs: Vec<_> = (0..2)
            .map(|i| {
                let layout = ClusterLayout::with_peers(i as u64 + 1, peers.clone()).unwrap();
                let listen = SocketAddr::from(([127, 0, 0, 1], ports[i]));
                let mut config = test_config(layout, dirs[i].path(), listen);
                config.request_timeout = Duration::from_millis(500);
                config
            })
            .collect();

        let (a, b) = tokio::join!(
            ConsensusStore::open(configs[0].clone()),
            ConsensusStore::open(configs[1].clone()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let vol = volume("before");
        a.create_volume(&vol).await.unwrap();

        // With one of two members gone no write can reach a quorum.
        b.close().await.unwrap();
        let started = std::time::Instant::now();
        let err = a.create_volume(&volume("after")).await.unwrap_err();
        assert!(
            matches!(err, StoreError::Timeout(_) | StoreError::Unavailable(_)),
            "unexpected error {err:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn startup_fails_without_quorum() {
        let ports: Vec<u16> = {
            let mut ports = Vec::new();
            for _ in 0..2 {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                ports.push(listener.local_addr().unwrap().port());
            }
            ports
        };
        let peers: BTreeMap<u64, String> = ports
            .iter()
            .enumerate()
            .map(|(i, port)| (i as u64 + 1, format!("127.0.0.1:{port}")))
            .collect();
        let dir = tempfile::tempdir().unwrap();
        let layout = ClusterLayout::with_peers(1, peers).unwrap();
        let listen = SocketAddr::from(([127, 0, 0, 1], ports[0]));
        let mut config = test_config(layout, dir.path(), listen);
        config.ready_timeout = Duration::from_secs(1);

        let started = std::time::Instant::now();
        let result = ConsensusStore::open(config).await;
        assert!(matches!(result, Err(ConsensusError::NotReady(t)) if t == Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let vol = volume("durable");
        {
            let store = single_node(dir.path()).await;
            store.create_volume(&vol).await.unwrap();
            store.close().await.unwrap();
        }

        let store = single_node(dir.path()).await;
        assert_eq!(store.get_volume(&vol.id).await.unwrap(), vol);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn changed_membership_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        single_node(dir.path()).await.close().await.unwrap();

        let layout = ClusterLayout::with_peers(
            1,
            BTreeMap::from([
                (1, "127.0.0.1:1".to_owned()),
                (2, "127.0.0.1:2".to_owned()),
            ]),
        )
        .unwrap();
        let result = ConsensusStore::open(test_config(layout, dir.path(), local_addr())).await;
        assert!(matches!(result, Err(ConsensusError::Layout(_))));
    }

    #[tokio::test]
    async fn three_members_replicate() {
        let mut ports = Vec::new();
        for _ in 0..3 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            ports.push(listener.local_addr().unwrap().port());
        }
        let peers: BTreeMap<u64, String> = ports
            .iter()
            .enumerate()
            .map(|(i, port)| (i as u64 + 1, format!("127.0.0.1:{port}")))
            .collect();

        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let configs: Vec<_> = (0..3)
            .map(|i| {
                let layout = ClusterLayout::with_peers(i as u64 + 1, peers.clone()).unwrap();
                let listen = SocketAddr::from(([127, 0, 0, 1], ports[i]));
                test_config(layout, dirs[i].path(), listen)
            })
            .collect();

        let (a, b, c) = tokio::join!(
            ConsensusStore::open(configs[0].clone()),
            ConsensusStore::open(configs[1].clone()),
            ConsensusStore::open(configs[2].clone()),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        let vol = volume("replicated");
        a.create_volume(&vol).await.unwrap();
        assert_eq!(c.get_volume(&vol.id).await.unwrap(), vol);
        assert!(matches!(
            b.create_volume(&volume("replicated")).await,
            Err(StoreError::AlreadyExists(_))
        ));

        a.close().await.unwrap();
        b.close().await.unwrap();
        c.close().await.unwrap();
    }
}
