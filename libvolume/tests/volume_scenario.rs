//! End-to-end lifecycle runs against both metadata store implementations.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use libvolume::backend::{LocalBackend, MountMode};
use libvolume::store::{ClusterLayout, ConsensusConfig, ConsensusStore, MemoryStore};
use libvolume::{
    BackendRegistry, CreateVolumeRequest, MetadataStore, Parameters, PublishVolumeRequest,
    StageVolumeRequest, UnpublishVolumeRequest, VolumeError, VolumeLifecycle, VolumeStatus,
};

fn registry() -> Arc<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry
        .register("local", LocalBackend::factory(MountMode::Marker))
        .unwrap();
    Arc::new(registry)
}

async fn consensus_store(dir: &Path) -> Arc<dyn MetadataStore> {
    let mut config = ConsensusConfig::new(
        ClusterLayout::single("127.0.0.1:0"),
        dir,
        SocketAddr::from(([127, 0, 0, 1], 0)),
    );
    config.tick_interval = Duration::from_millis(20);
    config.ready_timeout = Duration::from_secs(20);
    Arc::new(ConsensusStore::open(config).await.unwrap())
}

async fn run_scenario(store: Arc<dyn MetadataStore>, root: &Path) {
    let lifecycle = VolumeLifecycle::new(Arc::clone(&store), registry());
    let at = |name: &str| root.join(name).display().to_string();

    let vol = lifecycle
        .create_volume(CreateVolumeRequest {
            name: "demo".into(),
            backend: "local".into(),
            parameters: Parameters::from([("path".into(), at("demo"))]),
        })
        .await
        .unwrap();
    assert_eq!(vol.status, VolumeStatus::Created);

    let staged = lifecycle
        .stage_volume(
            &vol.id,
            StageVolumeRequest {
                staging_path: at("stage"),
                node_id: "n1".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(staged.status, VolumeStatus::Staged);
    assert_eq!(staged.staged_on.iter().collect::<Vec<_>>(), vec!["n1"]);

    let published = lifecycle
        .publish_volume(
            &vol.id,
            PublishVolumeRequest {
                staging_path: at("stage"),
                target_path: at("target"),
                read_only: false,
                node_id: "n1".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(published.status, VolumeStatus::Published);
    assert_eq!(published.published_on.iter().collect::<Vec<_>>(), vec!["n1"]);

    assert!(matches!(
        lifecycle.delete_volume(&vol.id).await,
        Err(VolumeError::Conflict(_))
    ));

    let unpublished = lifecycle
        .unpublish_volume(
            &vol.id,
            UnpublishVolumeRequest {
                target_path: at("target"),
                node_id: Some("n1".into()),
            },
        )
        .await
        .unwrap();
    assert!(unpublished.published_on.is_empty());

    lifecycle.delete_volume(&vol.id).await.unwrap();
    assert!(lifecycle.list_volumes().await.unwrap().is_empty());

    store.close().await.unwrap();
}

async fn racing_creates(store: Arc<dyn MetadataStore>, root: &Path) {
    let lifecycle = Arc::new(VolumeLifecycle::new(Arc::clone(&store), registry()));
    let path = root.join("race").display().to_string();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let lifecycle = Arc::clone(&lifecycle);
        let path = path.clone();
        handles.push(tokio::spawn(async move {
            lifecycle
                .create_volume(CreateVolumeRequest {
                    name: "race".into(),
                    backend: "local".into(),
                    parameters: Parameters::from([("path".into(), path)]),
                })
                .await
        }));
    }

    let mut created = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => created += 1,
            Err(VolumeError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(lifecycle.list_volumes().await.unwrap().len(), 1);

    store.close().await.unwrap();
}

#[tokio::test]
async fn scenario_with_memory_store() {
    let tmp = tempfile::tempdir().unwrap();
    run_scenario(Arc::new(MemoryStore::new()), tmp.path()).await;
}

#[tokio::test]
async fn scenario_with_consensus_store() {
    let tmp = tempfile::tempdir().unwrap();
    let store = consensus_store(&tmp.path().join("meta")).await;
    run_scenario(store, tmp.path()).await;
}

#[tokio::test]
async fn racing_creates_with_memory_store() {
    let tmp = tempfile::tempdir().unwrap();
    racing_creates(Arc::new(MemoryStore::new()), tmp.path()).await;
}

#[tokio::test]
async fn racing_creates_with_consensus_store() {
    let tmp = tempfile::tempdir().unwrap();
    let store = consensus_store(&tmp.path().join("meta")).await;
    racing_creates(store, tmp.path()).await;
}
