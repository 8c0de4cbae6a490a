//! Stopping the node agent while a request is still being served.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use libcsi::transport::tls;
use libcsi::{CreateVolumeRequest, CsiClient, CsiMessage, CsiServer, VolumeDriver};
use libvolume::api::ManagerClient;
use libvolume::backend::{BackendRegistry, LocalBackend, MountMode};
use libvolume::store::{MemoryStore, MetadataStore};
use libvolume::{StoreError, Volume, VolumeLifecycle};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Memory store whose creates take a while and announce when they begin.
struct SlowCreateStore {
    inner: MemoryStore,
    started: Arc<Notify>,
    delay: Duration,
}

#[async_trait::async_trait]
impl MetadataStore for SlowCreateStore {
    async fn create_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.create_volume(volume).await
    }
    async fn get_volume(&self, id: &str) -> Result<Volume, StoreError> {
        self.inner.get_volume(id).await
    }
    async fn get_volume_by_name(&self, name: &str) -> Result<Volume, StoreError> {
        self.inner.get_volume_by_name(name).await
    }
    async fn list_volumes(&self) -> Result<Vec<Volume>, StoreError> {
        self.inner.list_volumes().await
    }
    async fn update_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        self.inner.update_volume(volume).await
    }
    async fn compare_and_update(&self, current: &Volume, next: &Volume) -> Result<(), StoreError> {
        self.inner.compare_and_update(current, next).await
    }
    async fn delete_volume(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete_volume(id).await
    }
    async fn compare_and_delete(&self, current: &Volume) -> Result<(), StoreError> {
        self.inner.compare_and_delete(current).await
    }
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_request() {
    let started = Arc::new(Notify::new());
    let mut registry = BackendRegistry::new();
    registry
        .register("local", LocalBackend::factory(MountMode::Marker))
        .unwrap();
    let store = SlowCreateStore {
        inner: MemoryStore::new(),
        started: Arc::clone(&started),
        delay: Duration::from_millis(500),
    };
    let lifecycle = Arc::new(VolumeLifecycle::new(Arc::new(store), Arc::new(registry)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let manager_url = format!("http://{}", listener.local_addr().unwrap());
    let manager_shutdown = CancellationToken::new();
    tokio::spawn(libvolume::api::serve(
        listener,
        lifecycle,
        manager_shutdown.clone(),
    ));

    let pair = tls::self_signed(&["localhost".to_owned()]).unwrap();
    let server_tls = tls::server_config(vec![pair.cert.clone()], pair.key).unwrap();
    let client_tls = tls::client_config(&[pair.cert]).unwrap();
    let driver = VolumeDriver::new(ManagerClient::new(manager_url).unwrap(), "node-a");
    let server = Arc::new(
        CsiServer::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            server_tls,
            Arc::new(driver),
        )
        .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let csi_shutdown = CancellationToken::new();
    let serve = {
        let server = Arc::clone(&server);
        let shutdown = csi_shutdown.clone();
        tokio::spawn(async move { server.serve(shutdown).await })
    };

    let client = CsiClient::connect(addr, "localhost", client_tls).await.unwrap();
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data").display().to_string();
    let create = CsiMessage::CreateVolume(CreateVolumeRequest {
        name: "in-flight".into(),
        parameters: HashMap::from([("path".into(), data.clone())]),
        ..Default::default()
    });

    let stop = async {
        started.notified().await;
        csi_shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !serve.is_finished(),
            "server returned while a request was in flight"
        );
    };
    let (reply, ()) = tokio::join!(client.call(&create), stop);

    match reply.unwrap() {
        CsiMessage::VolumeCreated(volume) => assert_eq!(volume.volume_context["path"], data),
        other => panic!("unexpected response {other}"),
    }

    client.close().await;
    tokio::time::timeout(Duration::from_secs(10), serve)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    manager_shutdown.cancel();
}
