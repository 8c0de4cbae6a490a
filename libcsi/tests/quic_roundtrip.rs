//! A node agent served over QUIC, backed by an in-process volume manager.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use libcsi::transport::tls;
use libcsi::{
    CreateVolumeRequest, CsiClient, CsiError, CsiMessage, CsiServer, NodeCapability,
    NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeCapability, VolumeDriver,
};
use libvolume::api::ManagerClient;
use libvolume::backend::{BackendRegistry, LocalBackend, MountMode};
use libvolume::store::MemoryStore;
use libvolume::VolumeLifecycle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn start_manager(shutdown: &CancellationToken) -> String {
    let mut registry = BackendRegistry::new();
    registry
        .register("local", LocalBackend::factory(MountMode::Marker))
        .unwrap();
    let lifecycle = Arc::new(VolumeLifecycle::new(
        Arc::new(MemoryStore::new()),
        Arc::new(registry),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(libvolume::api::serve(listener, lifecycle, shutdown.clone()));
    url
}

#[tokio::test]
async fn volume_lifecycle_over_quic() {
    let shutdown = CancellationToken::new();
    let manager_url = start_manager(&shutdown).await;
    let root = tempfile::tempdir().unwrap();
    let at = |name: &str| root.path().join(name).display().to_string();

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
    let serve = {
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(shutdown).await })
    };

    let client = CsiClient::connect(addr, "localhost", client_tls).await.unwrap();

    assert!(matches!(
        client.call(&CsiMessage::Probe).await.unwrap(),
        CsiMessage::ProbeResult(true)
    ));
    match client.call(&CsiMessage::GetNodeCapabilities).await.unwrap() {
        CsiMessage::NodeCapabilitiesResponse(caps) => {
            assert_eq!(caps, vec![NodeCapability::StageUnstageVolume])
        }
        other => panic!("unexpected response {other}"),
    }

    let volume = match client
        .call(&CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "quic-demo".into(),
            parameters: HashMap::from([
                ("backend".into(), "local".into()),
                ("path".into(), at("data")),
            ]),
            ..Default::default()
        }))
        .await
        .unwrap()
    {
        CsiMessage::VolumeCreated(v) => v,
        other => panic!("unexpected response {other}"),
    };
    assert_eq!(volume.volume_context["backend"], "local");

    client
        .call(&CsiMessage::StageVolume(NodeStageVolumeRequest {
            volume_id: volume.volume_id.clone(),
            staging_target_path: at("staging"),
            volume_capability: VolumeCapability::default(),
            volume_context: volume.volume_context.clone(),
        }))
        .await
        .unwrap();
    client
        .call(&CsiMessage::PublishVolume(NodePublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            staging_target_path: at("staging"),
            target_path: at("target"),
            volume_capability: VolumeCapability::default(),
            read_only: false,
        }))
        .await
        .unwrap();

    let err = client
        .call(&CsiMessage::DeleteVolume(volume.volume_id.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::FailedPrecondition(_)));

    client
        .call(&CsiMessage::UnpublishVolume {
            volume_id: volume.volume_id.clone(),
            target_path: at("target"),
        })
        .await
        .unwrap();
    client
        .call(&CsiMessage::UnstageVolume {
            volume_id: volume.volume_id.clone(),
            staging_target_path: at("staging"),
        })
        .await
        .unwrap();
    client
        .call(&CsiMessage::DeleteVolume(volume.volume_id.clone()))
        .await
        .unwrap();
    // Deleting again is a no-op.
    client
        .call(&CsiMessage::DeleteVolume(volume.volume_id))
        .await
        .unwrap();

    // Responses are not valid requests.
    assert!(matches!(
        client.call(&CsiMessage::Ok).await,
        Err(CsiError::InvalidArgument(_))
    ));

    client.close().await;
    shutdown.cancel();
    serve.await.unwrap().unwrap();
}
