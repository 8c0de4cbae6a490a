//! QUIC server that runs on each worker node and dispatches incoming CSI
//! requests to the appropriate trait implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::MAX_MESSAGE_SIZE;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to an [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(addr = %endpoint.local_addr().unwrap_or(addr), "CSI QUIC server listening");
        Ok(Self { endpoint, handler })
    }

    /// The address the endpoint is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, CsiError> {
        self.endpoint.local_addr().map_err(CsiError::transport)
    }

    /// Accept connections until `shutdown` fires, then wait for every
    /// in-flight request to be answered before closing the endpoint.
    ///
    /// Each accepted connection runs on its own task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<(), CsiError> {
        let tracker = TaskTracker::new();

        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            let handler = Arc::clone(&self.handler);
            let conn_tracker = tracker.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) =
                            Self::handle_connection(conn, handler, conn_tracker, shutdown).await
                        {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }

        tracker.close();
        if !tracker.is_empty() {
            info!(in_flight = tracker.len(), "waiting for in-flight CSI requests");
        }
        tracker.wait().await;

        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
        self.endpoint.wait_idle().await;
        info!("CSI QUIC server stopped");
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(
        conn: quinn::Connection,
        handler: Arc<T>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Result<(), CsiError> {
        loop {
            let (send, recv) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                stream = conn.accept_bi() => match stream {
                    Ok(stream) => stream,
                    Err(quinn::ConnectionError::ApplicationClosed(_))
                    | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                    Err(e) => return Err(CsiError::transport(e)),
                },
            };

            let handler = Arc::clone(&handler);
            tracker.spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &handler).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                Self::dispatch(handler, request).await
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        // Keep the stream open until the peer has the whole response.
        let _ = send.stopped().await;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => match handler.probe().await {
                Ok(ok) => CsiMessage::ProbeResult(ok),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginInfo => match handler.get_plugin_info().await {
                Ok(info) => CsiMessage::PluginInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetPluginCapabilities => match handler.get_plugin_capabilities().await {
                Ok(caps) => CsiMessage::PluginCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => match handler.create_volume(req).await {
                Ok(vol) => CsiMessage::VolumeCreated(vol),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::DeleteVolume(id) => match handler.delete_volume(&id).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ListVolumes => match handler.list_volumes().await {
                Ok(vols) => CsiMessage::VolumeList(vols),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetCapacity => match handler.get_capacity().await {
                Ok(cap) => CsiMessage::Capacity(cap),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => match handler
                .validate_volume_capabilities(&volume_id, &capabilities)
                .await
            {
                Ok(valid) => CsiMessage::CapabilitiesValid(valid),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetControllerCapabilities => {
                match handler.get_controller_capabilities().await {
                    Ok(caps) => CsiMessage::ControllerCapabilitiesResponse(caps),
                    Err(e) => CsiMessage::Error(e),
                }
            }

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => match handler.stage_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => match handler
                .unstage_volume(&volume_id, &staging_target_path)
                .await
            {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::PublishVolume(req) => match handler.publish_volume(req).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => match handler.unpublish_volume(&volume_id, &target_path).await {
                Ok(()) => CsiMessage::Ok,
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetNodeInfo => match handler.get_info().await {
                Ok(info) => CsiMessage::NodeInfoResponse(info),
                Err(e) => CsiMessage::Error(e),
            },
            CsiMessage::GetNodeCapabilities => match handler.get_capabilities().await {
                Ok(caps) => CsiMessage::NodeCapabilitiesResponse(caps),
                Err(e) => CsiMessage::Error(e),
            },

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CsiMessage::Error(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }
}
