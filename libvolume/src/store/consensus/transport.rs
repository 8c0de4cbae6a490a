//! Raft peer transport over HTTP.
//!
//! Each member exposes `POST /raft/message` on its peer listener; the body is
//! a protobuf-encoded raft message. Outgoing messages are queued per peer and
//! delivered in order by a dedicated task. Delivery failures are logged and
//! dropped: raft retransmits on its own schedule.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use protobuf::Message as PbMessage;
use raft::prelude::Message as RaftMessage;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ClusterLayout;

const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const OUTBOX_CAPACITY: usize = 1024;

/// Outgoing side: one bounded queue per remote member.
pub struct PeerTransport {
    outboxes: HashMap<u64, mpsc::Sender<RaftMessage>>,
}

impl PeerTransport {
    /// Spawn one delivery task per remote member of `layout`.
    pub fn start(layout: &ClusterLayout, shutdown: &CancellationToken) -> (Self, Vec<JoinHandle<()>>) {
        let client = reqwest::Client::builder()
            .connect_timeout(PEER_CONNECT_TIMEOUT)
            .timeout(PEER_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let mut outboxes = HashMap::new();
        let mut tasks = Vec::new();
        for (id, addr) in layout.remotes() {
            let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
            outboxes.insert(id, tx);
            tasks.push(tokio::spawn(run_outbox(
                id,
                format!("http://{addr}/raft/message"),
                client.clone(),
                rx,
                shutdown.clone(),
            )));
        }
        (Self { outboxes }, tasks)
    }

    pub fn send(&self, msg: RaftMessage) {
        let to = msg.to;
        match self.outboxes.get(&to) {
            Some(outbox) => {
                if let Err(e) = outbox.try_send(msg) {
                    debug!(to, error = %e, "dropping raft message");
                }
            }
            None => warn!(to, "raft message addressed to unknown member"),
        }
    }

    pub fn send_all(&self, msgs: Vec<RaftMessage>) {
        for msg in msgs {
            self.send(msg);
        }
    }
}

async fn run_outbox(
    to: u64,
    url: String,
    client: reqwest::Client,
    mut rx: mpsc::Receiver<RaftMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let body = match msg.write_to_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!(to, error = %e, "failed to encode raft message");
                continue;
            }
        };
        match client.post(&url).body(body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                debug!(to, status = %resp.status(), "peer rejected raft message");
            }
            Ok(_) => {}
            Err(e) => debug!(to, error = %e, "raft message delivery failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Incoming side
// ---------------------------------------------------------------------------

fn router(inbox: mpsc::Sender<RaftMessage>) -> Router {
    Router::new()
        .route("/raft/message", post(receive))
        .with_state(inbox)
}

async fn receive(State(inbox): State<mpsc::Sender<RaftMessage>>, body: Bytes) -> StatusCode {
    let msg = match RaftMessage::parse_from_bytes(&body) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "malformed raft message");
            return StatusCode::BAD_REQUEST;
        }
    };
    match inbox.send(msg).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Serve the peer listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    inbox: mpsc::Sender<RaftMessage>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "raft peer listener started");
    }
    axum::serve(listener, router(inbox))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;

    #[tokio::test]
    async fn messages_cross_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let (inbox, mut received) = mpsc::channel(16);
        let server = tokio::spawn(serve(listener, inbox, shutdown.clone()));

        let layout = ClusterLayout::with_peers(
            1,
            [(1, "127.0.0.1:1".to_owned()), (2, addr.to_string())].into(),
        )
        .unwrap();
        let (transport, tasks) = PeerTransport::start(&layout, &shutdown);

        let mut msg = RaftMessage::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = 1;
        msg.to = 2;
        msg.term = 7;
        transport.send(msg);

        let got = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.get_msg_type(), MessageType::MsgHeartbeat);
        assert_eq!(got.term, 7);

        shutdown.cancel();
        server.await.unwrap().unwrap();
        for t in tasks {
            t.await.unwrap();
        }
    }
}
