//! Embedded raft member.
//!
//! A single Tokio task owns the [`RawNode`]: it ticks the clock, steps peer
//! messages, turns caller requests into proposals or read-index requests, and
//! drains `Ready` in the order raft expects (send, apply, persist, advance).
//! Callers talk to it through [`RaftMember`].

use std::collections::HashMap;
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::prelude::{ConfChange, ConfChangeV2, Entry, EntryType, Message as RaftMessage};
use raft::storage::MemStorage;
use raft::{Config, RawNode, INVALID_ID};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state_machine::{KvStateMachine, Proposal, Txn, TxnResponse};
use super::storage::DiskStorage;
use super::transport::{self, PeerTransport};
use super::{ConsensusConfig, ConsensusError};
use crate::error::StoreError;

const REQUEST_QUEUE: usize = 1024;
const PEER_INBOX: usize = 2048;

type ProposalReply = oneshot::Sender<Result<TxnResponse, StoreError>>;
type ReadReply = oneshot::Sender<Result<(), StoreError>>;

enum Request {
    Propose { txn: Txn, reply: ProposalReply },
    ReadIndex { reply: ReadReply },
}

fn stopped() -> StoreError {
    StoreError::Unavailable("consensus member stopped".into())
}

/// Handle to a running raft member.
pub struct RaftMember {
    requests: mpsc::Sender<Request>,
    ready: watch::Receiver<bool>,
    state: Arc<RwLock<KvStateMachine>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftMember {
    /// Start the member and block until it knows a leader that has committed
    /// an entry in its term, or until `config.ready_timeout` expires.
    pub async fn start(config: &ConsensusConfig) -> Result<Self, ConsensusError> {
        let layout = &config.layout;
        let voters = layout.voters();
        let storage = DiskStorage::open(&config.data_dir.join("consensus"), &voters)?;

        let raft_config = Config {
            id: layout.node_id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        let logger = raft::default_logger();
        let mut node = RawNode::new(&raft_config, storage.raft_storage(), &logger)?;
        if layout.is_single() {
            node.campaign()?;
        }

        let shutdown = CancellationToken::new();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (peer_tx, peer_rx) = mpsc::channel(PEER_INBOX);
        let (ready_tx, ready_rx) = watch::channel(false);
        let state = Arc::new(RwLock::new(KvStateMachine::new()));

        let mut tasks = Vec::new();
        let (peers, outbox_tasks) = PeerTransport::start(layout, &shutdown);
        tasks.extend(outbox_tasks);
        if !layout.is_single() {
            let listener = TcpListener::bind(config.listen_addr).await?;
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = transport::serve(listener, peer_tx, token).await {
                    error!(error = %e, "raft peer listener failed");
                }
            }));
        }

        let raft_loop = RaftLoop {
            node,
            storage,
            state: Arc::clone(&state),
            peers,
            proposals: HashMap::new(),
            reads: HashMap::new(),
            read_waiters: Vec::new(),
            ready: ready_tx,
        };
        let tick = config.tick_interval;
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = raft_loop.run(tick, request_rx, peer_rx, token).await {
                error!(error = %e, "raft loop terminated");
            }
        }));

        let member = Self {
            requests: request_tx,
            ready: ready_rx,
            state,
            shutdown,
            tasks: Mutex::new(tasks),
        };

        let mut ready = member.ready.clone();
        let outcome = match tokio::time::timeout(config.ready_timeout, ready.wait_for(|r| *r)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ConsensusError::Stopped),
            Err(_) => Err(ConsensusError::NotReady(config.ready_timeout)),
        };
        if let Err(e) = outcome {
            member.shutdown().await;
            return Err(e);
        }

        info!(
            member = %layout.node_id,
            members = layout.peers.len(),
            "consensus member ready"
        );
        Ok(member)
    }

    /// Replicate `txn` and return its outcome once applied locally.
    pub async fn propose(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Propose { txn, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Wait until the local state machine reflects every write committed
    /// before this call.
    pub async fn read_barrier(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::ReadIndex { reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub fn state(&self) -> &RwLock<KvStateMachine> {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Stop the member and wait for its tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "consensus task panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct RaftLoop {
    node: RawNode<MemStorage>,
    storage: DiskStorage,
    state: Arc<RwLock<KvStateMachine>>,
    peers: PeerTransport,
    /// Proposals awaiting local apply, keyed by proposal id.
    proposals: HashMap<Uuid, ProposalReply>,
    /// Read-index requests awaiting their read state, keyed by context.
    reads: HashMap<Vec<u8>, ReadReply>,
    /// Reads whose read index is known but not yet applied.
    read_waiters: Vec<(u64, ReadReply)>,
    ready: watch::Sender<bool>,
}

impl RaftLoop {
    async fn run(
        mut self,
        tick: std::time::Duration,
        mut requests: mpsc::Receiver<Request>,
        mut inbox: mpsc::Receiver<RaftMessage>,
        shutdown: CancellationToken,
    ) -> Result<(), ConsensusError> {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.node.tick();
                    self.forget_abandoned();
                }
                Some(msg) = inbox.recv() => {
                    if let Err(e) = self.node.step(msg) {
                        debug!(error = %e, "ignoring raft message");
                    }
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }

            self.drain_ready().await?;
            self.publish_readiness();
        }

        self.storage.flush()?;
        info!("raft loop stopped");
        Ok(())
    }

    fn has_leader(&self) -> bool {
        self.node.raft.leader_id != INVALID_ID
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Propose { txn, reply } => {
                if !self.has_leader() {
                    let _ = reply.send(Err(StoreError::Unavailable("no raft leader".into())));
                    return;
                }
                let proposal = Proposal {
                    id: Uuid::new_v4(),
                    txn,
                };
                let data = match serde_json::to_vec(&proposal) {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        return;
                    }
                };
                match self.node.propose(vec![], data) {
                    Ok(()) => {
                        self.proposals.insert(proposal.id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(StoreError::Unavailable(e.to_string())));
                    }
                }
            }
            Request::ReadIndex { reply } => {
                if !self.has_leader() {
                    let _ = reply.send(Err(StoreError::Unavailable("no raft leader".into())));
                    return;
                }
                let ctx = Uuid::new_v4().as_bytes().to_vec();
                self.node.read_index(ctx.clone());
                self.reads.insert(ctx, reply);
            }
        }
    }

    /// Drop bookkeeping for callers that gave up (timeout or cancellation).
    fn forget_abandoned(&mut self) {
        self.proposals.retain(|_, reply| !reply.is_closed());
        self.reads.retain(|_, reply| !reply.is_closed());
        self.read_waiters.retain(|(_, reply)| !reply.is_closed());
    }

    async fn drain_ready(&mut self) -> Result<(), ConsensusError> {
        if !self.node.has_ready() {
            return Ok(());
        }
        let mut ready = self.node.ready();

        if let Some(ss) = ready.ss() {
            info!(
                leader = ss.leader_id,
                role = ?ss.raft_state,
                "raft role changed"
            );
        }

        self.peers.send_all(ready.take_messages());
        if !ready.snapshot().is_empty() {
            warn!("ignoring raft snapshot: log compaction is disabled");
        }
        self.apply(ready.take_committed_entries()).await?;
        self.storage.append(ready.entries())?;
        if let Some(hs) = ready.hs() {
            self.storage.set_hard_state(hs)?;
        }
        self.peers.send_all(ready.take_persisted_messages());

        for rs in ready.read_states() {
            if let Some(reply) = self.reads.remove(&rs.request_ctx) {
                self.read_waiters.push((rs.index, reply));
            }
        }

        let mut light = self.node.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.set_commit(commit)?;
        }
        self.peers.send_all(light.take_messages());
        self.apply(light.take_committed_entries()).await?;
        self.node.advance_apply();

        self.release_reads().await;
        Ok(())
    }

    async fn apply(&mut self, entries: Vec<Entry>) -> Result<(), ConsensusError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut sm = self.state.write().await;
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    if entry.get_data().is_empty() {
                        // Empty entry appended by a new leader.
                        sm.mark_applied(entry.index);
                        continue;
                    }
                    match serde_json::from_slice::<Proposal>(entry.get_data()) {
                        Ok(proposal) => {
                            let response = sm.apply(entry.index, &proposal.txn);
                            if let Some(reply) = self.proposals.remove(&proposal.id) {
                                let _ = reply.send(Ok(response));
                            }
                        }
                        Err(e) => {
                            warn!(index = entry.index, error = %e, "skipping undecodable entry");
                            sm.mark_applied(entry.index);
                        }
                    }
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::parse_from_bytes(entry.get_data())?;
                    let cs = self.node.apply_conf_change(&cc)?;
                    self.storage.set_conf_state(&cs)?;
                    sm.mark_applied(entry.index);
                }
                EntryType::EntryConfChangeV2 => {
                    let cc = ConfChangeV2::parse_from_bytes(entry.get_data())?;
                    let cs = self.node.apply_conf_change(&cc)?;
                    self.storage.set_conf_state(&cs)?;
                    sm.mark_applied(entry.index);
                }
            }
        }
        Ok(())
    }

    async fn release_reads(&mut self) {
        if self.read_waiters.is_empty() {
            return;
        }
        let applied = self.state.read().await.applied_index();
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.read_waiters)
            .into_iter()
            .partition(|(index, _)| *index <= applied);
        self.read_waiters = pending;
        for (_, reply) in done {
            let _ = reply.send(Ok(()));
        }
    }

    /// Ready means a leader is known and the local log has committed an
    /// entry in the current term, so read-index requests will be served.
    fn publish_readiness(&self) {
        let raft = &self.node.raft;
        let committed_in_term = raft
            .raft_log
            .term(raft.raft_log.committed)
            .map(|term| term == raft.term)
            .unwrap_or(false);
        let ready = raft.leader_id != INVALID_ID && committed_in_term;
        self.ready.send_if_modified(|current| {
            if *current != ready {
                *current = ready;
                true
            } else {
                false
            }
        });
    }
}
