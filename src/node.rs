use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{all_yes, broadcast};
use crate::error::{Error, Result};
use crate::message::{
    read_frame, write_frame, LogEntry, NodeId, Request, RequestArgs, Response, TransactionState,
    TxId,
};
use crate::peer::Peer;
use crate::stable::StableStore;
use crate::volatile::VolatileStore;

/// Pause between attempts to reach the coordinator of an undecided
/// transaction found at startup.
const RESOLVE_BACKOFF: Duration = Duration::from_secs(2);

/// Identity and wiring for one cluster member.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Static map of every member (including this one) to its address.
    pub membership: HashMap<NodeId, String>,
    /// Directory holding this node's write-ahead log and snapshot.
    pub log_dir: PathBuf,
}

impl NodeConfig {
    /// Conventional local cluster layout: node `i` listens on
    /// `localhost:3000+i`.
    pub fn local(id: NodeId, all_ids: &[NodeId], log_dir: impl Into<PathBuf>) -> Self {
        let membership = all_ids
            .iter()
            .map(|&member| (member, format!("localhost:{}", 3000 + member)))
            .collect();
        Self {
            id,
            membership,
            log_dir: log_dir.into(),
        }
    }
}

/// One cluster member: participant for inbound requests, coordinator for
/// transactions submitted through [`Node::transaction`].
pub struct Node {
    inner: Arc<NodeInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Recovers durable state, then starts serving peers.
    ///
    /// Recovery runs to completion before the listener opens, so a peer can
    /// never observe this node in a pre-recovery state.
    pub async fn start(config: NodeConfig) -> Result<Node> {
        let addr = config
            .membership
            .get(&config.id)
            .cloned()
            .ok_or(Error::UnknownMember(config.id))?;

        let peers = config
            .membership
            .iter()
            .filter(|(member, _)| **member != config.id)
            .map(|(member, member_addr)| Arc::new(Peer::new(*member, member_addr.clone())))
            .collect();

        let stable = StableStore::open(&config.log_dir, config.id).await?;
        let inner = Arc::new(NodeInner {
            id: config.id,
            volatile: VolatileStore::new(0),
            stable,
            peers,
        });

        inner.recover().await?;

        let listener = TcpListener::bind(&addr).await?;
        info!(node = config.id, %addr, "node listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&inner), shutdown_rx));

        Ok(Node {
            inner,
            accept_task: Mutex::new(Some(accept_task)),
            shutdown_tx,
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The committed register value.
    pub fn state(&self) -> i64 {
        self.inner.volatile.state()
    }

    /// Runs a two-phase commit adding `delta` to every node's register.
    pub async fn transaction(&self, delta: i64) -> Result<()> {
        self.inner.transaction(delta).await
    }

    /// Stops serving: ends the accept loop and every open connection, and
    /// drops the outbound peer connections. The listener port is free again
    /// once this returns, so the node can be restarted in place.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        for peer in &self.inner.peers {
            peer.close().await;
        }
    }
}

struct NodeInner {
    id: NodeId,
    volatile: VolatileStore,
    stable: StableStore,
    peers: Vec<Arc<Peer>>,
}

impl NodeInner {
    /// Coordinator side of the protocol.
    async fn transaction(&self, delta: i64) -> Result<()> {
        let tx_id = Uuid::new_v4();
        let new_value = self.volatile.state() + delta;

        // Phase 1: reserve the register locally, then ask every peer to.
        // The local side goes through the same participant routines as a
        // remote prepare; no loopback RPC.
        if let Err(err) = self.prepare(tx_id, new_value, self.id).await {
            debug!(node = self.id, tx = %tx_id, error = %err, "local prepare failed");
            let _ = self.abort(tx_id, self.id).await;
            return Err(Error::Busy);
        }

        let args = RequestArgs {
            tx_id,
            value: new_value,
            sender_id: self.id,
        };

        let votes = broadcast(&self.peers, Request::Prepare(args)).await;
        if !all_yes(&votes) {
            warn!(node = self.id, tx = %tx_id, "prepare phase rejected, aborting");
            broadcast(&self.peers, Request::Abort(args)).await;
            let _ = self.abort(tx_id, self.id).await;
            return Err(Error::ConsensusFailed);
        }

        // Phase 2: commit locally first so the decision is durable here
        // before anyone else learns it. A write failure at this point is
        // terminal for the transaction; there is no repair path.
        self.commit(tx_id, new_value, self.id).await?;

        // Best effort: a peer that misses this will learn the outcome from
        // our log when it reconciles after restart.
        broadcast(&self.peers, Request::Commit(args)).await;
        Ok(())
    }

    /// Participant prepare: volatile lock, then the durable record.
    async fn prepare(&self, tx_id: TxId, value: i64, sender_id: NodeId) -> Result<()> {
        self.volatile.prepare(tx_id, value)?;

        if let Err(err) = self.stable.write_prepared(tx_id, value, sender_id).await {
            // Release the reservation; an unlogged prepare must not linger.
            self.abort(tx_id, sender_id).await?;
            return Err(err);
        }
        Ok(())
    }

    /// Participant commit: the record hits the log before the register
    /// changes, so an acknowledged commit survives a crash.
    async fn commit(&self, tx_id: TxId, value: i64, sender_id: NodeId) -> Result<()> {
        if let Err(err) = self.stable.write_committed(tx_id, value, sender_id).await {
            let _ = self.abort(tx_id, sender_id).await;
            return Err(err);
        }
        self.volatile.commit(tx_id)
    }

    /// Participant abort. Safe to call for transactions this node never saw.
    async fn abort(&self, tx_id: TxId, sender_id: NodeId) -> Result<()> {
        self.stable.write_aborted(tx_id, sender_id).await?;
        self.volatile.abort(tx_id)
    }

    async fn get_status(&self, tx_id: TxId) -> Result<TransactionState> {
        self.stable.transaction_state(tx_id).await
    }

    /// Replays durable state at startup and checkpoints the result.
    ///
    /// The order matters: snapshot first, then the log's last word on top of
    /// it, then a fresh snapshot and an empty log. A crash anywhere in here
    /// just reruns the same scan next time.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let snapshot = self.stable.load_snapshot().await?;
        self.volatile.recover(snapshot, HashSet::new());

        let scan = self.stable.recover_last_entry().await?;
        if scan.corrupt_tail {
            warn!(
                node = self.id,
                "wal tail is damaged; recovering up to the last intact record"
            );
        }

        if let Some(entry) = scan.last_entry {
            match entry.state {
                TransactionState::Committed => {
                    // The log is ahead of the snapshot; its value is the
                    // committed baseline. Remember the txid so a duplicate
                    // commit arriving late stays a no-op.
                    self.volatile
                        .recover(entry.value, HashSet::from([entry.tx_id]));
                }
                TransactionState::Prepared => {
                    info!(
                        node = self.id,
                        tx = %entry.tx_id,
                        coordinator = entry.sender_id,
                        "undecided transaction in log, asking its coordinator"
                    );
                    self.volatile.prepare(entry.tx_id, entry.value)?;
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.resolve_anomaly(entry).await });
                }
                TransactionState::Aborted => {}
            }
        }

        let current = self.volatile.state();
        self.stable.save_snapshot(current).await?;
        self.stable.truncate().await?;
        Ok(())
    }

    /// Settles a transaction that was prepared when the node went down.
    ///
    /// Only the coordinator knows the outcome, so we ask it for as long as
    /// it takes: aborting on our own could contradict a commit it already
    /// acknowledged. If this node was the coordinator, the missing commit
    /// record in its own log already decides the answer: presumed abort.
    async fn resolve_anomaly(&self, entry: LogEntry) {
        if entry.sender_id == self.id {
            self.resolve_with_abort(entry).await;
            return;
        }

        let coordinator = self
            .peers
            .iter()
            .find(|peer| peer.id() == entry.sender_id)
            .cloned();
        let Some(coordinator) = coordinator else {
            warn!(
                node = self.id,
                coordinator = entry.sender_id,
                "coordinator not in membership, presuming abort"
            );
            self.resolve_with_abort(entry).await;
            return;
        };

        loop {
            match coordinator
                .call(&Request::GetStatus { tx_id: entry.tx_id })
                .await
            {
                Ok(Response::Status(TransactionState::Committed)) => {
                    info!(node = self.id, tx = %entry.tx_id, "coordinator committed, applying");
                    if let Err(err) = self.commit(entry.tx_id, entry.value, entry.sender_id).await
                    {
                        warn!(node = self.id, tx = %entry.tx_id, error = %err, "failed to apply recovered commit");
                    }
                    return;
                }
                Ok(_) => {
                    self.resolve_with_abort(entry).await;
                    return;
                }
                Err(err) => {
                    debug!(
                        node = self.id,
                        tx = %entry.tx_id,
                        error = %err,
                        "coordinator unreachable, retrying"
                    );
                    sleep(RESOLVE_BACKOFF).await;
                }
            }
        }
    }

    async fn resolve_with_abort(&self, entry: LogEntry) {
        info!(node = self.id, tx = %entry.tx_id, "presumed abort, rolling back");
        if let Err(err) = self.abort(entry.tx_id, entry.sender_id).await {
            warn!(node = self.id, tx = %entry.tx_id, error = %err, "failed to abort recovered transaction");
        }
    }

    /// Dispatches one inbound request.
    ///
    /// Local protocol errors become a no vote; only a failure to read our
    /// own log is returned upward, which drops the connection rather than
    /// sending a guess to a peer deciding commit-or-abort.
    async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::Prepare(args) => Ok(self.vote(
                "prepare",
                args.tx_id,
                self.prepare(args.tx_id, args.value, args.sender_id).await,
            )),
            Request::Commit(args) => Ok(self.vote(
                "commit",
                args.tx_id,
                self.commit(args.tx_id, args.value, args.sender_id).await,
            )),
            Request::Abort(args) => Ok(self.vote(
                "abort",
                args.tx_id,
                self.abort(args.tx_id, args.sender_id).await,
            )),
            Request::GetStatus { tx_id } => Ok(Response::Status(self.get_status(tx_id).await?)),
        }
    }

    fn vote(&self, op: &str, tx_id: TxId, result: Result<()>) -> Response {
        match result {
            Ok(()) => Response::Vote(true),
            Err(err) => {
                debug!(node = self.id, tx = %tx_id, op, error = %err, "request refused");
                Response::Vote(false)
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    inner: Arc<NodeInner>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let inner = Arc::clone(&inner);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, inner, shutdown_rx).await {
                        debug!(%peer_addr, error = %err, "connection closed with error");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
            }
        }
    }
}

/// Serves one inbound connection until EOF, an error, or node shutdown.
async fn serve_connection(
    mut stream: TcpStream,
    inner: Arc<NodeInner>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let request = tokio::select! {
            request = read_frame::<_, Request>(&mut stream) => match request? {
                Some(request) => request,
                None => return Ok(()),
            },
            _ = shutdown_rx.changed() => return Ok(()),
        };

        let response = inner.handle(request).await?;
        write_frame(&mut stream, &response).await?;
    }
}
