//! Shared node status types, passed between subsystems over watch
//! channels so readers never block writers.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Health of our view of the upstream chain.
#[derive(Clone, Debug, Default)]
pub struct UpstreamStatus {
    /// Latest upstream height we have seen.
    pub latest_height: u64,

    /// Last height we fully processed.
    pub processed_height: u64,

    /// When we last heard from the upstream RPC, ms.
    pub last_update_ms: u64,

    pub rpc_connected: bool,
}

impl UpstreamStatus {
    /// Upstream blocks between our processed cursor and the network head.
    pub fn behind(&self) -> u64 {
        self.latest_height.saturating_sub(self.processed_height)
    }
}

/// Local chain head summary.
#[derive(Clone, Debug, Default)]
pub struct ChainStatus {
    pub head_id: u64,
    pub head_hash: String,
    pub head_timestamp: u64,
}

/// The sync status a node broadcasts to its peers, and the thing the
/// exit-sync quorum is computed over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Producing node id (its public key).
    pub node_id: String,

    /// Upstream blocks behind head.
    pub behind: u64,

    /// Upstream anchor height of the node's chain head.
    pub steem_block: u64,

    pub is_syncing: bool,

    /// The node's sidechain head id.
    pub block_id: u64,

    /// Sidechain block id at which the sender intends to leave sync mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_target: Option<u64>,
}

/// Watch-channel fanout of the statuses above.  Cheap to clone; any task
/// can read the latest value or await a change.
#[derive(Clone)]
pub struct StatusChannel {
    upstream_tx: watch::Sender<UpstreamStatus>,
    chain_tx: watch::Sender<ChainStatus>,
    sync_tx: watch::Sender<SyncStatus>,
}

impl StatusChannel {
    pub fn new(initial_sync: SyncStatus) -> Self {
        let (upstream_tx, _) = watch::channel(UpstreamStatus::default());
        let (chain_tx, _) = watch::channel(ChainStatus::default());
        let (sync_tx, _) = watch::channel(initial_sync);
        Self {
            upstream_tx,
            chain_tx,
            sync_tx,
        }
    }

    pub fn upstream(&self) -> UpstreamStatus {
        self.upstream_tx.borrow().clone()
    }

    pub fn set_upstream(&self, s: UpstreamStatus) {
        let _ = self.upstream_tx.send(s);
    }

    pub fn update_upstream(&self, f: impl FnOnce(&mut UpstreamStatus)) {
        self.upstream_tx.send_modify(f);
    }

    pub fn chain(&self) -> ChainStatus {
        self.chain_tx.borrow().clone()
    }

    pub fn set_chain(&self, s: ChainStatus) {
        let _ = self.chain_tx.send(s);
    }

    pub fn sync(&self) -> SyncStatus {
        self.sync_tx.borrow().clone()
    }

    pub fn set_sync(&self, s: SyncStatus) {
        let _ = self.sync_tx.send(s);
    }

    pub fn subscribe_chain(&self) -> watch::Receiver<ChainStatus> {
        self.chain_tx.subscribe()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncStatus> {
        self.sync_tx.subscribe()
    }
}
