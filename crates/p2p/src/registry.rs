//! The socket registry: every connected peer, its declared identity and
//! status, and the broadcast paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mirach_primitives::block::Block;
use mirach_primitives::params::Params;
use mirach_status::SyncStatus;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::*;

use crate::message::{MessageType, WireMessage};
use crate::sent_set::SentSet;

pub type PeerId = u64;

pub struct Peer {
    /// Remote address as we know it (dial url for outbound, socket addr
    /// for inbound).
    pub addr: String,

    /// Declared node id (public key), known after the handshake.
    pub node_id: Option<String>,

    /// The peer's canonical p2p port from its handshake.
    pub p2p_port: Option<u16>,

    /// Last sync status they broadcast, and when we received it.
    pub status: Option<(SyncStatus, u64)>,

    pub last_seen_ms: u64,
    pub outbound: bool,

    sent: SentSet,
    out: mpsc::UnboundedSender<String>,
}

impl Peer {
    /// The url peers should use to reach this peer, rewritten to its
    /// canonical port (the source port of an inbound socket is
    /// ephemeral).
    pub fn canonical_url(&self) -> Option<String> {
        let port = self.p2p_port?;
        let host = host_of(&self.addr)?;
        Some(format!("ws://{host}:{port}"))
    }
}

/// `host` out of `ws://host:port`, `host:port`, or a bare host.
pub fn host_of(addr: &str) -> Option<&str> {
    let rest = addr.strip_prefix("ws://").unwrap_or(addr);
    let rest = rest.strip_prefix("wss://").unwrap_or(rest);
    let host = rest.split('/').next()?.split(':').next()?;
    (!host.is_empty()).then_some(host)
}

pub struct PeerRegistry {
    params: Arc<Params>,
    peers: Mutex<HashMap<PeerId, Peer>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new(params: Arc<Params>) -> Self {
        Self {
            params,
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(
        &self,
        addr: String,
        outbound: bool,
        out: mpsc::UnboundedSender<String>,
    ) -> PeerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = Peer {
            addr,
            node_id: None,
            p2p_port: None,
            status: None,
            last_seen_ms: now_millis(),
            outbound,
            sent: SentSet::new(),
            out,
        };
        self.peers.lock().insert(id, peer);
        id
    }

    pub fn remove(&self, id: PeerId) {
        if let Some(peer) = self.peers.lock().remove(&id) {
            debug!(peer = %peer.addr, "peer removed");
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn at_capacity(&self) -> bool {
        self.count() >= self.params.run.max_peers
    }

    pub fn note_handshake(&self, id: PeerId, node_id: String, p2p_port: u16) {
        if let Some(peer) = self.peers.lock().get_mut(&id) {
            peer.node_id = Some(node_id);
            peer.p2p_port = Some(p2p_port);
        }
    }

    pub fn note_seen(&self, id: PeerId) {
        if let Some(peer) = self.peers.lock().get_mut(&id) {
            peer.last_seen_ms = now_millis();
        }
    }

    pub fn update_status(&self, id: PeerId, status: SyncStatus) {
        if let Some(peer) = self.peers.lock().get_mut(&id) {
            peer.status = Some((status, now_millis()));
        }
    }

    /// Snapshot of peer statuses with their ages, for the sync quorum.
    pub fn status_snapshot(&self) -> Vec<(SyncStatus, u64)> {
        let now = now_millis();
        self.peers
            .lock()
            .values()
            .filter_map(|p| {
                p.status
                    .as_ref()
                    .map(|(s, at)| (s.clone(), now.saturating_sub(*at)))
            })
            .collect()
    }

    /// Highest sidechain head any peer has reported.
    pub fn best_peer_head(&self) -> Option<u64> {
        self.peers
            .lock()
            .values()
            .filter_map(|p| p.status.as_ref().map(|(s, _)| s.block_id))
            .max()
    }

    /// Hosts we already have a socket to, for discovery dedup.
    pub fn connected_hosts(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter_map(|p| host_of(&p.addr).map(str::to_owned))
            .collect()
    }

    /// Dialable urls of connected peers, for peer-list replies.
    pub fn shareable_urls(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter_map(Peer::canonical_url)
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().keys().copied().collect()
    }

    /// Peers that went quiet past the keepalive window.
    pub fn stale_peers(&self, idle_ms: u64) -> Vec<PeerId> {
        let now = now_millis();
        self.peers
            .lock()
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.last_seen_ms) > idle_ms)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sends to one peer; write errors are logged and swallowed, the read
    /// loop notices the dead socket.
    pub fn send_json(&self, id: PeerId, msg: &WireMessage) {
        let peers = self.peers.lock();
        let Some(peer) = peers.get(&id) else {
            return;
        };
        if peer.out.send(msg.to_string()).is_err() {
            debug!(peer = %peer.addr, "send to closed peer socket");
        }
    }

    /// Sends to every open socket.
    pub fn broadcast(&self, msg: &WireMessage) {
        let raw = msg.to_string();
        for (_, peer) in self.peers.lock().iter() {
            if peer.out.send(raw.clone()).is_err() {
                debug!(peer = %peer.addr, "send to closed peer socket");
            }
        }
    }

    /// Sends to each peer at most once per message digest.
    pub fn broadcast_not_sent(&self, msg: &WireMessage) {
        let raw = msg.to_string();
        let digest = msg.digest();
        let now = now_millis();
        for (_, peer) in self.peers.lock().iter_mut() {
            if !peer.sent.check_should_send(&digest, now) {
                continue;
            }
            if peer.out.send(raw.clone()).is_err() {
                debug!(peer = %peer.addr, "send to closed peer socket");
            }
        }
    }

    pub fn broadcast_block(&self, block: &Block) {
        self.broadcast_not_sent(&WireMessage::new(MessageType::NewBlock, block));
    }

    pub fn broadcast_sync_status(&self, status: &SyncStatus) {
        self.broadcast(&WireMessage::new(MessageType::SteemSyncStatus, status));
    }

    /// Periodic sent-set cleanup, every `history_interval`.
    pub fn gc_sent_sets(&self) {
        let keep = self.params.run.keep_history_for_ms;
        let now = now_millis();
        for (_, peer) in self.peers.lock().iter_mut() {
            peer.sent.gc(now, keep);
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}
