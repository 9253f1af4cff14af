//! The node orchestrator: message dispatch, the upstream pump, periodic
//! timers, and the commit path glue between subsystems.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use secp256k1::SecretKey;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::*;

use mirach_consensus_logic::consensus::BlockConf;
use mirach_consensus_logic::schedule::{self, Schedule, WitnessEntry};
use mirach_consensus_logic::sync::PeerSyncStatus;
use mirach_consensus_logic::{BlockProcessor, Chain, Finalizer, Mempool, SyncManager};
use mirach_p2p::discovery::Discovery;
use mirach_p2p::message::{MessageType, WireMessage};
use mirach_p2p::registry::now_millis;
use mirach_p2p::transport::{connect_to_peer, Inbound, LocalIdentity};
use mirach_p2p::{PeerRegistry, RecoveryEngine};
use mirach_primitives::block::Block;
use mirach_primitives::params::Params;
use mirach_state::collections::ACCOUNTS;
use mirach_status::{ChainStatus, StatusChannel, SyncStatus};
use mirach_steemio::rpc::client::HttpSteemClient;
use mirach_steemio::rpc::pool::SteemClientPool;
use mirach_tasks::ShutdownGuard;

pub struct WitnessIdentity {
    pub account: String,
    pub key: SecretKey,
}

pub struct Node {
    pub params: Arc<Params>,
    pub chain: Arc<Chain>,
    pub pool: Arc<SteemClientPool<HttpSteemClient>>,
    pub processor: Arc<BlockProcessor<HttpSteemClient>>,
    pub sync: Arc<SyncManager>,
    pub finalizer: Arc<Finalizer>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub registry: Arc<PeerRegistry>,
    pub discovery: Arc<Discovery>,
    pub recovery: Arc<RecoveryEngine>,
    pub schedule: Arc<Mutex<Schedule>>,
    pub status_channel: StatusChannel,
    pub identity: LocalIdentity,
    pub witness: Option<WitnessIdentity>,

    /// Filled in by `wire_inbound` once the channel exists; dials need it
    /// to hand new sockets to the dispatch loop.
    pub inbound_tx: std::sync::OnceLock<mpsc::Sender<Inbound>>,
}

impl Node {
    /// Rebuilds the witness slate for the epoch of the next block from
    /// the live witness set.
    pub async fn recompute_schedule(&self) -> anyhow::Result<()> {
        let names = self.chain.cache().witness_names();
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let Some(doc) = self.chain.cache().find_one(ACCOUNTS, &name).await? else {
                continue;
            };
            let Some(pub_key) = doc.get("witness_pub").and_then(|v| v.as_str()) else {
                continue;
            };
            let weight = doc.get("node_appr").and_then(|v| v.as_u64()).unwrap_or(0);
            entries.push(WitnessEntry {
                name,
                pub_key: pub_key.to_owned(),
                weight,
            });
        }
        self.discovery.set_total_witnesses(entries.len());

        let next_id = self.chain.head_id() + 1;
        let slate = schedule::compute(entries, next_id, self.params.chain.witness_slots);
        debug!(epoch = %slate.epoch, slots = %slate.len(), "recomputed witness schedule");
        *self.schedule.lock() = slate;
        Ok(())
    }

    /// Dialable endpoints of the scheduled witnesses, for peer-list
    /// replies.
    async fn witness_endpoints(&self) -> Vec<String> {
        let mut out = Vec::new();
        for name in self.chain.cache().witness_names() {
            if let Ok(Some(doc)) = self.chain.cache().find_one(ACCOUNTS, &name).await {
                if let Some(ws) = doc.get("witness_ws").and_then(|v| v.as_str()) {
                    out.push(ws.to_owned());
                }
            }
        }
        out
    }

    fn active_witness_ids(&self) -> HashSet<String> {
        self.schedule
            .lock()
            .slots
            .iter()
            .map(|w| w.pub_key.clone())
            .collect()
    }

    fn publish_chain_status(&self) {
        let head = self.chain.head();
        self.status_channel.set_chain(ChainStatus {
            head_id: head.id,
            head_hash: head.hash.unwrap_or_default(),
            head_timestamp: head.timestamp,
        });
    }

    /// Handles a block produced by our own miner.
    pub async fn handle_proposal(&self, block: Block) {
        self.finalizer.insert_proposal(block.clone());
        self.registry.broadcast_block(&block);
        self.try_commit(block.id).await;
    }

    /// Handles a NEW_BLOCK from a peer.
    async fn handle_new_block(&self, block: Block) {
        use mirach_consensus_logic::chain::IncomingKind;

        match self.chain.classify_incoming(&block) {
            IncomingKind::Unknown => {
                debug!(id = %block.id, "rejecting block with invalid phash");
            }
            IncomingKind::Alternative => {
                // A competing tip: hold it, consensus resolves the winner.
                debug!(id = %block.id, "tracking alternative chain tip");
                self.finalizer.insert_proposal(block);
            }
            IncomingKind::ExtendsHead => {
                let sched = self.schedule.lock().clone();
                if let Err(e) = self.chain.validate_block(&block, &sched, self.sync.lenient_until())
                {
                    debug!(id = %block.id, err = %e, "rejecting block");
                    return;
                }
                match self.processor.validate_block_against_upstream(&block).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(id = %block.id, "rejecting block, bound txs mismatch");
                        return;
                    }
                    Err(e) => {
                        warn!(id = %block.id, err = %e, "cannot check block against upstream");
                        return;
                    }
                }

                let id = block.id;
                self.finalizer.insert_proposal(block.clone());
                self.registry.broadcast_block(&block);
                self.vote_for(&block, &sched);
                self.try_commit(id).await;
            }
        }
    }

    /// Casts and gossips our own approval when we're a scheduled witness.
    fn vote_for(&self, block: &Block, sched: &Schedule) {
        let Some(w) = &self.witness else {
            return;
        };
        if !sched.contains(&w.account) || block.witness == w.account {
            return;
        }
        let round = self.finalizer.round_of(block.id).unwrap_or(0);
        let Some(conf) = Finalizer::make_conf(block, &w.account, &w.key, round) else {
            return;
        };
        self.finalizer.record_vote(&conf, sched);
        self.registry
            .broadcast_not_sent(&WireMessage::new(MessageType::BlockConf, &conf));
    }

    /// Commits the next block once a candidate passes the vote bar.
    pub async fn try_commit(&self, id: u64) {
        if id != self.chain.head_id() + 1 {
            return;
        }
        let sched = self.schedule.lock().clone();
        let Some(block) = self.finalizer.commitable(id, sched.len()) else {
            return;
        };
        match self.chain.commit_block(&block).await {
            Ok(()) => {
                self.after_commit(&block).await;
            }
            Err(e) => {
                warn!(id = %block.id, err = %e, "failed to commit winning candidate");
            }
        }
    }

    async fn after_commit(&self, block: &Block) {
        self.finalizer.prune_through(block.id);
        self.mempool.lock().remove_committed(&block.txs);
        if self.processor.last_processed() < block.steem_block {
            self.processor.set_last_processed(block.steem_block);
        }
        self.publish_chain_status();
        self.registry.broadcast_block(block);

        // Epoch boundary: new slate from the post-block state.
        if block.id % self.params.chain.witness_slots as u64 == 0 {
            if let Err(e) = self.recompute_schedule().await {
                warn!(err = %e, "schedule recompute failed");
            }
        }
    }

    /// Applies buffered recovery blocks in order.  Recovered blocks were
    /// finalized by the network already, so they commit directly after
    /// validation.
    async fn apply_recovered(&self) {
        loop {
            let head = self.chain.head_id();
            let Some(block) = self.recovery.next_applicable(head) else {
                return;
            };
            let sched = self.schedule.lock().clone();
            let valid = self
                .chain
                .validate_block(&block, &sched, self.sync.lenient_until())
                .is_ok();
            let bound_ok = valid
                && matches!(
                    self.processor.validate_block_against_upstream(&block).await,
                    Ok(true)
                );
            if !bound_ok {
                self.recovery.drop_and_rerequest(block.id);
                return;
            }
            match self.chain.commit_block(&block).await {
                Ok(()) => self.after_commit(&block).await,
                Err(e) => {
                    warn!(id = %block.id, err = %e, "recovered block failed to apply");
                    self.recovery.drop_and_rerequest(block.id);
                    return;
                }
            }
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        let Inbound { peer, msg } = inbound;
        match msg.t {
            MessageType::NewBlock => {
                let Ok(block) = serde_json::from_value::<Block>(msg.d) else {
                    debug!(%peer, "malformed NEW_BLOCK");
                    return;
                };
                self.handle_new_block(block).await;
            }
            MessageType::BlockConf => {
                let Ok(conf) = serde_json::from_value::<BlockConf>(msg.d.clone()) else {
                    return;
                };
                let sched = self.schedule.lock().clone();
                if self.finalizer.record_vote(&conf, &sched) {
                    // First sight of this vote: pass it along.
                    self.registry.broadcast_not_sent(&msg);
                    self.try_commit(conf.id).await;
                }
            }
            MessageType::QueryBlock => {
                let Some(id) = msg.d.get("id").and_then(|v| v.as_i64()) else {
                    return;
                };
                match self.chain.backend().read(id).await {
                    Ok(Some(block)) => {
                        self.registry
                            .send_json(peer, &WireMessage::new(MessageType::Block, &block));
                    }
                    Ok(None) => {}
                    Err(e) => debug!(%id, err = %e, "query block read failed"),
                }
            }
            MessageType::Block => {
                let Ok(block) = serde_json::from_value::<Block>(msg.d) else {
                    return;
                };
                if self.recovery.accept_block(block) {
                    self.apply_recovered().await;
                }
            }
            MessageType::SteemSyncStatus => {
                let Ok(status) = serde_json::from_value::<SyncStatus>(msg.d) else {
                    return;
                };
                self.registry.update_status(peer, status);
            }
            MessageType::QueryPeerList => {
                let endpoints = self.witness_endpoints().await;
                let peers = self.discovery.build_peer_list(&self.registry, &endpoints);
                self.registry.send_json(
                    peer,
                    &WireMessage::new(MessageType::PeerList, json!({"peers": peers})),
                );
            }
            MessageType::PeerList => {
                let urls: Vec<String> = msg
                    .d
                    .get("peers")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                self.dial_new_peers(urls).await;
            }
            // Handshake and keepalive are consumed by the transport.
            MessageType::NodeStatus | MessageType::KeepAlive => {}
        }
    }

    async fn dial_new_peers(&self, urls: Vec<String>) {
        let dial = self.discovery.handle_peer_list(urls, &self.registry);
        for url in dial {
            self.spawn_dial(url);
        }
    }

    pub fn spawn_dial(&self, url: String) {
        let registry = self.registry.clone();
        let identity = self.identity.clone();
        let discovery = self.discovery.clone();
        let inbound_tx = self.inbound_tx();
        let head = self.chain.head_id();
        tokio::spawn(async move {
            if let Err(e) =
                connect_to_peer(url.clone(), registry, identity, inbound_tx, head).await
            {
                debug!(peer = %url, err = %e, "dial failed");
            }
            discovery.note_dial_finished(&url);
        });
    }

    fn inbound_tx(&self) -> mpsc::Sender<Inbound> {
        self.inbound_tx
            .get()
            .expect("node: inbound channel not wired")
            .clone()
    }
}

/// The inbound channel is created after the node (tasks need the node),
/// so it lands in a OnceLock.
impl Node {
    pub fn wire_inbound(&self, tx: mpsc::Sender<Inbound>) {
        let _ = self.inbound_tx.set(tx);
    }
}

/// Message dispatch: peer frames and our own mined candidates.
pub async fn dispatch_task(
    node: Arc<Node>,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    mut proposal_rx: mpsc::Receiver<Block>,
    mut shutdown: ShutdownGuard,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => return Ok(()),
            Some(inbound) = inbound_rx.recv() => node.handle_inbound(inbound).await,
            Some(block) = proposal_rx.recv() => node.handle_proposal(block).await,
            else => return Ok(()),
        }
    }
}

/// The upstream pump: poll the head, keep the sync state honest, process
/// the next anchored block, feed the mempool.
pub async fn upstream_task(node: Arc<Node>, mut shutdown: ShutdownGuard) -> anyhow::Result<()> {
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let mut exit_check = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => return Ok(()),

            _ = poll.tick() => {
                let latest = match node.pool.get_latest_height().await {
                    Ok(h) => {
                        node.status_channel.update_upstream(|u| {
                            u.latest_height = h;
                            u.rpc_connected = true;
                            u.last_update_ms = now_millis();
                        });
                        h
                    }
                    Err(e) => {
                        debug!(err = %e, "upstream head query failed");
                        node.status_channel.update_upstream(|u| u.rpc_connected = false);
                        continue;
                    }
                };

                let processed = node.processor.last_processed();
                let behind = latest.saturating_sub(processed);
                node.sync.observe(behind, node.processor.breaker_open());

                // Stay within a bounded lookahead of the committed anchor
                // so bound sets are still around when blocks arrive.
                let head_anchor = node.chain.head().steem_block;
                let lookahead = node.params.run.max_prefetch_blocks as u64 * 2;
                if processed < latest && processed < head_anchor + lookahead {
                    let syncing = node.sync.is_syncing();
                    let _ = node.processor.prefetch_blocks(processed + 1, syncing).await;
                    match node.processor.process_upstream(processed + 1).await {
                        Ok(Some(out)) => {
                            let mut pool = node.mempool.lock();
                            for tx in out.txs {
                                pool.insert(tx);
                            }
                            node.status_channel.update_upstream(|u| {
                                u.processed_height = out.height;
                            });
                        }
                        Ok(None) => {}
                        Err(e) => debug!(err = %e, "upstream processing failed"),
                    }
                }

                node.mempool.lock().purge_expired(now_millis());
            }

            _ = exit_check.tick() => {
                if !node.sync.is_syncing() {
                    continue;
                }
                let realtime = match node.pool.get_latest_height().await {
                    Ok(h) => Some(h.saturating_sub(node.processor.last_processed())),
                    Err(_) => None,
                };
                let peers: Vec<PeerSyncStatus> = node
                    .registry
                    .status_snapshot()
                    .into_iter()
                    .map(|(status, age_ms)| PeerSyncStatus { status, age_ms })
                    .collect();
                let head_id = node.chain.head_id();
                if node.sync.should_exit_sync(
                    realtime,
                    &peers,
                    &node.active_witness_ids(),
                    head_id,
                ) {
                    node.sync.set_exit_target(Some(head_id + 1));
                    broadcast_status(&node);
                    node.sync.exit_sync(head_id, now_millis());
                }
            }
        }
    }
}

/// Periodic upkeep: status broadcast, keepalive, sent-set GC, discovery,
/// recovery rounds, consensus round ticks.
pub async fn timers_task(node: Arc<Node>, mut shutdown: ShutdownGuard) -> anyhow::Result<()> {
    let mut status_tick = tokio::time::interval(Duration::from_millis(500));
    let mut keepalive = tokio::time::interval(Duration::from_secs(10));
    let mut history_gc = tokio::time::interval(Duration::from_millis(
        node.params.run.history_interval_ms,
    ));
    let mut discovery_tick = tokio::time::interval(Duration::from_secs(15));
    let mut recovery_tick = tokio::time::interval(Duration::from_secs(2));
    let mut round_tick =
        tokio::time::interval(Duration::from_millis(node.params.chain.block_time_ms));

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => return Ok(()),

            _ = status_tick.tick() => broadcast_status(&node),

            _ = keepalive.tick() => {
                node.registry
                    .broadcast(&WireMessage::new(MessageType::KeepAlive, json!({})));
                for peer in node.registry.stale_peers(90_000) {
                    debug!(%peer, "dropping silent peer");
                    node.registry.remove(peer);
                }
            }

            _ = history_gc.tick() => node.registry.gc_sent_sets(),

            _ = discovery_tick.tick() => {
                if node.registry.count() == 0 {
                    for url in node.discovery.bootstrap_peers().to_vec() {
                        node.spawn_dial(url);
                    }
                    continue;
                }
                let query = WireMessage::new(MessageType::QueryPeerList, json!({}));
                for peer in node.discovery.query_targets(&node.registry) {
                    node.registry.send_json(peer, &query);
                }
            }

            _ = recovery_tick.tick() => {
                let head = node.chain.head_id();
                let rotate = node.recovery.should_rotate_peers();
                let ids = node.recovery.refresh(head, node.registry.best_peer_head(), rotate);
                if !ids.is_empty() {
                    let peers = node.registry.peer_ids();
                    if let Some(peer) = node.recovery.pick_peer(&peers) {
                        for id in ids {
                            node.registry.send_json(
                                peer,
                                &WireMessage::new(MessageType::QueryBlock, json!({"id": id})),
                            );
                        }
                    }
                }
                node.apply_recovered().await;
            }

            _ = round_tick.tick() => node.finalizer.tick_rounds(),
        }
    }
}

fn broadcast_status(node: &Node) {
    let head = node.chain.head();
    if let Some(status) = node.sync.tick_broadcast(
        now_millis(),
        &node.identity.node_id,
        node.processor.last_processed(),
        head.id,
    ) {
        node.status_channel.set_sync(status.clone());
        node.registry.broadcast_sync_status(&status);
    }
}
