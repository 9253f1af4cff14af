//! Peer discovery: witness-seeded bootstrap plus peer-list gossip, with
//! rate limits so a struggling node doesn't stampede the network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use mirach_primitives::params::Params;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::*;

use crate::registry::{host_of, now_millis, PeerRegistry};

/// Emergency rounds (below min peers) at most this often.
const RATE_LIMIT_EMERGENCY_MS: u64 = 30_000;

/// Normal new connections per peer-list response at most this often per
/// host.
const RATE_LIMIT_NORMAL_MS: u64 = 60_000;

/// How many peers get a QUERY_PEER_LIST in a nominal round.
const NOMINAL_QUERY_FANOUT: usize = 3;

pub struct Discovery {
    params: Arc<Params>,
    bootstrap: Vec<String>,

    /// Hosts with a dial in progress.
    connecting: Mutex<HashSet<String>>,

    /// Last dial time per host, for the normal-path rate limit.
    last_dial: Mutex<HashMap<String, u64>>,

    last_emergency_ms: AtomicU64,

    /// Total registered witnesses, for the peer targets.
    total_witnesses: AtomicUsize,
}

impl Discovery {
    pub fn new(params: Arc<Params>, bootstrap: Vec<String>) -> Self {
        Self {
            params,
            bootstrap,
            connecting: Mutex::new(HashSet::new()),
            last_dial: Mutex::new(HashMap::new()),
            last_emergency_ms: AtomicU64::new(0),
            total_witnesses: AtomicUsize::new(0),
        }
    }

    pub fn set_total_witnesses(&self, n: usize) {
        self.total_witnesses.store(n, Ordering::Relaxed);
    }

    /// Reach at least 60% of the witness set.
    pub fn min_peers(&self) -> usize {
        let w = self.total_witnesses.load(Ordering::Relaxed);
        (w * 6).div_ceil(10)
    }

    pub fn optimal_peers(&self) -> usize {
        let w = self.total_witnesses.load(Ordering::Relaxed);
        w.saturating_sub(1).min(self.params.run.max_peers)
    }

    pub fn bootstrap_peers(&self) -> &[String] {
        &self.bootstrap
    }

    /// Who to send QUERY_PEER_LIST to this round: everyone when starved
    /// (rate limited), a small random subset otherwise.
    pub fn query_targets(&self, registry: &PeerRegistry) -> Vec<crate::registry::PeerId> {
        let ids = registry.peer_ids();
        if ids.is_empty() {
            return ids;
        }
        if registry.count() < self.min_peers() {
            let now = now_millis();
            let last = self.last_emergency_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) < RATE_LIMIT_EMERGENCY_MS {
                return Vec::new();
            }
            self.last_emergency_ms.store(now, Ordering::Relaxed);
            debug!(peers = %ids.len(), "emergency peer discovery round");
            return ids;
        }
        let mut rng = rand::thread_rng();
        let mut ids = ids;
        ids.shuffle(&mut rng);
        ids.truncate(NOMINAL_QUERY_FANOUT);
        ids
    }

    /// Digests a received peer list into the dial list: dedup by host
    /// against existing sockets and in-flight dials, honor rate limits,
    /// randomize, cap by how far we are from target.
    pub fn handle_peer_list(&self, urls: Vec<String>, registry: &PeerRegistry) -> Vec<String> {
        let count = registry.count();
        let (emergency, max_new) = if count < self.min_peers() {
            (true, self.min_peers() - count)
        } else if count < self.optimal_peers() {
            (false, 1)
        } else {
            return Vec::new();
        };

        let connected: HashSet<String> = registry.connected_hosts().into_iter().collect();
        let now = now_millis();
        let mut connecting = self.connecting.lock();
        let mut last_dial = self.last_dial.lock();

        let mut candidates: Vec<String> = urls
            .into_iter()
            .filter(|url| {
                let Some(host) = host_of(url) else {
                    return false;
                };
                if connected.contains(host) || connecting.contains(host) {
                    return false;
                }
                if !emergency {
                    if let Some(at) = last_dial.get(host) {
                        if now.saturating_sub(*at) < RATE_LIMIT_NORMAL_MS {
                            return false;
                        }
                    }
                }
                true
            })
            .collect();

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(max_new);

        for url in &candidates {
            if let Some(host) = host_of(url) {
                connecting.insert(host.to_owned());
                last_dial.insert(host.to_owned(), now);
            }
        }
        candidates
    }

    /// The list we answer QUERY_PEER_LIST with: live sockets rewritten to
    /// canonical ports, bootstrap seeds, and the on-chain witness
    /// endpoints.
    pub fn build_peer_list(
        &self,
        registry: &PeerRegistry,
        witness_endpoints: &[String],
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for url in registry
            .shareable_urls()
            .into_iter()
            .chain(self.bootstrap.iter().cloned())
            .chain(witness_endpoints.iter().cloned())
        {
            if let Some(host) = host_of(&url) {
                if seen.insert(host.to_owned()) {
                    out.push(url);
                }
            }
        }
        out
    }

    pub fn note_dial_finished(&self, url: &str) {
        if let Some(host) = host_of(url) {
            self.connecting.lock().remove(host);
        }
    }
}
