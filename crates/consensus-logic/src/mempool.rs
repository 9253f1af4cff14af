//! Pending-transaction pool.

use std::collections::HashMap;

use mirach_primitives::tx::Transaction;
use tracing::*;

/// Unordered pool keyed by content hash: at most one entry per hash,
/// capped, with age-based expiry.
pub struct Mempool {
    txs: HashMap<String, Transaction>,
    cap: usize,
    expiry_ms: u64,
}

impl Mempool {
    pub fn new(cap: usize, expiry_ms: u64) -> Self {
        Self {
            txs: HashMap::new(),
            cap,
            expiry_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Inserts a tx; duplicates by hash and inserts past the cap are
    /// dropped.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.txs.contains_key(&tx.hash) {
            return false;
        }
        if self.txs.len() >= self.cap {
            debug!(hash = %tx.hash, "mempool full, dropping tx");
            return false;
        }
        self.txs.insert(tx.hash.clone(), tx);
        true
    }

    /// Drops entries older than the configured age.
    pub fn purge_expired(&mut self, now_ms: u64) {
        let expiry = self.expiry_ms;
        let before = self.txs.len();
        self.txs.retain(|_, tx| now_ms.saturating_sub(tx.ts) < expiry);
        let dropped = before - self.txs.len();
        if dropped > 0 {
            debug!(%dropped, "purged expired mempool txs");
        }
    }

    /// Selects up to `max` txs for a block, removing them from the pool.
    ///
    /// Candidates order by upstream timestamp ascending.  The first pass
    /// takes at most one tx per sender; the second pass fills remaining
    /// slots from the leftovers, only avoiding hashes already picked.
    pub fn select(&mut self, max: usize) -> Vec<Transaction> {
        let mut candidates: Vec<Transaction> = self.txs.values().cloned().collect();
        candidates.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.reference.cmp(&b.reference)));

        let mut picked: Vec<Transaction> = Vec::new();
        let mut senders_seen: Vec<String> = Vec::new();

        for tx in &candidates {
            if picked.len() >= max {
                break;
            }
            if senders_seen.contains(&tx.sender) {
                continue;
            }
            senders_seen.push(tx.sender.clone());
            picked.push(tx.clone());
        }

        if picked.len() < max {
            for tx in &candidates {
                if picked.len() >= max {
                    break;
                }
                if picked.iter().any(|p| p.hash == tx.hash) {
                    continue;
                }
                picked.push(tx.clone());
            }
        }

        for tx in &picked {
            self.txs.remove(&tx.hash);
        }
        picked
    }

    /// Removes any entries carried by a committed block.
    pub fn remove_committed(&mut self, txs: &[Transaction]) {
        for tx in txs {
            self.txs.remove(&tx.hash);
        }
    }
}
