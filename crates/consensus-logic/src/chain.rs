//! The chain core: head tracking, block validation, authoritative
//! execution, and the single serialized commit path.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::*;

use mirach_blocklog::BlockLog;
use mirach_db::DocStore;
use mirach_primitives::amount::Amount;
use mirach_primitives::block::Block;
use mirach_primitives::params::Params;
use mirach_primitives::tx::Transaction;
use mirach_state::collections::{ACCOUNTS, BLOCKS, EVENTS};
use mirach_state::StateCache;
use mirach_txexec::TxExecutor;

use crate::errors::ChainError;
use crate::schedule::Schedule;

/// How deep in the recent tail a competing tip may still fork from.
const MAX_FORK_DEPTH: usize = 10;

/// Where block bodies live: the binary block log when a blocks dir is
/// configured, the document store's `blocks` collection otherwise.
pub enum BlockBackend {
    Log(Mutex<BlockLog>),
    Docs(Arc<dyn DocStore>, std::sync::atomic::AtomicI64),
}

impl BlockBackend {
    pub fn docs(store: Arc<dyn DocStore>, height: i64) -> Self {
        Self::Docs(store, std::sync::atomic::AtomicI64::new(height))
    }

    pub fn height(&self) -> i64 {
        match self {
            Self::Log(log) => log.lock().height(),
            Self::Docs(_, h) => h.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    pub async fn append(&self, b: &Block) -> Result<(), ChainError> {
        match self {
            Self::Log(log) => Ok(log.lock().append(b)?),
            Self::Docs(store, h) => {
                let doc = serde_json::to_value(b).map_err(mirach_db::DbError::from)?;
                store.insert_one(BLOCKS, &b.id.to_string(), doc).await?;
                h.store(b.id as i64, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
        }
    }

    pub async fn read(&self, n: i64) -> Result<Option<Block>, ChainError> {
        if n < 0 || n > self.height() {
            return Ok(None);
        }
        match self {
            Self::Log(log) => Ok(Some(log.lock().read(n)?)),
            Self::Docs(store, _) => {
                let doc = store.find_one(BLOCKS, &n.to_string()).await?;
                match doc {
                    Some(doc) => Ok(Some(
                        serde_json::from_value(doc).map_err(mirach_db::DbError::from)?,
                    )),
                    None => Ok(None),
                }
            }
        }
    }

    pub async fn read_range(&self, start: i64, end: i64) -> Result<Vec<Block>, ChainError> {
        match self {
            Self::Log(log) => Ok(log.lock().read_range(start, end)?),
            Self::Docs(..) => {
                let mut out = Vec::new();
                for n in start..=end.min(self.height()) {
                    match self.read(n).await? {
                        Some(b) => out.push(b),
                        None => break,
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Ancillary write toggles, mirrored from the feature env flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct AncillaryWrites {
    pub notifications: bool,
    pub tx_history: bool,
    pub witness_stats: bool,
}

/// How an incoming block's phash relates to our view of the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingKind {
    /// Extends the current head.
    ExtendsHead,
    /// References a recent non-head block: a competing tip, held for
    /// consensus.
    Alternative,
    /// References nothing we know.
    Unknown,
}

pub struct Chain {
    params: Arc<Params>,
    cache: Arc<StateCache>,
    txexec: Arc<TxExecutor>,
    backend: BlockBackend,
    ancillary: AncillaryWrites,

    /// Bounded tail of committed blocks, newest at the back.
    recent: Mutex<VecDeque<Block>>,
}

impl Chain {
    pub fn new(
        params: Arc<Params>,
        cache: Arc<StateCache>,
        txexec: Arc<TxExecutor>,
        backend: BlockBackend,
        ancillary: AncillaryWrites,
    ) -> Self {
        Self {
            params,
            cache,
            txexec,
            backend,
            ancillary,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn params(&self) -> &Arc<Params> {
        &self.params
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    pub fn backend(&self) -> &BlockBackend {
        &self.backend
    }

    /// Startup: creates genesis when the store is empty, verifies the
    /// origin hash, and loads the recent tail.
    pub async fn bootstrap(&self) -> Result<(), ChainError> {
        if self.backend.height() < 0 {
            let g = crate::genesis::make_genesis(&self.params.chain);
            info!(hash = %g.hash.as_deref().unwrap_or(""), "creating genesis block");
            self.backend.append(&g).await?;
            self.cache.set_head_block(0);
            self.cache.write_to_disk().await?;
        }
        let g0 = self
            .backend
            .read(0)
            .await?
            .ok_or_else(|| ChainError::Other("missing genesis block".to_owned()))?;
        crate::genesis::check_origin(&self.params.chain, &g0)?;
        self.load_recent().await
    }

    /// Loads the recent tail from storage.  Called once at startup after
    /// genesis/rebuild handling.
    pub async fn load_recent(&self) -> Result<(), ChainError> {
        let head = self.backend.height();
        if head < 0 {
            return Ok(());
        }
        let start = (head + 1 - self.params.run.memory_blocks as i64).max(0);
        let blocks = self.backend.read_range(start, head).await?;
        let mut recent = self.recent.lock();
        recent.clear();
        recent.extend(blocks);
        Ok(())
    }

    pub fn head(&self) -> Block {
        self.recent
            .lock()
            .back()
            .cloned()
            .expect("chain: empty recent tail")
    }

    pub fn head_id(&self) -> u64 {
        self.head().id
    }

    /// A block from the in-memory tail, if still there.
    pub fn recent_block(&self, id: u64) -> Option<Block> {
        self.recent.lock().iter().rev().find(|b| b.id == id).cloned()
    }

    /// Classifies an incoming block by its phash, per the fork rules.
    pub fn classify_incoming(&self, b: &Block) -> IncomingKind {
        let recent = self.recent.lock();
        let Some(head) = recent.back() else {
            return IncomingKind::Unknown;
        };
        if Some(&b.phash) == head.hash.as_ref() {
            return IncomingKind::ExtendsHead;
        }
        let depth = recent.len().min(MAX_FORK_DEPTH);
        let forked = recent
            .iter()
            .rev()
            .take(depth)
            .skip(1)
            .any(|r| r.hash.as_ref() == Some(&b.phash));
        if forked {
            IncomingKind::Alternative
        } else {
            IncomingKind::Unknown
        }
    }

    /// Structural and authorization checks against the current head.
    ///
    /// `lenient_until` is the post-sync grace boundary: block ids at or
    /// below it check timing against the normal block time regardless of
    /// their sync flag.
    pub fn validate_block(
        &self,
        b: &Block,
        schedule: &Schedule,
        lenient_until: u64,
    ) -> Result<(), ChainError> {
        let head = self.head();

        if b.id != head.id + 1 {
            return Err(ChainError::NotNextBlock {
                got: b.id,
                head: head.id,
            });
        }
        if Some(&b.phash) != head.hash.as_ref() {
            return Err(ChainError::InvalidPhash(b.id));
        }
        if b.steem_block != head.steem_block + 1 {
            return Err(ChainError::BadAnchor(b.id, b.steem_block, head.steem_block + 1));
        }
        if !b.verify_hash() {
            return Err(ChainError::InvalidHash(b.id));
        }

        // Witness authorization: the slot's primary, or a backup naming
        // the primary it covered for.
        let Some(primary) = schedule.primary_for(b.id) else {
            return Err(ChainError::UnauthorizedWitness(b.witness.clone(), b.id));
        };
        if b.witness != primary.name {
            let named = b.missed_by.as_deref() == Some(primary.name.as_str());
            if !schedule.contains(&b.witness) || !named {
                return Err(ChainError::UnauthorizedWitness(b.witness.clone(), b.id));
            }
        }

        let signer = schedule
            .get(&b.witness)
            .map(|w| w.pub_key.clone())
            .ok_or_else(|| ChainError::UnauthorizedWitness(b.witness.clone(), b.id))?;
        b.verify_signature(&signer)
            .map_err(|_| ChainError::InvalidSignature(b.id))?;

        // Slot timing: backups wait out the primary's slot first.
        let base = if b.id <= lenient_until {
            self.params.chain.block_time_ms
        } else {
            self.params.block_time_for(b.sync)
        };
        let slots = if b.missed_by.is_some() { 2 } else { 1 };
        let min_ts = head.timestamp + base * slots;
        if b.timestamp < min_ts {
            return Err(ChainError::BlockTooEarly {
                id: b.id,
                ts: b.timestamp,
                min: min_ts,
            });
        }

        Ok(())
    }

    /// Runs a block's transactions through the cache.
    ///
    /// Speculative mode (block assembly) drops failing txs and returns the
    /// survivors; the caller rolls the cache back afterwards.  Committal
    /// mode fails the whole block on any tx failure.  Both credit the
    /// producing witness, so `dist` comes out identical on every node.
    pub async fn execute_block_transactions(
        &self,
        b: &Block,
        speculative: bool,
    ) -> Result<(Vec<Transaction>, Amount), ChainError> {
        let mut valid = Vec::with_capacity(b.txs.len());
        let mut distributed = Amount::ZERO;

        for tx in &b.txs {
            let res = async {
                self.txexec.validate(tx, b.timestamp, &self.cache).await?;
                self.txexec.execute(tx, b.timestamp, &self.cache).await
            }
            .await;

            match res {
                Ok(amount) => {
                    distributed = distributed
                        .checked_add(amount)
                        .ok_or_else(|| ChainError::Other("dist overflow".to_owned()))?;
                    valid.push(tx.clone());
                }
                Err(e) if speculative => {
                    debug!(r = %tx.reference, err = %e, "dropping failing tx from candidate");
                }
                Err(e) => return Err(ChainError::TxFailed(tx.reference.clone(), e)),
            }
        }

        distributed = distributed
            .checked_add(self.credit_witness_reward(b).await?)
            .ok_or_else(|| ChainError::Other("dist overflow".to_owned()))?;

        Ok((valid, distributed))
    }

    async fn credit_witness_reward(&self, b: &Block) -> Result<Amount, ChainError> {
        let reward = self.params.chain.witness_reward;
        if reward.is_zero() {
            return Ok(Amount::ZERO);
        }
        let credited = self
            .cache
            .update_one(
                ACCOUNTS,
                &b.witness,
                &json!({"$inc": {"balance": reward.to_string()}}),
            )
            .await?;
        if !credited {
            // Unknown producer account: no reward, nothing distributed.
            warn!(witness = %b.witness, "producer account missing, skipping reward");
            return Ok(Amount::ZERO);
        }
        Ok(reward)
    }

    /// The single serialized commit path: authoritative execution, the
    /// block-store append, tail/head bookkeeping, and the state flush.
    pub async fn commit_block(&self, b: &Block) -> Result<(), ChainError> {
        let (_, distributed) = match self.execute_block_transactions(b, false).await {
            Ok(out) => out,
            Err(e) => {
                self.cache.rollback();
                return Err(e);
            }
        };
        if distributed != b.dist {
            self.cache.rollback();
            return Err(ChainError::Other(format!(
                "block {} dist mismatch: executed {}, declared {}",
                b.id, distributed, b.dist
            )));
        }

        self.write_ancillary(b).await?;

        self.backend.append(b).await?;
        {
            let mut recent = self.recent.lock();
            recent.push_back(b.clone());
            while recent.len() > self.params.run.memory_blocks {
                recent.pop_front();
            }
        }

        self.cache.set_head_block(b.id);
        self.cache.write_to_disk().await?;

        info!(id = %b.id, witness = %b.witness, txs = %b.txs.len(), "committed block");
        Ok(())
    }

    async fn write_ancillary(&self, b: &Block) -> Result<(), ChainError> {
        if self.ancillary.notifications {
            self.cache
                .insert_one(
                    EVENTS,
                    json!({
                        "_id": format!("block-{}", b.id),
                        "kind": "block",
                        "block": b.id,
                        "witness": b.witness,
                        "ts": b.timestamp,
                        "txs": b.txs.len(),
                    }),
                )
                .await?;
        }
        if self.ancillary.tx_history {
            for tx in &b.txs {
                self.cache
                    .update_one(
                        ACCOUNTS,
                        &tx.sender,
                        &json!({"$push": {"history": tx.reference}}),
                    )
                    .await?;
            }
        }
        if self.ancillary.witness_stats {
            self.cache
                .update_one(ACCOUNTS, &b.witness, &json!({"$inc": {"produced": 1}}))
                .await?;
            if let Some(missed) = &b.missed_by {
                self.cache
                    .update_one(ACCOUNTS, missed, &json!({"$inc": {"missed": 1}}))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
