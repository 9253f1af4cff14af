//! Ordered upstream-block processing: prefetch, candidate validation, and
//! the circuit breaker that pushes the node into sync mode when the
//! upstream goes dark.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::*;

use mirach_common::retry::{Backoff, ExponentialBackoff};
use mirach_primitives::block::Block;
use mirach_primitives::params::Params;
use mirach_primitives::tx::Transaction;
use mirach_state::StateCache;
use mirach_steemio::rpc::pool::SteemClientPool;
use mirach_steemio::rpc::traits::SteemClient;
use mirach_steemio::{parse_block, SteemBlock};
use mirach_txexec::TxExecutor;

use crate::errors::ChainError;

const FETCH_ATTEMPTS: u32 = 5;

/// The outcome of processing one upstream block: the candidate sidechain
/// txs that survived validation, plus the block's timestamp.
#[derive(Clone, Debug)]
pub struct ProcessedUpstream {
    pub height: u64,
    pub txs: Vec<Transaction>,
    pub timestamp_ms: u64,
}

pub struct BlockProcessor<C> {
    pool: Arc<SteemClientPool<C>>,
    params: Arc<Params>,
    cache: Arc<StateCache>,
    txexec: Arc<TxExecutor>,
    chain_id: String,

    /// Raw upstream blocks fetched ahead of the processor.
    prefetched: Mutex<LruCache<u64, SteemBlock>>,

    /// Validated upstream-bound tx sets per processed height, kept for
    /// block validation.
    bound: Mutex<LruCache<u64, ProcessedUpstream>>,

    last_processed: AtomicU64,
    in_flight: Mutex<HashSet<u64>>,
    consecutive_errors: AtomicU32,
}

impl<C: SteemClient> BlockProcessor<C> {
    pub fn new(
        pool: Arc<SteemClientPool<C>>,
        params: Arc<Params>,
        cache: Arc<StateCache>,
        txexec: Arc<TxExecutor>,
        last_processed: u64,
    ) -> Self {
        let cap = NonZeroUsize::new(4 * params.run.max_prefetch_blocks.max(1))
            .expect("processor: cache cap");
        Self {
            pool,
            chain_id: params.chain.chain_id.clone(),
            params,
            cache,
            txexec,
            prefetched: Mutex::new(LruCache::new(cap)),
            bound: Mutex::new(LruCache::new(cap)),
            last_processed: AtomicU64::new(last_processed),
            in_flight: Mutex::new(HashSet::new()),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn last_processed(&self) -> u64 {
        self.last_processed.load(Ordering::Relaxed)
    }

    pub fn set_last_processed(&self, height: u64) {
        self.last_processed.store(height, Ordering::Relaxed);
    }

    /// Consecutive fetch failures have crossed the threshold; the sync
    /// manager reacts by entering sync mode while prefetch pauses.
    pub fn breaker_open(&self) -> bool {
        self.consecutive_errors.load(Ordering::Relaxed) >= self.params.run.circuit_breaker_threshold
    }

    fn record_failure(&self) {
        let n = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if n == self.params.run.circuit_breaker_threshold {
            warn!(errors = %n, "upstream circuit breaker opened");
        }
    }

    fn record_success(&self) {
        if self.breaker_open() {
            info!("upstream circuit breaker closed");
        }
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// Processes upstream block `n`: fetch, parse, validate candidates.
    ///
    /// Only legal for `n == last_processed + 1`, and at most once
    /// concurrently per height; anything else returns `None` immediately.
    pub async fn process_upstream(&self, n: u64) -> Result<Option<ProcessedUpstream>, ChainError> {
        if n != self.last_processed() + 1 {
            return Ok(None);
        }
        if !self.in_flight.lock().insert(n) {
            return Ok(None);
        }

        let res = self.process_inner(n).await;
        self.in_flight.lock().remove(&n);

        let processed = res?;
        self.last_processed.store(n, Ordering::Relaxed);
        Ok(Some(processed))
    }

    async fn process_inner(&self, n: u64) -> Result<ProcessedUpstream, ChainError> {
        let steem_block = match self.prefetched.lock().pop(&n) {
            Some(b) => b,
            None => self.fetch_with_retry(n).await?,
        };

        let parsed = parse_block(&steem_block, n, &self.chain_id);
        let mut valid = Vec::with_capacity(parsed.txs.len());
        for tx in parsed.txs {
            match self.txexec.validate(&tx, parsed.timestamp_ms, &self.cache).await {
                Ok(()) => valid.push(tx),
                Err(e) => debug!(r = %tx.reference, err = %e, "dropping invalid candidate"),
            }
        }

        let processed = ProcessedUpstream {
            height: n,
            txs: valid,
            timestamp_ms: parsed.timestamp_ms,
        };
        self.bound.lock().put(n, processed.clone());
        Ok(processed)
    }

    /// The validated upstream-bound set for a height, if still in memory.
    pub fn bound_txs(&self, height: u64) -> Option<ProcessedUpstream> {
        self.bound.lock().get(&height).cloned()
    }

    /// Pulls upstream blocks ahead of the processor into the prefetch
    /// cache.  Sync mode reads further ahead.
    pub async fn prefetch_blocks(&self, start: u64, is_syncing: bool) -> Result<(), ChainError> {
        if self.breaker_open() {
            return Ok(());
        }
        let count = if is_syncing {
            self.params.run.max_prefetch_blocks
        } else {
            2
        };
        for height in start..start + count as u64 {
            if self.prefetched.lock().contains(&height) {
                continue;
            }
            match self.pool.get_block(height).await {
                Ok(Some(b)) => {
                    self.record_success();
                    self.prefetched.lock().put(height, b);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%height, err = %e, "prefetch fetch failed");
                    self.record_failure();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Fetches one upstream block with bounded retries, rotating endpoints
    /// after repeated failures.
    async fn fetch_with_retry(&self, n: u64) -> Result<SteemBlock, ChainError> {
        let backoff = ExponentialBackoff::block_fetch();
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.pool.get_block(n).await {
                Ok(Some(b)) => {
                    self.record_success();
                    return Ok(b);
                }
                Ok(None) => {
                    trace!(%n, %attempt, "upstream block not yet available");
                }
                Err(e) => {
                    warn!(%n, %attempt, err = %e, "upstream fetch failed");
                }
            }
            if attempt == 2 {
                self.pool.switch_to_next_endpoint();
            }
            if attempt < FETCH_ATTEMPTS {
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
            }
        }
        self.record_failure();
        Err(ChainError::MissingUpstream(n))
    }

    /// Recomputes the valid upstream-derived set for a block's anchor and
    /// compares refs exactly against the block's anchored txs.
    pub async fn validate_block_against_upstream(&self, b: &Block) -> Result<bool, ChainError> {
        let bound = match self.bound_txs(b.steem_block) {
            Some(p) => p,
            None => {
                let steem_block = self.fetch_with_retry(b.steem_block).await?;
                let parsed = parse_block(&steem_block, b.steem_block, &self.chain_id);
                let mut valid = Vec::new();
                for tx in parsed.txs {
                    if self
                        .txexec
                        .validate(&tx, parsed.timestamp_ms, &self.cache)
                        .await
                        .is_ok()
                    {
                        valid.push(tx);
                    }
                }
                ProcessedUpstream {
                    height: b.steem_block,
                    txs: valid,
                    timestamp_ms: parsed.timestamp_ms,
                }
            }
        };

        let prefix = format!("{}:", b.steem_block);
        let block_refs: HashSet<&str> = b
            .txs
            .iter()
            .filter(|t| t.reference.starts_with(&prefix))
            .map(|t| t.reference.as_str())
            .collect();
        let bound_refs: HashSet<&str> = bound.txs.iter().map(|t| t.reference.as_str()).collect();

        Ok(block_refs == bound_refs)
    }
}

#[cfg(test)]
mod tests;
