//! The mining worker: assembles, executes speculatively, signs, and hands
//! finished candidates off for consensus.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use secp256k1::SecretKey;
use tokio::sync::mpsc;
use tracing::*;

use mirach_consensus_logic::schedule::Schedule;
use mirach_consensus_logic::{BlockProcessor, Chain, Mempool, SyncManager};
use mirach_primitives::block::Block;
use mirach_primitives::params::Params;
use mirach_steemio::SteemClient;

use crate::slot::{self, MineDecision, MinerError, SlotPlan, SlotPriority};

/// How long to watch the head before re-checking the upstream when a slot
/// keeps deferring.
const DEFER_RECHECK_MS: u64 = 500;
const DEFER_ROUNDS_BEFORE_UPSTREAM_CHECK: u32 = 6;

pub struct Miner<C> {
    chain: Arc<Chain>,
    processor: Arc<BlockProcessor<C>>,
    sync: Arc<SyncManager>,
    mempool: Arc<Mutex<Mempool>>,
    account: String,
    key: SecretKey,
    params: Arc<Params>,
}

impl<C: SteemClient> Miner<C> {
    pub fn new(
        chain: Arc<Chain>,
        processor: Arc<BlockProcessor<C>>,
        sync: Arc<SyncManager>,
        mempool: Arc<Mutex<Mempool>>,
        account: String,
        key: SecretKey,
    ) -> Self {
        let params = chain.params().clone();
        Self {
            chain,
            processor,
            sync,
            mempool,
            account,
            key,
            params,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Plans our slot for the next block, if we have one.
    pub fn schedule_next(&self, latest: &Block, schedule: &Schedule) -> Option<SlotPlan> {
        let slow_flush = self.chain.cache().last_flush_ms() > self.params.run.slow_flush_ms;
        slot::plan_slot(
            &self.account,
            latest,
            schedule,
            &self.params,
            self.sync.is_syncing(),
            self.sync.lenient_until(),
            slow_flush,
            |id| self.chain.recent_block(id).map(|b| b.witness),
            now_millis(),
        )
    }

    /// Assembles the candidate: the upstream-bound set for the next anchor
    /// plus a fair mempool selection.
    pub async fn prepare(&self, plan: &SlotPlan) -> Result<Block, MinerError> {
        let latest = self.chain.head();
        if latest.id + 1 != plan.block_id {
            return Err(MinerError::Stale);
        }
        let anchor = latest.steem_block + 1;

        let bound = match self.processor.bound_txs(anchor) {
            Some(b) => b,
            None => match self.processor.process_upstream(anchor).await? {
                Some(b) => b,
                None => return Err(MinerError::UpstreamUnavailable(anchor)),
            },
        };

        let anchor_prefix = format!("{anchor}:");
        let mut txs = bound.txs.clone();
        {
            let mut pool = self.mempool.lock();
            pool.remove_committed(&txs);
            let budget = self.params.chain.max_tx_per_block.saturating_sub(txs.len());
            let mut extra = pool.select(budget);
            // Anything anchored to this height must come from the bound
            // set only.
            extra.retain(|t| !t.reference.starts_with(&anchor_prefix));
            txs.extend(extra);
        }

        Ok(Block {
            id: plan.block_id,
            phash: latest.hash.clone().ok_or(MinerError::Stale)?,
            timestamp: now_millis(),
            steem_block: anchor,
            steem_ts: bound.timestamp_ms,
            txs,
            witness: self.account.clone(),
            missed_by: None,
            dist: self.params.chain.witness_reward,
            sync: self.sync.is_syncing(),
            hash: None,
            signature: None,
        })
    }

    /// Speculatively executes the candidate, keeps the surviving txs,
    /// signs, and re-checks the head didn't move underneath us.
    pub async fn mine(
        &self,
        mut block: Block,
        schedule: &Schedule,
    ) -> Result<Block, MinerError> {
        let exec = self.chain.execute_block_transactions(&block, true).await;
        // The signed block is re-executed by every committer; whatever the
        // speculative run did is discarded here either way.
        self.chain.cache().rollback();
        let (valid, distributed) = exec?;

        block.txs = valid;
        block.dist = distributed;
        if let Some(primary) = schedule.primary_for(block.id) {
            if primary.name != self.account {
                block.missed_by = Some(primary.name.clone());
            }
        }
        block.seal(&self.key);

        if self.chain.head().hash != Some(block.phash.clone()) {
            return Err(MinerError::Stale);
        }
        Ok(block)
    }
}

/// The slot loop: plan, wait out the slot, produce, submit.  Candidates go
/// out over `proposal_tx` to the consensus round-keeper.
pub async fn miner_task<C: SteemClient + 'static>(
    miner: Arc<Miner<C>>,
    schedule: Arc<Mutex<Schedule>>,
    proposal_tx: mpsc::Sender<Block>,
    mut shutdown: mirach_tasks::ShutdownGuard,
) -> anyhow::Result<()> {
    info!(account = %miner.account, "miner started");
    let mut defer_rounds = 0u32;

    loop {
        if shutdown.should_shutdown() {
            info!("miner shutting down, refusing new slots");
            return Ok(());
        }

        let latest = miner.chain.head();
        let sched = schedule.lock().clone();
        let Some(plan) = miner.schedule_next(&latest, &sched) else {
            tokio::time::sleep(Duration::from_millis(
                miner.params.chain.block_time_ms / 2,
            ))
            .await;
            continue;
        };

        let in_grace = plan.block_id <= miner.sync.lenient_until();
        match slot::decide(&plan, miner.sync.is_syncing(), in_grace) {
            MineDecision::Skip => {
                debug!(id = %plan.block_id, "skipping slot (slow flush)");
                tokio::time::sleep(Duration::from_millis(plan.block_time_ms)).await;
                continue;
            }
            MineDecision::DeferRecheck => {
                // Watch the head; if nothing moves for a while the
                // upstream view may be stale, so poke it.  The slot is
                // never dropped silently.
                defer_rounds += 1;
                if defer_rounds >= DEFER_ROUNDS_BEFORE_UPSTREAM_CHECK {
                    defer_rounds = 0;
                    let _ = miner
                        .processor
                        .prefetch_blocks(miner.processor.last_processed() + 1, false)
                        .await;
                }
                tokio::time::sleep(Duration::from_millis(DEFER_RECHECK_MS)).await;
                continue;
            }
            MineDecision::SleepThenMine(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if miner.chain.head_id() != latest.id {
                    continue;
                }
            }
            MineDecision::MineNow => {}
        }
        defer_rounds = 0;

        match produce(&miner, &plan, &sched).await {
            Ok(block) => {
                info!(id = %block.id, txs = %block.txs.len(), "mined block");
                if proposal_tx.send(block).await.is_err() {
                    warn!("proposal channel closed, miner exiting");
                    return Ok(());
                }
            }
            Err(MinerError::Stale) => {
                debug!(id = %plan.block_id, "slot aborted, head moved");
            }
            Err(e) => {
                warn!(id = %plan.block_id, err = %e, "failed to produce block");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        tokio::select! {
            _ = shutdown.wait_for_shutdown() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}

async fn produce<C: SteemClient>(
    miner: &Miner<C>,
    plan: &SlotPlan,
    schedule: &Schedule,
) -> Result<Block, MinerError> {
    let block = match miner.prepare(plan).await {
        Ok(b) => b,
        Err(MinerError::UpstreamUnavailable(anchor)) => {
            // Caught up but the next anchor isn't out yet: give it a
            // second and retry once.
            if miner.sync.behind() == 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                miner.prepare(plan).await?
            } else {
                return Err(MinerError::UpstreamUnavailable(anchor));
            }
        }
        Err(e) => return Err(e),
    };

    if let SlotPriority::Backup(slot) = plan.priority {
        trace!(id = %block.id, %slot, "producing as backup");
    }
    miner.mine(block, schedule).await
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as u64
}

#[cfg(test)]
mod tests;
