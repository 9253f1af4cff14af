//! Global parameters for the sidechain.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;

/// Consensus parameters that don't change for the lifetime of the network.
/// Every node on a chain must agree on these.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Chain identifier, also the `custom_json` id we scan upstream blocks
    /// for.
    pub chain_id: String,

    /// Block time in normal mode, milliseconds.
    pub block_time_ms: u64,

    /// Block time while syncing, milliseconds.
    pub sync_block_time_ms: u64,

    /// Size W of the shuffled witness slate per epoch.
    pub witness_slots: usize,

    /// Number of vote rounds a candidate block may accumulate approvals
    /// over before it is dropped.
    pub consensus_rounds: u32,

    /// Base reward credited to the producing witness.
    pub witness_reward: Amount,

    /// Hard cap on mempool transactions mixed into one block.
    pub max_tx_per_block: usize,

    /// Timestamp of the genesis block, ms.
    pub genesis_timestamp: u64,

    /// Upstream height the genesis block anchors to.
    pub genesis_steem_block: u64,

    /// Account named as the genesis block's witness.
    pub origin_witness: String,

    /// Expected hash of block 0.  Startup aborts on mismatch when set.
    pub origin_hash: Option<String>,
}

/// Client operation parameters.  These affect how a node behaves on the
/// network but are not consensus-critical.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    /// Mempool capacity; inserts past this are dropped.
    pub max_mempool: usize,

    /// Age after which a mempool entry expires, ms.
    pub mempool_expiry_ms: u64,

    /// Upstream lag (blocks) below which we consider ourselves live.
    pub steem_block_delay: u64,

    /// Upstream lag at which we enter sync mode.
    pub steem_block_max_delay: u64,

    /// Upstream lag at or below which a node counts as ready to exit sync.
    pub sync_exit_threshold: u64,

    /// Percentage of considered peers that must be ready to exit sync.
    pub sync_exit_quorum_percent: u64,

    /// Age limit on a peer's node status before it stops being considered,
    /// ms.
    pub steem_height_expiry_ms: u64,

    /// Number of blocks after a sync exit during which timing checks are
    /// lenient.
    pub post_sync_lenient_blocks: u64,

    /// Length of the recent-blocks tail kept in memory for phash lookups.
    pub memory_blocks: usize,

    /// Upstream blocks prefetched ahead of the processor.
    pub max_prefetch_blocks: usize,

    /// Consecutive upstream failures before the circuit breaker opens.
    pub circuit_breaker_threshold: u32,

    /// Peer connection cap.
    pub max_peers: usize,

    /// How long a peer's sent-set remembers a message, ms.
    pub keep_history_for_ms: u64,

    /// Interval between sent-set garbage collections, ms.
    pub history_interval_ms: u64,

    /// Ordinary interval between sync status broadcasts, ms.
    pub default_broadcast_interval_ms: u64,

    /// Status broadcast interval while syncing, ms.
    pub fast_broadcast_interval_ms: u64,

    /// Recovery attempts without progress before rotating peers.
    pub max_recover_attempts: u32,

    /// Number of block ids requested per recovery round.
    pub recover_window: u64,

    /// Flush duration past which the next primary slot is skipped, ms.
    pub slow_flush_ms: u64,

    /// Warmup limits for the cache.
    pub warmup_accounts: usize,
    pub warmup_tokens: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub chain: ChainParams,
    pub run: RunParams,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            chain_id: "mirach".to_owned(),
            block_time_ms: 3_000,
            sync_block_time_ms: 1_000,
            witness_slots: 11,
            consensus_rounds: 2,
            witness_reward: Amount::new(100),
            max_tx_per_block: 200,
            genesis_timestamp: 1_700_000_000_000,
            genesis_steem_block: 80_000_000,
            origin_witness: "mirach-origin".to_owned(),
            origin_hash: None,
        }
    }
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            max_mempool: 2_000,
            mempool_expiry_ms: 3_600_000,
            steem_block_delay: 3,
            steem_block_max_delay: 10,
            sync_exit_threshold: 3,
            sync_exit_quorum_percent: 60,
            steem_height_expiry_ms: 30_000,
            post_sync_lenient_blocks: 10,
            memory_blocks: 200,
            max_prefetch_blocks: 10,
            circuit_breaker_threshold: 10,
            max_peers: 15,
            keep_history_for_ms: 120_000,
            history_interval_ms: 10_000,
            default_broadcast_interval_ms: 10_000,
            fast_broadcast_interval_ms: 3_000,
            max_recover_attempts: 5,
            recover_window: 20,
            slow_flush_ms: 500,
            warmup_accounts: 10_000,
            warmup_tokens: 1_000,
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            chain: ChainParams::default(),
            run: RunParams::default(),
        }
    }
}

impl Params {
    /// Active block time for the given mode, ms.
    pub fn block_time_for(&self, syncing: bool) -> u64 {
        if syncing {
            self.chain.sync_block_time_ms
        } else {
            self.chain.block_time_ms
        }
    }
}
