//! Slot selection math.  Pure functions so every timing rule is testable
//! without spinning the worker up.

use mirach_consensus_logic::schedule::Schedule;
use mirach_consensus_logic::ChainError;
use mirach_primitives::block::Block;
use mirach_primitives::params::Params;
use thiserror::Error;

/// Clock-drift buffer added to every primary slot, ms.
pub const DRIFT_BUFFER_MS: i64 = 40;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("chain head moved during assembly")]
    Stale,

    #[error("upstream block {0} not yet available")]
    UpstreamUnavailable(u64),

    #[error("chain: {0}")]
    Chain(#[from] ChainError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotPriority {
    Primary,
    /// Backup slot n covers the primary after n-1 missed windows.
    Backup(u64),
}

#[derive(Clone, Copy, Debug)]
pub struct SlotPlan {
    pub block_id: u64,
    pub mine_in_ms: i64,
    pub priority: SlotPriority,
    pub block_time_ms: u64,
}

/// What to do with a planned slot right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MineDecision {
    MineNow,
    SleepThenMine(u64),
    /// Too early to claim the slot; watch the head and re-check.
    DeferRecheck,
    /// Give the slot up entirely (flush throttle).
    Skip,
}

/// Computes this node's slot for the next block, if it has one.
///
/// `recent_producer` answers "who produced block id", for the backup-slot
/// rule; `slow_flush` marks the last cache flush as over budget.
#[allow(clippy::too_many_arguments)]
pub fn plan_slot(
    account: &str,
    latest: &Block,
    schedule: &Schedule,
    params: &Params,
    syncing: bool,
    lenient_until: u64,
    slow_flush: bool,
    recent_producer: impl Fn(u64) -> Option<String>,
    now_ms: u64,
) -> Option<SlotPlan> {
    let w = schedule.len();
    if w == 0 {
        return None;
    }
    let block_id = latest.id + 1;

    // Inside the post-sync window, targets compute off the normal block
    // time whatever the mode flag says.
    let block_time = if block_id <= lenient_until {
        params.chain.block_time_ms
    } else {
        params.block_time_for(syncing)
    };

    let primary = schedule.primary_for(block_id)?;
    if primary.name == account {
        if slow_flush {
            // Sit this one out; a backup will cover the slot.
            return Some(SlotPlan {
                block_id,
                mine_in_ms: -(block_time as i64),
                priority: SlotPriority::Primary,
                block_time_ms: block_time,
            });
        }
        let elapsed = now_ms.saturating_sub(latest.timestamp) as i64;
        return Some(SlotPlan {
            block_id,
            mine_in_ms: block_time as i64 - elapsed + DRIFT_BUFFER_MS,
            priority: SlotPriority::Primary,
            block_time_ms: block_time,
        });
    }

    // Backup rule: having produced block `latest.id - i + 1` grants claim
    // to backup slot i+1.
    for i in 1..(2 * w as u64) {
        let Some(past_id) = (latest.id + 1).checked_sub(i) else {
            break;
        };
        if recent_producer(past_id).as_deref() == Some(account) {
            let slot = i + 1;
            let target_ts = latest.timestamp + slot * block_time;
            return Some(SlotPlan {
                block_id,
                mine_in_ms: target_ts as i64 - now_ms as i64,
                priority: SlotPriority::Backup(slot),
                block_time_ms: block_time,
            });
        }
    }

    None
}

/// Applies the skip thresholds to a planned slot.
pub fn decide(plan: &SlotPlan, syncing: bool, in_grace: bool) -> MineDecision {
    let bt = plan.block_time_ms as i64;
    if plan.mine_in_ms <= -bt {
        return MineDecision::Skip;
    }

    if syncing {
        let threshold = (bt / 100).max(20);
        if plan.mine_in_ms < threshold {
            return MineDecision::MineNow;
        }
        return MineDecision::SleepThenMine(plan.mine_in_ms as u64);
    }

    let threshold = if in_grace { bt / 10 } else { bt / 3 };
    if plan.mine_in_ms < threshold {
        return MineDecision::DeferRecheck;
    }
    MineDecision::SleepThenMine(plan.mine_in_ms as u64)
}

#[cfg(test)]
mod tests {
    use mirach_consensus_logic::schedule::WitnessEntry;
    use mirach_primitives::amount::Amount;

    use super::*;

    fn schedule(names: &[&str]) -> Schedule {
        Schedule {
            epoch: 0,
            slots: names
                .iter()
                .map(|n| WitnessEntry {
                    name: (*n).to_owned(),
                    pub_key: format!("pub-{n}"),
                    weight: 1,
                })
                .collect(),
        }
    }

    fn latest(id: u64, ts: u64) -> Block {
        Block {
            id,
            phash: "p".to_owned(),
            timestamp: ts,
            steem_block: 100 + id,
            steem_ts: ts,
            txs: vec![],
            witness: "x".to_owned(),
            missed_by: None,
            dist: Amount::ZERO,
            sync: false,
            hash: Some("h".to_owned()),
            signature: Some("s".to_owned()),
        }
    }

    #[test]
    fn test_primary_slot_timing() {
        let sched = schedule(&["a", "b", "c"]);
        let params = Params::default();
        // Block 4: (4-1) % 3 = 0 -> "a".
        let head = latest(3, 10_000);
        let plan = plan_slot("a", &head, &sched, &params, false, 0, false, |_| None, 11_000)
            .expect("test: slot");
        assert_eq!(plan.priority, SlotPriority::Primary);
        // 3000 - 1000 + 40.
        assert_eq!(plan.mine_in_ms, 2_040);
    }

    #[test]
    fn test_non_witness_has_no_slot() {
        let sched = schedule(&["a", "b", "c"]);
        let params = Params::default();
        let head = latest(3, 10_000);
        assert!(
            plan_slot("z", &head, &sched, &params, false, 0, false, |_| None, 11_000).is_none()
        );
    }

    #[test]
    fn test_backup_slot_target() {
        let sched = schedule(&["a", "b", "c"]);
        let params = Params::default();
        let head = latest(3, 10_000);
        // "c" produced block 3 (i = 1), so it may claim backup slot 2 for
        // block 4.
        let plan = plan_slot(
            "c",
            &head,
            &sched,
            &params,
            false,
            0,
            false,
            |id| (id == 3).then(|| "c".to_owned()),
            11_000,
        )
        .expect("test: backup slot");
        assert_eq!(plan.priority, SlotPriority::Backup(2));
        // target = 10000 + 2*3000; mine_in = 16000 - 11000.
        assert_eq!(plan.mine_in_ms, 5_000);
    }

    #[test]
    fn test_slow_flush_skips_primary() {
        let sched = schedule(&["a", "b", "c"]);
        let params = Params::default();
        let head = latest(3, 10_000);
        let plan = plan_slot("a", &head, &sched, &params, false, 0, true, |_| None, 11_000)
            .expect("test: slot");
        assert_eq!(plan.mine_in_ms, -3_000);
        assert_eq!(decide(&plan, false, false), MineDecision::Skip);
    }

    #[test]
    fn test_sync_mode_uses_sync_block_time() {
        let sched = schedule(&["a"]);
        let params = Params::default();
        let head = latest(0, 10_000);
        let plan = plan_slot("a", &head, &sched, &params, true, 0, false, |_| None, 10_100)
            .expect("test: slot");
        // 1000 - 100 + 40.
        assert_eq!(plan.mine_in_ms, 940);

        // Inside the lenient window, the normal block time applies even
        // while syncing.
        let plan = plan_slot("a", &head, &sched, &params, true, 5, false, |_| None, 10_100)
            .expect("test: slot");
        assert_eq!(plan.mine_in_ms, 2_940);
    }

    #[test]
    fn test_decide_thresholds() {
        let plan = |mine_in: i64| SlotPlan {
            block_id: 1,
            mine_in_ms: mine_in,
            priority: SlotPriority::Primary,
            block_time_ms: 3_000,
        };

        // Syncing: near-due slots mine immediately.
        assert_eq!(decide(&plan(10), true, false), MineDecision::MineNow);
        assert_eq!(
            decide(&plan(500), true, false),
            MineDecision::SleepThenMine(500)
        );

        // Normal: early slots defer rather than mine.
        assert_eq!(decide(&plan(500), false, false), MineDecision::DeferRecheck);
        assert_eq!(
            decide(&plan(1_500), false, false),
            MineDecision::SleepThenMine(1_500)
        );

        // Grace tightens the defer bound to bt/10.
        assert_eq!(
            decide(&plan(500), false, true),
            MineDecision::SleepThenMine(500)
        );
        assert_eq!(decide(&plan(200), false, true), MineDecision::DeferRecheck);
    }
}
