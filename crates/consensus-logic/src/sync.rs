//! Sync-mode state machine and the quorum-gated exit.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::*;

use mirach_primitives::params::Params;
use mirach_status::SyncStatus;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Normal,
    Syncing,
}

/// A peer's last-broadcast sync status plus how stale it is.
#[derive(Clone, Debug)]
pub struct PeerSyncStatus {
    pub status: SyncStatus,
    pub age_ms: u64,
}

struct SyncState {
    mode: SyncMode,
    behind: u64,
    exit_target: Option<u64>,
    post_sync_lenient_until: u64,
    last_sync_exit_ms: u64,

    // Broadcast bookkeeping.
    dirty: bool,
    last_broadcast_ms: u64,
    last_broadcast_behind: u64,
}

pub struct SyncManager {
    params: Arc<Params>,
    state: Mutex<SyncState>,
}

impl SyncManager {
    pub fn new(params: Arc<Params>, start_syncing: bool) -> Self {
        Self {
            params,
            state: Mutex::new(SyncState {
                mode: if start_syncing {
                    SyncMode::Syncing
                } else {
                    SyncMode::Normal
                },
                behind: 0,
                exit_target: None,
                post_sync_lenient_until: 0,
                last_sync_exit_ms: 0,
                dirty: true,
                last_broadcast_ms: 0,
                last_broadcast_behind: 0,
            }),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.state.lock().mode
    }

    pub fn is_syncing(&self) -> bool {
        self.mode() == SyncMode::Syncing
    }

    pub fn behind(&self) -> u64 {
        self.state.lock().behind
    }

    pub fn exit_target(&self) -> Option<u64> {
        self.state.lock().exit_target
    }

    /// Post-sync grace boundary: block ids at or below this validate and
    /// schedule against the normal block time.
    pub fn lenient_until(&self) -> u64 {
        self.state.lock().post_sync_lenient_until
    }

    pub fn last_sync_exit_ms(&self) -> u64 {
        self.state.lock().last_sync_exit_ms
    }

    /// Records the current upstream lag; crossing the max-delay threshold
    /// (or an open circuit breaker) flips the node into sync mode.
    pub fn observe(&self, behind: u64, breaker_open: bool) {
        let mut st = self.state.lock();
        st.behind = behind;
        if st.mode == SyncMode::Normal
            && (behind >= self.params.run.steem_block_max_delay || breaker_open)
        {
            info!(%behind, %breaker_open, "entering sync mode");
            st.mode = SyncMode::Syncing;
            st.exit_target = None;
            st.dirty = true;
        }
    }

    pub fn set_exit_target(&self, target: Option<u64>) {
        let mut st = self.state.lock();
        if st.exit_target != target {
            st.exit_target = target;
            st.dirty = true;
        }
    }

    /// The full exit decision.  `realtime_behind` is the fresh recheck via
    /// the upstream client; `None` falls back to the cached lag.
    pub fn should_exit_sync(
        &self,
        realtime_behind: Option<u64>,
        peers: &[PeerSyncStatus],
        active_witness_ids: &HashSet<String>,
        local_block_id: u64,
    ) -> bool {
        let st = self.state.lock();
        if st.mode != SyncMode::Syncing {
            return false;
        }
        let behind = realtime_behind.unwrap_or(st.behind);
        drop(st);

        // Catching up with the live head: leave regardless of quorum.
        if behind < self.params.run.steem_block_delay {
            return true;
        }
        if behind > self.params.run.sync_exit_threshold {
            return false;
        }

        self.quorum_ready(peers, active_witness_ids, behind, local_block_id)
    }

    /// The network-quorum rule over considered peers.
    pub fn quorum_ready(
        &self,
        peers: &[PeerSyncStatus],
        active_witness_ids: &HashSet<String>,
        local_behind: u64,
        local_block_id: u64,
    ) -> bool {
        let threshold = self.params.run.sync_exit_threshold;
        let expiry = self.params.run.steem_height_expiry_ms;

        let considered: Vec<&PeerSyncStatus> = peers
            .iter()
            .filter(|p| p.age_ms <= expiry)
            .filter(|p| {
                active_witness_ids.is_empty() || active_witness_ids.contains(&p.status.node_id)
            })
            .collect();

        if considered.is_empty() {
            return local_behind <= threshold;
        }

        let ready = considered
            .iter()
            .filter(|p| {
                let s = &p.status;
                (!s.is_syncing && s.behind <= threshold)
                    || (s.is_syncing && s.behind <= threshold)
                    || s.exit_target
                        .map(|t| t <= local_block_id + threshold)
                        .unwrap_or(false)
            })
            .count();

        ready as u64 * 100 >= considered.len() as u64 * self.params.run.sync_exit_quorum_percent
    }

    /// Leaves sync mode, opening the post-sync leniency window.
    pub fn exit_sync(&self, block_id: u64, now_ms: u64) {
        let mut st = self.state.lock();
        if st.mode != SyncMode::Syncing {
            return;
        }
        st.mode = SyncMode::Normal;
        st.post_sync_lenient_until = block_id + self.params.run.post_sync_lenient_blocks;
        st.last_sync_exit_ms = now_ms;
        st.exit_target = None;
        st.dirty = true;
        info!(%block_id, lenient_until = %st.post_sync_lenient_until, "exited sync mode");
    }

    /// Decides whether a status broadcast is due: on any state transition,
    /// on a lag jump, or on the periodic interval (jittered against
    /// herding).
    pub fn tick_broadcast(
        &self,
        now_ms: u64,
        node_id: &str,
        steem_block: u64,
        block_id: u64,
    ) -> Option<SyncStatus> {
        let mut st = self.state.lock();
        let interval = if st.mode == SyncMode::Syncing {
            self.params.run.fast_broadcast_interval_ms
        } else {
            self.params.run.default_broadcast_interval_ms
        };
        let jitter = rand::thread_rng().gen_range(0..500);

        let lag_jump = st.behind.abs_diff(st.last_broadcast_behind) > 2;
        let due = now_ms.saturating_sub(st.last_broadcast_ms) + jitter >= interval;

        if !(st.dirty || lag_jump || due) {
            return None;
        }

        st.dirty = false;
        st.last_broadcast_ms = now_ms;
        st.last_broadcast_behind = st.behind;

        Some(SyncStatus {
            node_id: node_id.to_owned(),
            behind: st.behind,
            steem_block,
            is_syncing: st.mode == SyncMode::Syncing,
            block_id,
            exit_target: st.exit_target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(node_id: &str, is_syncing: bool, behind: u64) -> PeerSyncStatus {
        PeerSyncStatus {
            status: SyncStatus {
                node_id: node_id.to_owned(),
                behind,
                steem_block: 0,
                is_syncing,
                block_id: 0,
                exit_target: None,
            },
            age_ms: 0,
        }
    }

    fn syncing_manager() -> SyncManager {
        SyncManager::new(Arc::new(Params::default()), true)
    }

    #[test]
    fn test_enter_on_max_delay() {
        let m = SyncManager::new(Arc::new(Params::default()), false);
        m.observe(3, false);
        assert_eq!(m.mode(), SyncMode::Normal);
        m.observe(10, false);
        assert_eq!(m.mode(), SyncMode::Syncing);
    }

    #[test]
    fn test_enter_on_breaker() {
        let m = SyncManager::new(Arc::new(Params::default()), false);
        m.observe(0, true);
        assert_eq!(m.mode(), SyncMode::Syncing);
    }

    #[test]
    fn test_exit_quorum_two_of_three() {
        let m = syncing_manager();
        let peers = vec![
            peer("p1", false, 1),
            peer("p2", false, 0),
            peer("p3", true, 10),
        ];
        // threshold 3, quorum 60%: 2/3 ready = 66% >= 60 -> exit.
        assert!(m.quorum_ready(&peers, &HashSet::new(), 1, 100));
        // The full decision path agrees when the lag sits at the
        // threshold (no live-head shortcut).
        assert!(m.should_exit_sync(Some(3), &peers, &HashSet::new(), 100));

        let peers = vec![
            peer("p1", false, 5),
            peer("p2", false, 0),
            peer("p3", true, 10),
        ];
        // 1/3 ready -> stay.
        assert!(!m.quorum_ready(&peers, &HashSet::new(), 1, 100));
        assert!(!m.should_exit_sync(Some(3), &peers, &HashSet::new(), 100));
    }

    #[test]
    fn test_exit_target_counts_as_ready() {
        let m = syncing_manager();
        let mut p = peer("p1", true, 50);
        p.status.exit_target = Some(101);
        // exit_target 101 <= local 100 + threshold 3.
        assert!(m.quorum_ready(&[p], &HashSet::new(), 3, 100));
    }

    #[test]
    fn test_stale_and_nonwitness_peers_ignored() {
        let m = syncing_manager();
        let mut stale = peer("p1", false, 0);
        stale.age_ms = 60_000;
        // Only stale peers: considered set is empty, local lag decides.
        assert!(m.quorum_ready(&[stale.clone()], &HashSet::new(), 3, 100));
        assert!(!m.quorum_ready(&[stale], &HashSet::new(), 9, 100));

        // A witness filter that excludes the only live peer.
        let live = peer("p2", false, 0);
        let witnesses: HashSet<String> = ["w9".to_owned()].into();
        assert!(m.quorum_ready(&[live], &witnesses, 3, 100));
    }

    #[test]
    fn test_shortcut_below_live_delay() {
        let m = syncing_manager();
        // behind < steem_block_delay (3): exit regardless of hostile quorum.
        let peers = vec![peer("p1", true, 99)];
        assert!(m.should_exit_sync(Some(2), &peers, &HashSet::new(), 100));
        // Too far behind: never exit.
        assert!(!m.should_exit_sync(Some(8), &peers, &HashSet::new(), 100));
    }

    #[test]
    fn test_cached_fallback_when_rpc_fails() {
        let m = syncing_manager();
        m.observe(1, false);
        assert!(m.should_exit_sync(None, &[], &HashSet::new(), 100));
    }

    #[test]
    fn test_exit_opens_leniency_window() {
        let m = syncing_manager();
        m.exit_sync(40, 123_456);
        assert_eq!(m.mode(), SyncMode::Normal);
        assert_eq!(m.lenient_until(), 50);
        assert_eq!(m.last_sync_exit_ms(), 123_456);
    }

    #[test]
    fn test_broadcast_on_transition_and_lag_jump() {
        let m = SyncManager::new(Arc::new(Params::default()), false);
        // Initial state is dirty: first tick always broadcasts.
        assert!(m.tick_broadcast(1_000, "n", 5, 1).is_some());
        // Nothing changed and interval not due.
        assert!(m.tick_broadcast(1_100, "n", 5, 1).is_none());
        // Lag jumps by more than 2.
        m.observe(4, false);
        let s = m.tick_broadcast(1_200, "n", 5, 1).unwrap();
        assert_eq!(s.behind, 4);
    }
}
