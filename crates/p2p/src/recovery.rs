//! Block recovery: request the blocks between our head and the network's,
//! buffer the replies, and hand them back in apply order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mirach_primitives::block::Block;
use mirach_primitives::params::Params;
use parking_lot::Mutex;
use tracing::*;

use crate::registry::PeerId;

#[derive(Default)]
struct RecState {
    recovering: bool,

    /// Ids with an outstanding QUERY_BLOCK.
    recovering_blocks: HashSet<u64>,

    /// Replies waiting to be applied, keyed by id.
    recovered_blocks: HashMap<u64, Block>,

    /// Rounds without progress.
    recover_attempt: u32,

    /// Round-robin cursor over peers to query.
    peer_cursor: usize,

    last_head: u64,
}

pub struct RecoveryEngine {
    params: Arc<Params>,
    state: Mutex<RecState>,
}

impl RecoveryEngine {
    pub fn new(params: Arc<Params>) -> Self {
        Self {
            params,
            state: Mutex::new(RecState::default()),
        }
    }

    pub fn recovering(&self) -> bool {
        self.state.lock().recovering
    }

    /// One recovery round: given our head and the best head any peer
    /// reports, returns the ids to request now.  Tracks progress and
    /// bumps the attempt counter on stalls; `force` restarts a stale
    /// round.
    pub fn refresh(&self, head_id: u64, best_peer_head: Option<u64>, force: bool) -> Vec<u64> {
        let mut st = self.state.lock();

        let target = best_peer_head.unwrap_or(0);
        if target <= head_id {
            if st.recovering {
                info!(%head_id, "recovery complete");
            }
            *st = RecState {
                last_head: head_id,
                ..RecState::default()
            };
            return Vec::new();
        }

        if force {
            st.recovering_blocks.clear();
        }

        if !st.recovering {
            st.recovering = true;
            st.recover_attempt = 0;
            info!(%head_id, %target, "starting block recovery");
        }

        // Progress check: a moving head resets the attempt counter.
        if head_id > st.last_head {
            st.recover_attempt = 0;
        } else {
            st.recover_attempt += 1;
        }
        st.last_head = head_id;

        let window_end = (head_id + self.params.run.recover_window).min(target);
        let ids: Vec<u64> = (head_id + 1..=window_end)
            .filter(|id| !st.recovering_blocks.contains(id) && !st.recovered_blocks.contains_key(id))
            .collect();
        st.recovering_blocks.extend(ids.iter().copied());
        ids
    }

    /// Buffers a QUERY_BLOCK reply.  Unsolicited blocks are ignored.
    pub fn accept_block(&self, block: Block) -> bool {
        let mut st = self.state.lock();
        if !st.recovering_blocks.remove(&block.id) {
            return false;
        }
        trace!(id = %block.id, "buffered recovered block");
        st.recovered_blocks.insert(block.id, block);
        true
    }

    /// The next block ready to apply on top of `head_id`, if buffered.
    pub fn next_applicable(&self, head_id: u64) -> Option<Block> {
        self.state.lock().recovered_blocks.remove(&(head_id + 1))
    }

    /// A buffered block failed validation: forget it so the next refresh
    /// requests it again.
    pub fn drop_and_rerequest(&self, id: u64) {
        let mut st = self.state.lock();
        st.recovered_blocks.remove(&id);
        st.recovering_blocks.remove(&id);
        warn!(%id, "recovered block failed validation, will re-request");
    }

    /// After too many stalled rounds, rotate which peer gets our queries.
    pub fn should_rotate_peers(&self) -> bool {
        let mut st = self.state.lock();
        if st.recover_attempt >= self.params.run.max_recover_attempts {
            st.recover_attempt = 0;
            st.recovering_blocks.clear();
            true
        } else {
            false
        }
    }

    /// Round-robin peer choice for the next query batch.
    pub fn pick_peer(&self, peers: &[PeerId]) -> Option<PeerId> {
        if peers.is_empty() {
            return None;
        }
        let mut st = self.state.lock();
        let peer = peers[st.peer_cursor % peers.len()];
        st.peer_cursor = st.peer_cursor.wrapping_add(1);
        Some(peer)
    }
}
