//! Multi-round vote collection over candidate blocks.
//!
//! A block id may carry several competing candidates when chain tips
//! race.  Witnesses vote by signing a candidate's hash; a candidate
//! commits once strictly more than 2W/3 distinct active witnesses have
//! approved it within its round window.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::*;

use mirach_primitives::block::Block;
use mirach_primitives::buf::Buf32;
use mirach_primitives::crypto;
use mirach_primitives::params::Params;

use crate::schedule::Schedule;

/// A witness's approval of one candidate, as it travels the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockConf {
    pub id: u64,
    pub hash: String,
    pub round: u32,
    pub witness: String,
    pub signature: String,
}

struct Candidate {
    block: Block,
    /// One vote per witness per round.
    votes: HashSet<(String, u32)>,
}

impl Candidate {
    fn distinct_witnesses(&self) -> usize {
        self.votes
            .iter()
            .map(|(w, _)| w.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

struct PossBlock {
    round: u32,
    candidates: Vec<Candidate>,
}

pub struct Finalizer {
    params: Arc<Params>,
    poss_blocks: Mutex<HashMap<u64, PossBlock>>,
}

impl Finalizer {
    pub fn new(params: Arc<Params>) -> Self {
        Self {
            params,
            poss_blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a candidate block, counting the producer's signature as
    /// its round-0 vote.  Returns false for a duplicate candidate.
    pub fn insert_proposal(&self, block: Block) -> bool {
        let Some(hash) = block.hash.clone() else {
            return false;
        };
        let mut poss = self.poss_blocks.lock();
        let entry = poss.entry(block.id).or_insert(PossBlock {
            round: 0,
            candidates: Vec::new(),
        });
        if entry
            .candidates
            .iter()
            .any(|c| c.block.hash.as_ref() == Some(&hash))
        {
            return false;
        }
        let mut votes = HashSet::new();
        votes.insert((block.witness.clone(), 0));
        trace!(id = %block.id, %hash, "tracking candidate block");
        entry.candidates.push(Candidate { block, votes });
        true
    }

    /// Records a vote after checking the witness is scheduled and the
    /// signature covers the candidate hash.  Votes for unknown candidates
    /// or spent rounds are dropped.
    pub fn record_vote(&self, conf: &BlockConf, schedule: &Schedule) -> bool {
        if conf.round >= self.params.chain.consensus_rounds {
            return false;
        }
        let Some(witness) = schedule.get(&conf.witness) else {
            debug!(witness = %conf.witness, "vote from unscheduled witness");
            return false;
        };
        let Ok(digest) = conf.hash.parse::<Buf32>() else {
            return false;
        };
        if crypto::verify_hash_sig(&digest, &conf.signature, &witness.pub_key).is_err() {
            debug!(witness = %conf.witness, id = %conf.id, "bad vote signature");
            return false;
        }

        let mut poss = self.poss_blocks.lock();
        let Some(entry) = poss.get_mut(&conf.id) else {
            return false;
        };
        let Some(candidate) = entry
            .candidates
            .iter_mut()
            .find(|c| c.block.hash.as_ref() == Some(&conf.hash))
        else {
            return false;
        };
        candidate.votes.insert((conf.witness.clone(), conf.round))
    }

    /// Builds this node's signed vote for a candidate.
    pub fn make_conf(block: &Block, witness: &str, sk: &SecretKey, round: u32) -> Option<BlockConf> {
        let hash = block.hash.clone()?;
        let digest: Buf32 = hash.parse().ok()?;
        Some(BlockConf {
            id: block.id,
            hash,
            round,
            witness: witness.to_owned(),
            signature: crypto::sign_hash(&digest, sk),
        })
    }

    /// The candidate for `id` that has passed the >2W/3 distinct-witness
    /// bar, if any.
    pub fn commitable(&self, id: u64, total_witnesses: usize) -> Option<Block> {
        let need = 2 * total_witnesses / 3;
        let poss = self.poss_blocks.lock();
        let entry = poss.get(&id)?;
        entry
            .candidates
            .iter()
            .find(|c| c.distinct_witnesses() > need)
            .map(|c| c.block.clone())
    }

    /// Current vote round for an id, if tracked.
    pub fn round_of(&self, id: u64) -> Option<u32> {
        self.poss_blocks.lock().get(&id).map(|e| e.round)
    }

    /// Advances every open entry one round, dropping ids whose window is
    /// spent.
    pub fn tick_rounds(&self) {
        let rounds = self.params.chain.consensus_rounds;
        let mut poss = self.poss_blocks.lock();
        poss.retain(|id, entry| {
            entry.round += 1;
            if entry.round >= rounds {
                warn!(%id, "consensus window expired without commit");
                false
            } else {
                true
            }
        });
    }

    /// Drops every tracked id at or below a committed head.
    pub fn prune_through(&self, id: u64) {
        self.poss_blocks.lock().retain(|k, _| *k > id);
    }

    /// Candidate blocks tracked for an id, for recovery queries.
    pub fn candidates_for(&self, id: u64) -> Vec<Block> {
        self.poss_blocks
            .lock()
            .get(&id)
            .map(|e| e.candidates.iter().map(|c| c.block.clone()).collect())
            .unwrap_or_default()
    }
}
