//! Genesis block construction and origin checks.

use mirach_primitives::amount::Amount;
use mirach_primitives::block::Block;
use mirach_primitives::params::ChainParams;

use crate::errors::ChainError;

/// Builds block 0 from chain params.  Genesis is unsigned; its hash alone
/// anchors the chain.
pub fn make_genesis(params: &ChainParams) -> Block {
    let mut b = Block {
        id: 0,
        phash: "0".repeat(64),
        timestamp: params.genesis_timestamp,
        steem_block: params.genesis_steem_block,
        steem_ts: params.genesis_timestamp,
        txs: vec![],
        witness: params.origin_witness.clone(),
        missed_by: None,
        dist: Amount::ZERO,
        sync: false,
        hash: None,
        signature: None,
    };
    b.hash = Some(b.compute_hash().to_hex());
    b
}

/// Fatal when a configured origin hash disagrees with the stored genesis.
pub fn check_origin(params: &ChainParams, genesis: &Block) -> Result<(), ChainError> {
    let Some(expected) = &params.origin_hash else {
        return Ok(());
    };
    let computed = genesis.hash.clone().unwrap_or_default();
    if &computed != expected {
        return Err(ChainError::GenesisMismatch {
            computed,
            expected: expected.clone(),
        });
    }
    Ok(())
}
