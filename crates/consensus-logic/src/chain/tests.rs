use mirach_db::MemDocStore;
use mirach_primitives::crypto::{pubkey_for, pubkey_to_b58};
use mirach_primitives::params::Params;
use mirach_state::collections::ACCOUNTS;
use secp256k1::SecretKey;

use super::*;
use crate::schedule::{Schedule, WitnessEntry};

fn witness_key() -> SecretKey {
    SecretKey::from_slice(&[3u8; 32]).unwrap()
}

fn witness_schedule() -> Schedule {
    Schedule {
        epoch: 0,
        slots: vec![WitnessEntry {
            name: "alice".to_owned(),
            pub_key: pubkey_to_b58(&pubkey_for(&witness_key())),
            weight: 1,
        }],
    }
}

async fn test_chain() -> Chain {
    let store = Arc::new(MemDocStore::new());
    store
        .insert_one(ACCOUNTS, "alice", json!({"name": "alice", "balance": "0"}))
        .await
        .unwrap();
    let cache = Arc::new(StateCache::new(store.clone()));
    let chain = Chain::new(
        Arc::new(Params::default()),
        cache,
        Arc::new(TxExecutor::with_builtin_handlers()),
        BlockBackend::docs(store, -1),
        AncillaryWrites::default(),
    );
    chain.bootstrap().await.unwrap();
    chain
}

fn next_block(chain: &Chain, sealkey: &SecretKey) -> Block {
    let head = chain.head();
    let params = chain.params().clone();
    let mut b = Block {
        id: head.id + 1,
        phash: head.hash.clone().unwrap(),
        timestamp: head.timestamp + params.chain.block_time_ms,
        steem_block: head.steem_block + 1,
        steem_ts: head.steem_ts + 3000,
        txs: vec![],
        witness: "alice".to_owned(),
        missed_by: None,
        dist: params.chain.witness_reward,
        sync: false,
        hash: None,
        signature: None,
    };
    b.seal(sealkey);
    b
}

#[tokio::test]
async fn test_bootstrap_creates_genesis_once() {
    let chain = test_chain().await;
    assert_eq!(chain.head_id(), 0);
    let g = chain.backend().read(0).await.unwrap().unwrap();
    assert!(g.verify_hash());
}

#[tokio::test]
async fn test_commit_advances_head_and_credits_reward() {
    let chain = test_chain().await;
    let b = next_block(&chain, &witness_key());

    chain.validate_block(&b, &witness_schedule(), 0).unwrap();
    chain.commit_block(&b).await.unwrap();

    assert_eq!(chain.head_id(), 1);
    assert_eq!(chain.cache().head_block(), 1);
    let alice = chain
        .cache()
        .find_one(ACCOUNTS, "alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alice["balance"], "100");
}

#[tokio::test]
async fn test_commit_rejects_dist_mismatch() {
    let chain = test_chain().await;
    let head_before = chain.head();
    let mut b = next_block(&chain, &witness_key());
    b.dist = Amount::new(12345);
    b.seal(&witness_key());

    assert!(chain.commit_block(&b).await.is_err());
    assert_eq!(chain.head(), head_before);
    // Rolled back: no reward credited.
    let alice = chain
        .cache()
        .find_one(ACCOUNTS, "alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alice["balance"], "0");
}

#[tokio::test]
async fn test_validate_rejects_early_and_foreign_blocks() {
    let chain = test_chain().await;
    let sched = witness_schedule();

    let mut early = next_block(&chain, &witness_key());
    early.timestamp -= 1000;
    early.seal(&witness_key());
    assert!(matches!(
        chain.validate_block(&early, &sched, 0),
        Err(ChainError::BlockTooEarly { .. })
    ));

    let mut foreign = next_block(&chain, &witness_key());
    foreign.witness = "mallory".to_owned();
    foreign.seal(&witness_key());
    assert!(matches!(
        chain.validate_block(&foreign, &sched, 0),
        Err(ChainError::UnauthorizedWitness(..))
    ));

    let mut anchor = next_block(&chain, &witness_key());
    anchor.steem_block += 5;
    anchor.seal(&witness_key());
    assert!(matches!(
        chain.validate_block(&anchor, &sched, 0),
        Err(ChainError::BadAnchor(..))
    ));

    let mut tampered = next_block(&chain, &witness_key());
    tampered.seal(&witness_key());
    tampered.timestamp += 1;
    assert!(matches!(
        chain.validate_block(&tampered, &sched, 0),
        Err(ChainError::InvalidHash(_))
    ));
}

#[tokio::test]
async fn test_classify_incoming_fork_rules() {
    let chain = test_chain().await;
    let b1 = next_block(&chain, &witness_key());
    chain.commit_block(&b1).await.unwrap();
    let b2 = next_block(&chain, &witness_key());
    chain.commit_block(&b2).await.unwrap();

    // Extends the head.
    let b3 = next_block(&chain, &witness_key());
    assert_eq!(chain.classify_incoming(&b3), IncomingKind::ExtendsHead);

    // A competing tip forking off b1 (a recent non-head block).
    let mut alt = next_block(&chain, &witness_key());
    alt.id = 2;
    alt.phash = b1.hash.clone().unwrap();
    alt.seal(&witness_key());
    assert_eq!(chain.classify_incoming(&alt), IncomingKind::Alternative);

    // Unknown parent.
    let mut stranger = next_block(&chain, &witness_key());
    stranger.phash = "ab".repeat(32);
    stranger.seal(&witness_key());
    assert_eq!(chain.classify_incoming(&stranger), IncomingKind::Unknown);
}

#[tokio::test]
async fn test_speculative_execution_filters_failures() {
    use mirach_primitives::tx::{Transaction, TxType};

    let chain = test_chain().await;
    let head = chain.head();
    let good = Transaction {
        ty: TxType::TokenTransfer,
        data: json!({"to": "bob", "amount": "0"}),
        sender: "alice".to_owned(),
        ts: head.timestamp,
        reference: "1:0".to_owned(),
        hash: "t1".to_owned(),
    };
    // Zero transfers are invalid, so this one fails validation.
    let mut b = next_block(&chain, &witness_key());
    b.txs = vec![good];

    let (valid, dist) = chain.execute_block_transactions(&b, true).await.unwrap();
    chain.cache().rollback();
    assert!(valid.is_empty());
    assert_eq!(dist, chain.params().chain.witness_reward);
}
