use async_trait::async_trait;
use mirach_db::{DocStore, MemDocStore};
use mirach_primitives::amount::Amount;
use mirach_steemio::rpc::types::{DynamicGlobalProps, SteemTx};
use mirach_steemio::ClientError;
use parking_lot::Mutex as PMutex;
use serde_json::json;

use super::*;

struct MockSteem {
    blocks: PMutex<std::collections::HashMap<u64, SteemBlock>>,
    fail: bool,
}

impl MockSteem {
    fn new() -> Self {
        Self {
            blocks: PMutex::new(Default::default()),
            fail: false,
        }
    }

    fn with_block(self, height: u64, block: SteemBlock) -> Self {
        self.blocks.lock().insert(height, block);
        self
    }
}

#[async_trait]
impl SteemClient for MockSteem {
    async fn get_dynamic_global_properties(&self) -> Result<DynamicGlobalProps, ClientError> {
        if self.fail {
            return Err(ClientError::EmptyResponse);
        }
        Ok(DynamicGlobalProps {
            head_block_number: self.blocks.lock().keys().max().copied().unwrap_or(0),
        })
    }

    async fn get_block(&self, height: u64) -> Result<Option<SteemBlock>, ClientError> {
        if self.fail {
            return Err(ClientError::EmptyResponse);
        }
        Ok(self.blocks.lock().get(&height).cloned())
    }
}

fn sidechain_block(contract: &str, payload: serde_json::Value, sender: &str) -> SteemBlock {
    SteemBlock {
        timestamp: "2024-05-01T12:00:00".to_owned(),
        transactions: vec![SteemTx {
            operations: vec![(
                "custom_json".to_owned(),
                json!({
                    "id": "mirach",
                    "json": json!({"contract": contract, "payload": payload}).to_string(),
                    "required_auths": [sender],
                }),
            )],
            transaction_id: format!("tx-{contract}"),
        }],
    }
}

async fn processor_with(client: MockSteem, start: u64) -> BlockProcessor<MockSteem> {
    let store = Arc::new(MemDocStore::new());
    store
        .insert_one(
            "accounts",
            "alice",
            json!({"name": "alice", "balance": "100"}),
        )
        .await
        .unwrap();
    let cache = Arc::new(StateCache::new(store));
    BlockProcessor::new(
        Arc::new(SteemClientPool::new(vec![client])),
        Arc::new(Params::default()),
        cache,
        Arc::new(TxExecutor::with_builtin_handlers()),
        start,
    )
}

#[tokio::test]
async fn test_process_only_next_height() {
    let client = MockSteem::new()
        .with_block(11, sidechain_block("transfer_token", json!({"to": "b", "amount": "1"}), "alice"));
    let proc = processor_with(client, 10).await;

    // Not the next height: both refuse without touching the upstream.
    assert!(proc.process_upstream(10).await.unwrap().is_none());
    assert!(proc.process_upstream(12).await.unwrap().is_none());

    let out = proc.process_upstream(11).await.unwrap().unwrap();
    assert_eq!(out.height, 11);
    assert_eq!(out.txs.len(), 1);
    assert_eq!(out.txs[0].reference, "11:0");
    assert_eq!(proc.last_processed(), 11);

    // Bound set is retained for validation.
    assert!(proc.bound_txs(11).is_some());
}

#[tokio::test]
async fn test_invalid_candidates_filtered() {
    // bob has no balance, so his transfer fails validation.
    let client = MockSteem::new()
        .with_block(11, sidechain_block("transfer_token", json!({"to": "c", "amount": "5"}), "bob"));
    let proc = processor_with(client, 10).await;

    let out = proc.process_upstream(11).await.unwrap().unwrap();
    assert!(out.txs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_consecutive_failures() {
    let mut client = MockSteem::new();
    client.fail = true;
    let proc = processor_with(client, 10).await;

    let threshold = proc.params.run.circuit_breaker_threshold;
    for _ in 0..threshold {
        assert!(proc.process_upstream(11).await.is_err());
    }
    assert!(proc.breaker_open());
    assert_eq!(proc.last_processed(), 10);
}

#[tokio::test]
async fn test_validate_block_against_upstream() {
    let client = MockSteem::new()
        .with_block(11, sidechain_block("transfer_token", json!({"to": "b", "amount": "1"}), "alice"));
    let proc = processor_with(client, 10).await;
    let out = proc.process_upstream(11).await.unwrap().unwrap();

    let mut block = Block {
        id: 1,
        phash: String::new(),
        timestamp: out.timestamp_ms,
        steem_block: 11,
        steem_ts: out.timestamp_ms,
        txs: out.txs.clone(),
        witness: "alice".to_owned(),
        missed_by: None,
        dist: Amount::ZERO,
        sync: false,
        hash: None,
        signature: None,
    };
    assert!(proc.validate_block_against_upstream(&block).await.unwrap());

    // Dropping a bound tx breaks the exact-set equality.
    block.txs.clear();
    assert!(!proc.validate_block_against_upstream(&block).await.unwrap());
}

#[tokio::test]
async fn test_prefetch_fills_cache() {
    let client = MockSteem::new()
        .with_block(11, sidechain_block("transfer_token", json!({"to": "b", "amount": "1"}), "alice"))
        .with_block(12, sidechain_block("transfer_token", json!({"to": "b", "amount": "2"}), "alice"));
    let proc = processor_with(client, 10).await;

    proc.prefetch_blocks(11, true).await.unwrap();
    assert!(proc.prefetched.lock().contains(&11));
    assert!(proc.prefetched.lock().contains(&12));
}
