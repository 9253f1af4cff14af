//! Extraction of sidechain transactions from upstream blocks.

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::*;

use mirach_primitives::tx::{Transaction, TxType};

use crate::rpc::types::{CustomJsonOp, SteemBlock};

#[derive(Clone, Debug)]
pub struct ParsedBlock {
    pub txs: Vec<Transaction>,
    /// Upstream block timestamp, ms since epoch.
    pub timestamp_ms: u64,
}

/// Walks every operation of every transaction in an upstream block and
/// returns the sidechain txs found, in operation order.
///
/// The op index in each tx's `ref` counts all operations of the block, not
/// just matching ones, so refs stay stable regardless of what else the
/// block carries.
pub fn parse_block(block: &SteemBlock, height: u64, chain_id: &str) -> ParsedBlock {
    let timestamp_ms = parse_timestamp_ms(&block.timestamp).unwrap_or_else(|| {
        warn!(%height, ts = %block.timestamp, "unparseable upstream timestamp");
        0
    });

    let mut txs = Vec::new();
    let mut op_index: u64 = 0;

    for steem_tx in &block.transactions {
        for (op_name, op_body) in &steem_tx.operations {
            let this_index = op_index;
            op_index += 1;

            if op_name != "custom_json" {
                continue;
            }
            let Ok(op) = serde_json::from_value::<CustomJsonOp>(op_body.clone()) else {
                debug!(%height, op = %this_index, "malformed custom_json body");
                continue;
            };
            if op.id != chain_id {
                continue;
            }
            if op.required_auths.is_empty() {
                debug!(%height, op = %this_index, "custom_json without active auths");
                continue;
            }
            let sender = op.required_auths[0].clone();

            let payload: Value = match serde_json::from_str(&op.json) {
                Ok(v) => v,
                Err(e) => {
                    debug!(%height, op = %this_index, err = %e, "unparseable payload json");
                    continue;
                }
            };
            let (Some(contract), Some(data)) = (
                payload.get("contract").and_then(Value::as_str),
                payload.get("payload").filter(|p| p.is_object()),
            ) else {
                debug!(%height, op = %this_index, "payload missing contract/payload");
                continue;
            };

            let ty = match TxType::from_contract(contract) {
                Ok(ty) => ty,
                Err(e) => {
                    debug!(%height, op = %this_index, err = %e, "dropping op");
                    continue;
                }
            };

            txs.push(Transaction {
                ty,
                data: data.clone(),
                sender,
                ts: timestamp_ms,
                reference: format!("{height}:{this_index}"),
                hash: steem_tx.transaction_id.clone(),
            });
        }
    }

    ParsedBlock { txs, timestamp_ms }
}

/// Upstream timestamps are ISO-8601 without a zone suffix, always UTC.
fn parse_timestamp_ms(ts: &str) -> Option<u64> {
    let naive = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S").ok()?;
    let ms = naive.and_utc().timestamp_millis();
    u64::try_from(ms).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::rpc::types::SteemTx;

    fn sidechain_op(contract: &str, payload: Value, auths: &[&str]) -> (String, Value) {
        (
            "custom_json".to_owned(),
            json!({
                "id": "sidechain",
                "json": json!({"contract": contract, "payload": payload}).to_string(),
                "required_auths": auths,
            }),
        )
    }

    #[test]
    fn test_picks_only_matching_custom_json() {
        let block = SteemBlock {
            timestamp: "2024-05-01T12:00:00".to_owned(),
            transactions: vec![
                SteemTx {
                    operations: vec![
                        ("transfer".to_owned(), json!({})),
                        (
                            "custom_json".to_owned(),
                            json!({"id": "other", "json": "{}", "required_auths": ["a"]}),
                        ),
                        sidechain_op("transfer_token", json!({"to": "b", "amount": "5"}), &["a"]),
                    ],
                    transaction_id: "tx1".to_owned(),
                },
                SteemTx {
                    operations: vec![sidechain_op("vote_witness", json!({"target": "w"}), &["c"])],
                    transaction_id: "tx2".to_owned(),
                },
            ],
        };

        let parsed = parse_block(&block, 42, "sidechain");
        assert_eq!(parsed.txs.len(), 2);

        // Op index counts every operation, not just matches.
        assert_eq!(parsed.txs[0].reference, "42:2");
        assert_eq!(parsed.txs[1].reference, "42:3");
        assert_eq!(parsed.txs[0].sender, "a");
        assert_eq!(parsed.txs[0].ty, TxType::TokenTransfer);
        assert_eq!(parsed.txs[0].hash, "tx1");
        assert_eq!(parsed.txs[1].hash, "tx2");

        // Refs are unique across the block.
        let mut refs: Vec<_> = parsed.txs.iter().map(|t| t.reference.clone()).collect();
        refs.dedup();
        assert_eq!(refs.len(), parsed.txs.len());
    }

    #[test]
    fn test_skips_empty_auths_and_bad_payloads() {
        let block = SteemBlock {
            timestamp: "2024-05-01T12:00:00".to_owned(),
            transactions: vec![SteemTx {
                operations: vec![
                    sidechain_op("transfer_token", json!({"to": "b"}), &[]),
                    (
                        "custom_json".to_owned(),
                        json!({"id": "sidechain", "json": "not json", "required_auths": ["a"]}),
                    ),
                    sidechain_op("no_such_contract", json!({}), &["a"]),
                ],
                transaction_id: "tx1".to_owned(),
            }],
        };
        let parsed = parse_block(&block, 7, "sidechain");
        assert!(parsed.txs.is_empty());
    }

    #[test]
    fn test_integer_contract_accepted() {
        let block = SteemBlock {
            timestamp: "2024-05-01T12:00:00".to_owned(),
            transactions: vec![SteemTx {
                operations: vec![sidechain_op("3", json!({"to": "b", "amount": "1"}), &["a"])],
                transaction_id: "tx1".to_owned(),
            }],
        };
        let parsed = parse_block(&block, 7, "sidechain");
        assert_eq!(parsed.txs[0].ty, TxType::TokenTransfer);
    }

    #[test]
    fn test_timestamp_parses_as_utc() {
        assert_eq!(
            parse_timestamp_ms("1970-01-01T00:00:01").unwrap(),
            1_000u64
        );
        assert!(parse_timestamp_ms("garbage").is_none());
    }
}
