//! Wire types for the two upstream RPC calls we use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Deserialize)]
pub struct DynamicGlobalProps {
    pub head_block_number: u64,
}

/// An upstream block as returned by `condenser_api.get_block`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SteemBlock {
    /// ISO-8601 timestamp, UTC, no zone suffix.
    pub timestamp: String,

    #[serde(default)]
    pub transactions: Vec<SteemTx>,
}

/// One upstream transaction: a list of `[op_name, op_body]` pairs plus the
/// transaction id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SteemTx {
    #[serde(default)]
    pub operations: Vec<(String, Value)>,

    pub transaction_id: String,
}

/// Body of a `custom_json` operation.
#[derive(Clone, Debug, Deserialize)]
pub struct CustomJsonOp {
    pub id: String,

    /// The payload, itself JSON-encoded as a string.
    pub json: String,

    #[serde(default)]
    pub required_auths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_operations_tuple_shape() {
        let raw = json!({
            "timestamp": "2024-05-01T12:00:00",
            "transactions": [
                {
                    "operations": [["transfer", {"from": "a", "to": "b"}]],
                    "transaction_id": "abc123"
                }
            ]
        });
        let block: SteemBlock = serde_json::from_value(raw).unwrap();
        assert_eq!(block.transactions[0].operations[0].0, "transfer");
        assert_eq!(block.transactions[0].transaction_id, "abc123");
    }
}
