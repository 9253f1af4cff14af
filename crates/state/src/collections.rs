//! The fixed set of state collections and their key rules.

use mirach_db::Document;

pub const ACCOUNTS: &str = "accounts";
pub const TOKENS: &str = "tokens";
pub const BLOCKS: &str = "blocks";
pub const STATE: &str = "state";
pub const NFT_COLLECTIONS: &str = "nftCollections";
pub const NFTS: &str = "nfts";
pub const TRADING_PAIRS: &str = "tradingPairs";
pub const ORDERS: &str = "orders";
pub const TRADES: &str = "trades";
pub const NFT_LISTINGS: &str = "nftListings";
pub const POOLS: &str = "pools";
pub const EVENTS: &str = "events";
pub const FARMS: &str = "farms";
pub const USER_FARM_POSITIONS: &str = "userFarmPositions";
pub const USER_LIQUIDITY_POSITIONS: &str = "userLiquidityPositions";
pub const LAUNCHPADS: &str = "launchpads";
pub const LIQUIDITY_POOLS: &str = "liquidityPools";

pub const ALL: &[&str] = &[
    ACCOUNTS,
    TOKENS,
    BLOCKS,
    STATE,
    NFT_COLLECTIONS,
    NFTS,
    TRADING_PAIRS,
    ORDERS,
    TRADES,
    NFT_LISTINGS,
    POOLS,
    EVENTS,
    FARMS,
    USER_FARM_POSITIONS,
    USER_LIQUIDITY_POSITIONS,
    LAUNCHPADS,
    LIQUIDITY_POOLS,
];

/// Accounts key on `name`, everything else on `_id`.
pub fn primary_key_field(collection: &str) -> &'static str {
    if collection == ACCOUNTS {
        "name"
    } else {
        "_id"
    }
}

/// Extracts the primary key of a doc as a string.  Numeric `_id`s (the
/// `state` cursor doc, block ids) stringify.
pub fn key_of(collection: &str, doc: &Document) -> Option<String> {
    match doc.get(primary_key_field(collection))? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_key_rules() {
        assert_eq!(primary_key_field(ACCOUNTS), "name");
        assert_eq!(primary_key_field(TOKENS), "_id");
        assert_eq!(
            key_of(ACCOUNTS, &json!({"name": "alice"})).as_deref(),
            Some("alice")
        );
        assert_eq!(key_of(STATE, &json!({"_id": 0})).as_deref(), Some("0"));
        assert_eq!(key_of(TOKENS, &json!({"no_id": 1})), None);
    }
}
