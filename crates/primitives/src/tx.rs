//! Sidechain transaction types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::ParseError;

/// Transaction kind, serialized as its integer code.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum TxType {
    TokenCreate = 1,
    TokenMint = 2,
    TokenTransfer = 3,
    NftCollectionCreate = 10,
    NftMint = 11,
    NftTransfer = 12,
    MarketCreatePair = 20,
    MarketPlaceOrder = 21,
    PoolCreate = 30,
    PoolStake = 31,
    PoolUnstake = 32,
    FarmCreate = 40,
    FarmStake = 41,
    FarmUnstake = 42,
    FarmClaim = 43,
    WitnessRegister = 50,
    WitnessVote = 51,
    WitnessUnvote = 52,
}

impl TxType {
    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn from_code(code: u32) -> Result<Self, ParseError> {
        use TxType::*;
        let ty = match code {
            1 => TokenCreate,
            2 => TokenMint,
            3 => TokenTransfer,
            10 => NftCollectionCreate,
            11 => NftMint,
            12 => NftTransfer,
            20 => MarketCreatePair,
            21 => MarketPlaceOrder,
            30 => PoolCreate,
            31 => PoolStake,
            32 => PoolUnstake,
            40 => FarmCreate,
            41 => FarmStake,
            42 => FarmUnstake,
            43 => FarmClaim,
            50 => WitnessRegister,
            51 => WitnessVote,
            52 => WitnessUnvote,
            other => return Err(ParseError::UnknownTxType(other)),
        };
        Ok(ty)
    }

    /// Resolves a contract string from an upstream operation.  Numeric
    /// strings naming a known code are accepted as well.
    pub fn from_contract(contract: &str) -> Result<Self, ParseError> {
        use TxType::*;
        let ty = match contract {
            "create_token" => TokenCreate,
            "mint_token" => TokenMint,
            "transfer_token" => TokenTransfer,
            "create_nft_collection" => NftCollectionCreate,
            "mint_nft" => NftMint,
            "transfer_nft" => NftTransfer,
            "create_trading_pair" => MarketCreatePair,
            "place_order" => MarketPlaceOrder,
            "create_pool" => PoolCreate,
            "stake" => PoolStake,
            "unstake" => PoolUnstake,
            "create_farm" => FarmCreate,
            "farm_stake" => FarmStake,
            "farm_unstake" => FarmUnstake,
            "farm_claim" => FarmClaim,
            "register_witness" => WitnessRegister,
            "vote_witness" => WitnessVote,
            "unvote_witness" => WitnessUnvote,
            other => {
                if let Ok(code) = other.parse::<u32>() {
                    return Self::from_code(code);
                }
                return Err(ParseError::UnknownContract(other.to_owned()));
            }
        };
        Ok(ty)
    }
}

impl Serialize for TxType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for TxType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        TxType::from_code(code).map_err(serde::de::Error::custom)
    }
}

/// A sidechain transaction extracted from an upstream operation.
///
/// `reference` pins the tx to its source operation as
/// `"{upstream_height}:{op_index}"`, and `hash` is the upstream transaction
/// id.  Several sidechain ops inside one upstream tx share the hash but
/// never the reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub ty: TxType,
    pub data: Value,
    pub sender: String,
    pub ts: u64,
    #[serde(rename = "ref")]
    pub reference: String,
    pub hash: String,
}

impl Transaction {
    /// The upstream height this tx was extracted from, parsed off the
    /// reference.
    pub fn ref_height(&self) -> Option<u64> {
        self.reference.split(':').next()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_contract_mapping() {
        assert_eq!(
            TxType::from_contract("transfer_token").unwrap(),
            TxType::TokenTransfer
        );
        // Integer form of a known variant is accepted.
        assert_eq!(TxType::from_contract("3").unwrap(), TxType::TokenTransfer);
        assert!(TxType::from_contract("bogus").is_err());
        assert!(TxType::from_contract("999").is_err());
    }

    #[test]
    fn test_tx_serde_field_names() {
        let tx = Transaction {
            ty: TxType::TokenTransfer,
            data: json!({"to": "b", "amount": "5"}),
            sender: "a".to_owned(),
            ts: 1000,
            reference: "42:2".to_owned(),
            hash: "deadbeef".to_owned(),
        };
        let v = serde_json::to_value(&tx).unwrap();
        assert_eq!(v["type"], 3);
        assert_eq!(v["ref"], "42:2");
        let back: Transaction = serde_json::from_value(v).unwrap();
        assert_eq!(back, tx);
        assert_eq!(back.ref_height(), Some(42));
    }
}
