//! Built-in handlers: witness registration/votes and token basics.

use async_trait::async_trait;
use mirach_primitives::amount::{amount_from_value, Amount};
use mirach_primitives::crypto;
use mirach_primitives::tx::Transaction;
use mirach_state::collections::{ACCOUNTS, TOKENS};
use mirach_state::StateCache;
use serde_json::{json, Value};

use crate::errors::{TxError, TxResult};
use crate::executor::TxHandler;

fn data_str<'a>(tx: &'a Transaction, field: &str) -> TxResult<&'a str> {
    tx.data
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| TxError::Invalid(format!("missing field '{field}'")))
}

fn data_amount(tx: &Transaction, field: &str) -> TxResult<Amount> {
    let v = tx
        .data
        .get(field)
        .ok_or_else(|| TxError::Invalid(format!("missing field '{field}'")))?;
    amount_from_value(v).map_err(|e| TxError::Invalid(e.to_string()))
}

async fn require_account(cache: &StateCache, name: &str) -> TxResult<Value> {
    cache
        .find_one(ACCOUNTS, name)
        .await?
        .ok_or_else(|| TxError::UnknownAccount(name.to_owned()))
}

/// Balance of the native coin or of `tokens.{symbol}`; absent reads as 0.
fn balance_of(account: &Value, token: Option<&str>) -> TxResult<Amount> {
    let v = match token {
        None => account.get("balance"),
        Some(sym) => account.get("tokens").and_then(|t| t.get(sym)),
    };
    match v {
        None => Ok(Amount::ZERO),
        Some(v) => amount_from_value(v).map_err(|e| TxError::Invalid(e.to_string())),
    }
}

fn balance_path(token: Option<&str>) -> String {
    match token {
        None => "balance".to_owned(),
        Some(sym) => format!("tokens.{sym}"),
    }
}

pub struct WitnessRegister;

#[async_trait]
impl TxHandler for WitnessRegister {
    async fn validate(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<()> {
        let pub_b58 = data_str(tx, "pub")?;
        crypto::pubkey_from_b58(pub_b58)
            .map_err(|_| TxError::Invalid("bad witness pubkey".to_owned()))?;
        require_account(cache, &tx.sender).await?;
        Ok(())
    }

    async fn execute(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<Amount> {
        let pub_b58 = data_str(tx, "pub")?;
        let mut set = json!({"witness_pub": pub_b58});
        if let Some(ws) = tx.data.get("ws").and_then(Value::as_str) {
            set["witness_ws"] = Value::from(ws);
        }
        cache
            .update_one(ACCOUNTS, &tx.sender, &json!({"$set": set}))
            .await?;
        Ok(Amount::ZERO)
    }
}

pub struct WitnessVote;

#[async_trait]
impl TxHandler for WitnessVote {
    async fn validate(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<()> {
        let target = data_str(tx, "target")?;
        let sender = require_account(cache, &tx.sender).await?;
        let target_doc = require_account(cache, target).await?;
        if target_doc.get("witness_pub").map_or(true, Value::is_null) {
            return Err(TxError::Invalid(format!("'{target}' is not a witness")));
        }
        let already = sender
            .get("approves")
            .and_then(Value::as_array)
            .map(|a| a.iter().any(|v| v.as_str() == Some(target)))
            .unwrap_or(false);
        if already {
            return Err(TxError::Invalid(format!("already voting for '{target}'")));
        }
        Ok(())
    }

    async fn execute(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<Amount> {
        let target = data_str(tx, "target")?;
        cache
            .update_one(ACCOUNTS, &tx.sender, &json!({"$push": {"approves": target}}))
            .await?;
        cache
            .update_one(ACCOUNTS, target, &json!({"$inc": {"node_appr": 1}}))
            .await?;
        Ok(Amount::ZERO)
    }
}

pub struct WitnessUnvote;

#[async_trait]
impl TxHandler for WitnessUnvote {
    async fn validate(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<()> {
        let target = data_str(tx, "target")?;
        let sender = require_account(cache, &tx.sender).await?;
        let voting = sender
            .get("approves")
            .and_then(Value::as_array)
            .map(|a| a.iter().any(|v| v.as_str() == Some(target)))
            .unwrap_or(false);
        if !voting {
            return Err(TxError::Invalid(format!("not voting for '{target}'")));
        }
        Ok(())
    }

    async fn execute(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<Amount> {
        let target = data_str(tx, "target")?;
        cache
            .update_one(ACCOUNTS, &tx.sender, &json!({"$pull": {"approves": target}}))
            .await?;
        cache
            .update_one(ACCOUNTS, target, &json!({"$inc": {"node_appr": -1}}))
            .await?;
        Ok(Amount::ZERO)
    }
}

pub struct TokenCreate;

#[async_trait]
impl TxHandler for TokenCreate {
    async fn validate(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<()> {
        let symbol = data_str(tx, "symbol")?;
        if symbol.is_empty()
            || symbol.len() > 8
            || !symbol.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(TxError::Invalid(format!("bad token symbol '{symbol}'")));
        }
        require_account(cache, &tx.sender).await?;
        if cache.find_one(TOKENS, symbol).await?.is_some() {
            return Err(TxError::Invalid(format!("token '{symbol}' exists")));
        }
        Ok(())
    }

    async fn execute(&self, tx: &Transaction, ts: u64, cache: &StateCache) -> TxResult<Amount> {
        let symbol = data_str(tx, "symbol")?;
        let inserted = cache
            .insert_one(
                TOKENS,
                json!({
                    "_id": symbol,
                    "creator": tx.sender,
                    "supply": "0",
                    "created": ts,
                }),
            )
            .await?;
        if !inserted {
            return Err(TxError::Invalid(format!("token '{symbol}' exists")));
        }
        Ok(Amount::ZERO)
    }
}

pub struct TokenMint;

#[async_trait]
impl TxHandler for TokenMint {
    async fn validate(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<()> {
        let symbol = data_str(tx, "symbol")?;
        let amount = data_amount(tx, "amount")?;
        if amount.is_zero() {
            return Err(TxError::Invalid("mint of zero".to_owned()));
        }
        let token = cache
            .find_one(TOKENS, symbol)
            .await?
            .ok_or_else(|| TxError::Invalid(format!("unknown token '{symbol}'")))?;
        if token.get("creator").and_then(Value::as_str) != Some(tx.sender.as_str()) {
            return Err(TxError::Invalid("only the creator can mint".to_owned()));
        }
        require_account(cache, data_str(tx, "to")?).await?;
        Ok(())
    }

    async fn execute(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<Amount> {
        let symbol = data_str(tx, "symbol")?;
        let amount = data_amount(tx, "amount")?;
        let to = data_str(tx, "to")?;
        cache
            .update_one(
                TOKENS,
                symbol,
                &json!({"$inc": {"supply": amount.to_string()}}),
            )
            .await?;
        cache
            .update_one(
                ACCOUNTS,
                to,
                &json!({"$inc": {(balance_path(Some(symbol))): amount.to_string()}}),
            )
            .await?;
        Ok(Amount::ZERO)
    }
}

pub struct TokenTransfer;

#[async_trait]
impl TxHandler for TokenTransfer {
    async fn validate(&self, tx: &Transaction, _ts: u64, cache: &StateCache) -> TxResult<()> {
        let to = data_str(tx, "to")?;
        let amount = data_amount(tx, "amount")?;
        if amount.is_zero() {
            return Err(TxError::Invalid("transfer of zero".to_owned()));
        }
        if to == tx.sender {
            return Err(TxError::Invalid("transfer to self".to_owned()));
        }
        let token = tx.data.get("token").and_then(Value::as_str);
        let sender = require_account(cache, &tx.sender).await?;
        if balance_of(&sender, token)? < amount {
            return Err(TxError::InsufficientBalance(tx.sender.clone()));
        }
        Ok(())
    }

    async fn execute(&self, tx: &Transaction, ts: u64, cache: &StateCache) -> TxResult<Amount> {
        let to = data_str(tx, "to")?;
        let amount = data_amount(tx, "amount")?;
        let token = tx.data.get("token").and_then(Value::as_str);
        let path = balance_path(token);

        let sender = require_account(cache, &tx.sender).await?;
        let bal = balance_of(&sender, token)?;
        let left = bal
            .checked_sub(amount)
            .ok_or_else(|| TxError::InsufficientBalance(tx.sender.clone()))?;

        // Debit with an exact $set (negative string increments don't
        // exist), credit with a positive $inc.
        cache
            .update_one(
                ACCOUNTS,
                &tx.sender,
                &json!({"$set": {(path.clone()): left.to_string()}}),
            )
            .await?;

        // Receiving accounts come into existence on first transfer.
        if cache.find_one(ACCOUNTS, to).await?.is_none() {
            cache
                .insert_one(
                    ACCOUNTS,
                    json!({"name": to, "balance": "0", "created": ts}),
                )
                .await?;
        }
        cache
            .update_one(ACCOUNTS, to, &json!({"$inc": {(path): amount.to_string()}}))
            .await?;
        Ok(Amount::ZERO)
    }
}
