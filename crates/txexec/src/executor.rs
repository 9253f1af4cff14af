use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mirach_primitives::amount::Amount;
use mirach_primitives::tx::{Transaction, TxType};
use mirach_state::StateCache;
use tracing::*;

use crate::errors::TxResult;
use crate::handlers;

/// Handler for one transaction type.
#[async_trait]
pub trait TxHandler: Send + Sync {
    /// Cheap structural checks against current state; run when a candidate
    /// enters the mempool and again before execution.
    async fn validate(&self, tx: &Transaction, ts: u64, cache: &StateCache) -> TxResult<()>;

    /// Applies the tx through the cache.  Returns the amount this tx
    /// distributed, which accumulates into the block's `dist`.
    async fn execute(&self, tx: &Transaction, ts: u64, cache: &StateCache) -> TxResult<Amount>;
}

/// Type-to-handler registry.
pub struct TxExecutor {
    handlers: HashMap<TxType, Arc<dyn TxHandler>>,
}

impl TxExecutor {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The registry with the built-in witness and token handlers.
    pub fn with_builtin_handlers() -> Self {
        let mut ex = Self::new();
        ex.register(TxType::WitnessRegister, Arc::new(handlers::WitnessRegister));
        ex.register(TxType::WitnessVote, Arc::new(handlers::WitnessVote));
        ex.register(TxType::WitnessUnvote, Arc::new(handlers::WitnessUnvote));
        ex.register(TxType::TokenCreate, Arc::new(handlers::TokenCreate));
        ex.register(TxType::TokenMint, Arc::new(handlers::TokenMint));
        ex.register(TxType::TokenTransfer, Arc::new(handlers::TokenTransfer));
        ex
    }

    pub fn register(&mut self, ty: TxType, handler: Arc<dyn TxHandler>) {
        self.handlers.insert(ty, handler);
    }

    pub async fn validate(&self, tx: &Transaction, ts: u64, cache: &StateCache) -> TxResult<()> {
        match self.handlers.get(&tx.ty) {
            Some(h) => h.validate(tx, ts, cache).await,
            None => Ok(()),
        }
    }

    pub async fn execute(&self, tx: &Transaction, ts: u64, cache: &StateCache) -> TxResult<Amount> {
        match self.handlers.get(&tx.ty) {
            Some(h) => h.execute(tx, ts, cache).await,
            None => {
                // No handler registered: accepted as a no-op so nodes with
                // and without optional modules stay in consensus.
                debug!(ty = ?tx.ty, r = %tx.reference, "no handler, tx is a no-op");
                Ok(Amount::ZERO)
            }
        }
    }
}

impl Default for TxExecutor {
    fn default() -> Self {
        Self::with_builtin_handlers()
    }
}
