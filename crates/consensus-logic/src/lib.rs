//! Consensus logic for the sidechain: the chain commit path, upstream
//! block processing, the sync-mode state machine, the vote-based
//! finalizer, the witness schedule, and the mempool.

pub mod chain;
pub mod consensus;
pub mod errors;
pub mod genesis;
pub mod mempool;
pub mod processor;
pub mod schedule;
pub mod sync;

pub use chain::Chain;
pub use consensus::Finalizer;
pub use errors::ChainError;
pub use mempool::Mempool;
pub use processor::BlockProcessor;
pub use sync::{SyncManager, SyncMode};
