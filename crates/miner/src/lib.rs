//! Block production: slot scheduling, candidate assembly, speculative
//! execution, and signing.

mod slot;
mod worker;

pub use slot::{MinerError, SlotPlan, SlotPriority};
pub use worker::{miner_task, Miner};
