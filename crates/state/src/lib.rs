//! In-memory write-through state over the document store.
//!
//! All state reads and writes inside the block pipeline go through
//! [`StateCache`]: mutations hit the live in-memory collections
//! immediately and accumulate in per-block logs, which either flush to the
//! document store as one batch (`write_to_disk`) or unwind (`rollback`)
//! when a block aborts.

pub mod cache;
pub mod collections;
pub mod writer;

pub use cache::StateCache;
pub use writer::{start_writer_task, WriterHandle};
