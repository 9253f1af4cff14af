//! Upstream (steem) chain I/O: the JSON-RPC client pool with endpoint
//! failover, and the parser that extracts sidechain operations out of
//! upstream blocks.

pub mod errors;
pub mod parser;
pub mod rpc;

pub use errors::ClientError;
pub use parser::{parse_block, ParsedBlock};
pub use rpc::pool::SteemClientPool;
pub use rpc::traits::SteemClient;
pub use rpc::types::{DynamicGlobalProps, SteemBlock, SteemTx};
