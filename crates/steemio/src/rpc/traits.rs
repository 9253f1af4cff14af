use async_trait::async_trait;

use crate::errors::ClientError;
use crate::rpc::types::{DynamicGlobalProps, SteemBlock};

/// The two upstream RPC operations the node depends on.
#[async_trait]
pub trait SteemClient: Send + Sync {
    async fn get_dynamic_global_properties(&self) -> Result<DynamicGlobalProps, ClientError>;

    /// Fetches a block; `None` when the height doesn't exist yet.
    async fn get_block(&self, height: u64) -> Result<Option<SteemBlock>, ClientError>;
}
