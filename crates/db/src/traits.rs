//! Trait definitions for the document store backing the state cache.

use async_trait::async_trait;

use crate::errors::DbResult;
use crate::types::{BulkOp, Document, FindOptions};

/// Collection-oriented document store.  Per-document operations are
/// atomic; `bulk_write` is unordered but must apply its batch atomically
/// with respect to crashes, which is what makes the cache flush safe.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Looks up a doc by primary key.
    async fn find_one(&self, collection: &str, key: &str) -> DbResult<Option<Document>>;

    /// Scans a collection, applying sort and limit.
    async fn find(&self, collection: &str, opts: FindOptions) -> DbResult<Vec<Document>>;

    /// Inserts a doc; errors on duplicate key.
    async fn insert_one(&self, collection: &str, key: &str, doc: Document) -> DbResult<()>;

    /// Replaces (or creates) a doc wholesale.
    async fn replace_one(&self, collection: &str, key: &str, doc: Document) -> DbResult<()>;

    /// Deletes a doc; returns whether it existed.
    async fn delete_one(&self, collection: &str, key: &str) -> DbResult<bool>;

    /// Applies a batch of writes atomically.  `Update` entries replay their
    /// operator doc against the stored doc, creating it when absent
    /// (upsert).
    async fn bulk_write(&self, ops: Vec<BulkOp>) -> DbResult<()>;

    async fn drop_collection(&self, collection: &str) -> DbResult<()>;

    /// Wipes everything.  Only used on explicit rebuild.
    async fn drop_database(&self) -> DbResult<()>;
}
