//! RocksDB-backed `DocStore`.
//!
//! Keys are `{collection}\x1f{primary_key}`, values are JSON bytes.  Bulk
//! writes stage read-modify-write results in memory and commit through a
//! single `WriteBatch`, which is what gives the cache flush its
//! all-or-nothing behavior.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde_json::Value;

use crate::errors::{DbError, DbResult};
use crate::traits::DocStore;
use crate::types::{apply_find_options, BulkOp, Document, FindOptions};
use crate::update::apply_update;

const SEP: u8 = 0x1f;

pub struct RocksDocStore {
    db: Arc<DB>,
}

impl RocksDocStore {
    pub fn open(path: &Path) -> DbResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn key(collection: &str, key: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(collection.len() + key.len() + 1);
        k.extend_from_slice(collection.as_bytes());
        k.push(SEP);
        k.extend_from_slice(key.as_bytes());
        k
    }

    fn prefix(collection: &str) -> Vec<u8> {
        let mut p = collection.as_bytes().to_vec();
        p.push(SEP);
        p
    }

    async fn run<T, F>(&self, f: F) -> DbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DB) -> DbResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| DbError::Io(std::io::Error::other(e)))?
    }

    fn get_doc(db: &DB, collection: &str, key: &str) -> DbResult<Option<Document>> {
        match db.get(Self::key(collection, key))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn scan(db: &DB, collection: &str) -> DbResult<Vec<Document>> {
        let prefix = Self::prefix(collection);
        let mut out = Vec::new();
        for item in db.iterator(IteratorMode::From(&prefix, Direction::Forward)) {
            let (k, v) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl DocStore for RocksDocStore {
    async fn find_one(&self, collection: &str, key: &str) -> DbResult<Option<Document>> {
        let (collection, key) = (collection.to_owned(), key.to_owned());
        self.run(move |db| Self::get_doc(db, &collection, &key)).await
    }

    async fn find(&self, collection: &str, opts: FindOptions) -> DbResult<Vec<Document>> {
        let collection = collection.to_owned();
        let docs = self.run(move |db| Self::scan(db, &collection)).await?;
        Ok(apply_find_options(docs, &opts))
    }

    async fn insert_one(&self, collection: &str, key: &str, doc: Document) -> DbResult<()> {
        let (collection, key) = (collection.to_owned(), key.to_owned());
        self.run(move |db| {
            if Self::get_doc(db, &collection, &key)?.is_some() {
                return Err(DbError::DuplicateKey(key, collection));
            }
            db.put(Self::key(&collection, &key), serde_json::to_vec(&doc)?)?;
            Ok(())
        })
        .await
    }

    async fn replace_one(&self, collection: &str, key: &str, doc: Document) -> DbResult<()> {
        let (collection, key) = (collection.to_owned(), key.to_owned());
        self.run(move |db| {
            db.put(Self::key(&collection, &key), serde_json::to_vec(&doc)?)?;
            Ok(())
        })
        .await
    }

    async fn delete_one(&self, collection: &str, key: &str) -> DbResult<bool> {
        let (collection, key) = (collection.to_owned(), key.to_owned());
        self.run(move |db| {
            let existed = Self::get_doc(db, &collection, &key)?.is_some();
            db.delete(Self::key(&collection, &key))?;
            Ok(existed)
        })
        .await
    }

    async fn bulk_write(&self, ops: Vec<BulkOp>) -> DbResult<()> {
        self.run(move |db| {
            let mut batch = WriteBatch::default();
            // Staged view so later ops in the batch observe earlier ones.
            let mut staged: std::collections::HashMap<Vec<u8>, Option<Document>> =
                std::collections::HashMap::new();

            for op in ops {
                match op {
                    BulkOp::Insert {
                        collection,
                        key,
                        doc,
                    } => {
                        let k = Self::key(&collection, &key);
                        let exists = match staged.get(&k) {
                            Some(v) => v.is_some(),
                            None => Self::get_doc(db, &collection, &key)?.is_some(),
                        };
                        if exists {
                            return Err(DbError::DuplicateKey(key, collection));
                        }
                        batch.put(&k, serde_json::to_vec(&doc)?);
                        staged.insert(k, Some(doc));
                    }
                    BulkOp::Update {
                        collection,
                        key,
                        ops,
                    } => {
                        let k = Self::key(&collection, &key);
                        let mut doc = match staged.get(&k) {
                            Some(v) => v.clone().unwrap_or(Value::Object(Default::default())),
                            None => Self::get_doc(db, &collection, &key)?
                                .unwrap_or(Value::Object(Default::default())),
                        };
                        apply_update(&mut doc, &ops)?;
                        batch.put(&k, serde_json::to_vec(&doc)?);
                        staged.insert(k, Some(doc));
                    }
                    BulkOp::Replace {
                        collection,
                        key,
                        doc,
                    } => {
                        let k = Self::key(&collection, &key);
                        batch.put(&k, serde_json::to_vec(&doc)?);
                        staged.insert(k, Some(doc));
                    }
                    BulkOp::Delete { collection, key } => {
                        let k = Self::key(&collection, &key);
                        batch.delete(&k);
                        staged.insert(k, None);
                    }
                }
            }

            db.write(batch)?;
            Ok(())
        })
        .await
    }

    async fn drop_collection(&self, collection: &str) -> DbResult<()> {
        let collection = collection.to_owned();
        self.run(move |db| {
            let prefix = Self::prefix(&collection);
            let mut batch = WriteBatch::default();
            for item in db.iterator(IteratorMode::From(&prefix, Direction::Forward)) {
                let (k, _) = item?;
                if !k.starts_with(&prefix) {
                    break;
                }
                batch.delete(k);
            }
            db.write(batch)?;
            Ok(())
        })
        .await
    }

    async fn drop_database(&self) -> DbResult<()> {
        self.run(move |db| {
            let mut batch = WriteBatch::default();
            for item in db.iterator(IteratorMode::Start) {
                let (k, _) = item?;
                batch.delete(k);
            }
            db.write(batch)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_bulk() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let db = RocksDocStore::open(dir.path()).expect("test: open");

        db.insert_one("tokens", "MRY", json!({"_id": "MRY", "supply": "0"}))
            .await
            .unwrap();

        db.bulk_write(vec![
            BulkOp::Update {
                collection: "tokens".to_owned(),
                key: "MRY".to_owned(),
                ops: json!({"$inc": {"supply": "100"}}),
            },
            BulkOp::Update {
                collection: "tokens".to_owned(),
                key: "MRY".to_owned(),
                ops: json!({"$inc": {"supply": "11"}}),
            },
        ])
        .await
        .unwrap();

        let doc = db.find_one("tokens", "MRY").await.unwrap().unwrap();
        assert_eq!(doc["supply"], "111");
    }

    #[tokio::test]
    async fn test_collections_are_disjoint() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let db = RocksDocStore::open(dir.path()).expect("test: open");

        db.insert_one("a", "k", json!({"v": 1})).await.unwrap();
        db.insert_one("ab", "k", json!({"v": 2})).await.unwrap();

        db.drop_collection("a").await.unwrap();
        assert!(db.find_one("a", "k").await.unwrap().is_none());
        assert_eq!(db.find_one("ab", "k").await.unwrap().unwrap()["v"], 2);
    }
}
