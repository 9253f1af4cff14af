//! In-memory `DocStore`, used by tests and as a stand-in when no data dir
//! is configured.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::{DbError, DbResult};
use crate::traits::DocStore;
use crate::types::{apply_find_options, BulkOp, Document, FindOptions};
use crate::update::apply_update;

#[derive(Default)]
pub struct MemDocStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bulk_apply(
        colls: &mut HashMap<String, BTreeMap<String, Document>>,
        op: BulkOp,
    ) -> DbResult<()> {
        match op {
            BulkOp::Insert {
                collection,
                key,
                doc,
            } => {
                let coll = colls.entry(collection.clone()).or_default();
                if coll.contains_key(&key) {
                    return Err(DbError::DuplicateKey(key, collection));
                }
                coll.insert(key, doc);
            }
            BulkOp::Update {
                collection,
                key,
                ops,
            } => {
                let coll = colls.entry(collection).or_default();
                let doc = coll
                    .entry(key)
                    .or_insert_with(|| Value::Object(Default::default()));
                apply_update(doc, &ops)?;
            }
            BulkOp::Replace {
                collection,
                key,
                doc,
            } => {
                colls.entry(collection).or_default().insert(key, doc);
            }
            BulkOp::Delete { collection, key } => {
                if let Some(coll) = colls.get_mut(&collection) {
                    coll.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocStore for MemDocStore {
    async fn find_one(&self, collection: &str, key: &str) -> DbResult<Option<Document>> {
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn find(&self, collection: &str, opts: FindOptions) -> DbResult<Vec<Document>> {
        let docs = self
            .collections
            .lock()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        Ok(apply_find_options(docs, &opts))
    }

    async fn insert_one(&self, collection: &str, key: &str, doc: Document) -> DbResult<()> {
        Self::bulk_apply(
            &mut self.collections.lock(),
            BulkOp::Insert {
                collection: collection.to_owned(),
                key: key.to_owned(),
                doc,
            },
        )
    }

    async fn replace_one(&self, collection: &str, key: &str, doc: Document) -> DbResult<()> {
        self.collections
            .lock()
            .entry(collection.to_owned())
            .or_default()
            .insert(key.to_owned(), doc);
        Ok(())
    }

    async fn delete_one(&self, collection: &str, key: &str) -> DbResult<bool> {
        Ok(self
            .collections
            .lock()
            .get_mut(collection)
            .map(|c| c.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn bulk_write(&self, ops: Vec<BulkOp>) -> DbResult<()> {
        // Applied against a copy first so a bad op can't half-apply the
        // batch.
        let mut colls = self.collections.lock();
        let mut staged = colls.clone();
        for op in ops {
            Self::bulk_apply(&mut staged, op)?;
        }
        *colls = staged;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> DbResult<()> {
        self.collections.lock().remove(collection);
        Ok(())
    }

    async fn drop_database(&self) -> DbResult<()> {
        self.collections.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::SortOrder;

    #[tokio::test]
    async fn test_insert_find_delete() {
        let db = MemDocStore::new();
        db.insert_one("accounts", "alice", json!({"name": "alice"}))
            .await
            .unwrap();
        assert!(db
            .insert_one("accounts", "alice", json!({"name": "alice"}))
            .await
            .is_err());

        let doc = db.find_one("accounts", "alice").await.unwrap().unwrap();
        assert_eq!(doc["name"], "alice");

        assert!(db.delete_one("accounts", "alice").await.unwrap());
        assert!(!db.delete_one("accounts", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_write_upsert_and_atomicity() {
        let db = MemDocStore::new();
        db.bulk_write(vec![BulkOp::Update {
            collection: "accounts".to_owned(),
            key: "bob".to_owned(),
            ops: json!({"$inc": {"balance": "5"}}),
        }])
        .await
        .unwrap();
        let doc = db.find_one("accounts", "bob").await.unwrap().unwrap();
        assert_eq!(doc["balance"], "5");

        // Second op of the batch fails, first must not stick.
        let res = db
            .bulk_write(vec![
                BulkOp::Update {
                    collection: "accounts".to_owned(),
                    key: "bob".to_owned(),
                    ops: json!({"$inc": {"balance": "5"}}),
                },
                BulkOp::Insert {
                    collection: "accounts".to_owned(),
                    key: "bob".to_owned(),
                    doc: json!({"name": "bob"}),
                },
            ])
            .await;
        assert!(res.is_err());
        let doc = db.find_one("accounts", "bob").await.unwrap().unwrap();
        assert_eq!(doc["balance"], "5");
    }

    #[tokio::test]
    async fn test_find_sort_limit() {
        let db = MemDocStore::new();
        for (name, weight) in [("a", 3), ("b", 9), ("c", 6)] {
            db.insert_one("accounts", name, json!({"name": name, "node_appr": weight}))
                .await
                .unwrap();
        }
        let opts = FindOptions {
            sort: vec![("node_appr".to_owned(), SortOrder::Desc)],
            limit: Some(2),
        };
        let docs = db.find("accounts", opts).await.unwrap();
        let names: Vec<_> = docs.iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
