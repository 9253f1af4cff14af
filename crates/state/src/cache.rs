//! The write-through, rollback-capable state cache.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mirach_db::types::apply_find_options;
use mirach_db::update::apply_update;
use mirach_db::{BulkOp, DbResult, DocStore, Document, FindOptions};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::*;

use crate::collections::{self, key_of, ACCOUNTS, STATE, TOKENS};
use crate::writer::WriterHandle;

/// Everything mutable, under one lock.  The block pipeline is serialized,
/// so there is no contention to speak of; the lock exists for the reader
/// tasks peeking in from other threads.
#[derive(Default)]
struct Inner {
    /// Live documents per collection.
    live: HashMap<String, HashMap<String, Document>>,

    /// Shadow copies: the first pre-mutation image of every doc touched
    /// since the last flush.
    copy: HashMap<(String, String), Document>,

    /// Keys created since the last flush (dropped wholesale on rollback).
    inserted: Vec<(String, String)>,

    /// Pending writes since the last flush, in application order.  One
    /// chronological log keeps delete-then-reinsert (and friends) exact
    /// when the batch replays against the store.
    pending: Vec<BulkOp>,

    /// Keys deleted since the last flush; cold reads must not resurrect
    /// them from disk.
    deleted: HashSet<(String, String)>,

    /// Account names currently registered as witnesses.
    witnesses: HashSet<String>,
}

impl Inner {
    fn live_doc(&self, collection: &str, key: &str) -> Option<&Document> {
        self.live.get(collection)?.get(key)
    }

    fn put_live(&mut self, collection: &str, key: String, doc: Document) {
        if collection == ACCOUNTS {
            self.note_witness(&key, &doc);
        }
        self.live
            .entry(collection.to_owned())
            .or_default()
            .insert(key, doc);
    }

    fn note_witness(&mut self, name: &str, doc: &Document) {
        let is_witness = doc
            .get("witness_pub")
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if is_witness {
            self.witnesses.insert(name.to_owned());
        } else {
            self.witnesses.remove(name);
        }
    }

    /// Records the pre-image of a doc once per flush window.
    fn snapshot(&mut self, collection: &str, key: &str, doc: &Document) {
        let k = (collection.to_owned(), key.to_owned());
        self.copy.entry(k).or_insert_with(|| doc.clone());
    }
}

pub struct StateCache {
    store: Arc<dyn DocStore>,
    inner: Mutex<Inner>,
    writer: Mutex<Option<WriterHandle>>,

    /// Current head block id, persisted as `{_id: 0, head_block}` on each
    /// flush.
    head_block: AtomicU64,

    /// Shadowing is off while a rebuild replays blocks below its cursor.
    shadowing: AtomicBool,

    /// Duration of the last flush, for the miner's slow-flush throttle.
    last_flush_ms: AtomicU64,
}

impl StateCache {
    pub fn new(store: Arc<dyn DocStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner::default()),
            writer: Mutex::new(None),
            head_block: AtomicU64::new(0),
            shadowing: AtomicBool::new(true),
            last_flush_ms: AtomicU64::new(0),
        }
    }

    /// Routes subsequent flushes through the writer queue.
    pub fn attach_writer(&self, handle: WriterHandle) {
        *self.writer.lock() = Some(handle);
    }

    pub fn set_shadowing(&self, on: bool) {
        self.shadowing.store(on, Ordering::Relaxed);
    }

    pub fn head_block(&self) -> u64 {
        self.head_block.load(Ordering::Relaxed)
    }

    pub fn set_head_block(&self, id: u64) {
        self.head_block.store(id, Ordering::Relaxed);
    }

    pub fn last_flush_ms(&self) -> u64 {
        self.last_flush_ms.load(Ordering::Relaxed)
    }

    /// Current witness-account names, for the schedule.
    pub fn witness_names(&self) -> HashSet<String> {
        self.inner.lock().witnesses.clone()
    }

    /// Looks a doc up, hitting the live store first and falling back to
    /// the document store (caching the result).
    pub async fn find_one(&self, collection: &str, key: &str) -> DbResult<Option<Document>> {
        if let Some(doc) = self.inner.lock().live_doc(collection, key) {
            return Ok(Some(doc.clone()));
        }
        // A doc deleted this block must not resurrect from disk.
        if self
            .inner
            .lock()
            .deleted
            .contains(&(collection.to_owned(), key.to_owned()))
        {
            return Ok(None);
        }
        match self.store.find_one(collection, key).await? {
            Some(doc) => {
                self.inner
                    .lock()
                    .put_live(collection, key.to_owned(), doc.clone());
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Scans a collection: the document store's view patched with every
    /// live doc, then sorted/limited.
    pub async fn find(&self, collection: &str, opts: FindOptions) -> DbResult<Vec<Document>> {
        let mut docs: HashMap<String, Document> = HashMap::new();
        for doc in self.store.find(collection, FindOptions::default()).await? {
            if let Some(k) = key_of(collection, &doc) {
                docs.insert(k, doc);
            }
        }
        {
            let inner = self.inner.lock();
            if let Some(live) = inner.live.get(collection) {
                for (k, doc) in live {
                    docs.insert(k.clone(), doc.clone());
                }
            }
            for (c, k) in &inner.deleted {
                if c == collection {
                    docs.remove(k);
                }
            }
        }
        Ok(apply_find_options(docs.into_values().collect(), &opts))
    }

    /// Inserts a doc.  Returns false (without overwriting) when the key
    /// already exists.
    pub async fn insert_one(&self, collection: &str, doc: Document) -> DbResult<bool> {
        let Some(key) = key_of(collection, &doc) else {
            return Ok(false);
        };
        if self.find_one(collection, &key).await?.is_some() {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        inner.put_live(collection, key.clone(), doc.clone());
        inner.inserted.push((collection.to_owned(), key.clone()));
        inner.deleted.remove(&(collection.to_owned(), key.clone()));
        inner.pending.push(BulkOp::Insert {
            collection: collection.to_owned(),
            key,
            doc,
        });
        Ok(true)
    }

    /// Applies an operator doc to one document.  A miss is a no-op
    /// returning false.
    pub async fn update_one(&self, collection: &str, key: &str, ops: &Value) -> DbResult<bool> {
        // Pull the doc into the live store first.
        let Some(_) = self.find_one(collection, key).await? else {
            return Ok(false);
        };

        let shadowing = self.shadowing.load(Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let Some(doc) = inner.live_doc(collection, key).cloned() else {
            return Ok(false);
        };
        if shadowing {
            inner.snapshot(collection, key, &doc);
        }

        let mut updated = doc;
        apply_update(&mut updated, ops)?;
        inner.put_live(collection, key.to_owned(), updated);
        inner.pending.push(BulkOp::Update {
            collection: collection.to_owned(),
            key: key.to_owned(),
            ops: ops.clone(),
        });
        Ok(true)
    }

    /// `update_one` over a `$in` key list.
    pub async fn update_many(
        &self,
        collection: &str,
        keys: &[String],
        ops: &Value,
    ) -> DbResult<usize> {
        let mut n = 0;
        for key in keys {
            if self.update_one(collection, key, ops).await? {
                n += 1;
            }
        }
        Ok(n)
    }

    pub async fn delete_one(&self, collection: &str, key: &str) -> DbResult<bool> {
        let Some(doc) = self.find_one(collection, key).await? else {
            return Ok(false);
        };
        let shadowing = self.shadowing.load(Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if shadowing {
            inner.snapshot(collection, key, &doc);
        }
        if let Some(coll) = inner.live.get_mut(collection) {
            coll.remove(key);
        }
        if collection == ACCOUNTS {
            inner.witnesses.remove(key);
        }
        inner
            .deleted
            .insert((collection.to_owned(), key.to_owned()));
        inner.pending.push(BulkOp::Delete {
            collection: collection.to_owned(),
            key: key.to_owned(),
        });
        Ok(true)
    }

    /// Unwinds everything since the last flush: shadow copies restore,
    /// inserts drop, witness membership recomputes, logs clear.
    pub fn rollback(&self) {
        let mut inner = self.inner.lock();

        let copies: Vec<_> = inner.copy.drain().collect();
        for ((collection, key), doc) in copies {
            inner.put_live(&collection, key, doc);
        }

        let inserted = std::mem::take(&mut inner.inserted);
        for (collection, key) in inserted {
            if let Some(coll) = inner.live.get_mut(&collection) {
                coll.remove(&key);
            }
            if collection == ACCOUNTS {
                inner.witnesses.remove(&key);
            }
        }

        inner.pending.clear();
        inner.deleted.clear();
        trace!("state cache rolled back");
    }

    /// Assembles the pending logs into one bulk batch and lands it, either
    /// through the writer queue or directly.  On success the logs and
    /// shadow clear; on failure they stay for a retry.
    pub async fn write_to_disk(&self) -> DbResult<()> {
        let started = Instant::now();
        let mut ops = self.inner.lock().pending.clone();

        let head = self.head_block();
        ops.push(BulkOp::Replace {
            collection: STATE.to_owned(),
            key: "0".to_owned(),
            doc: json!({"_id": 0, "head_block": head}),
        });

        let writer = self.writer.lock().clone();
        let res = match writer {
            Some(handle) => handle.submit(ops).await,
            None => self.store.bulk_write(ops).await,
        };
        res?;

        let mut inner = self.inner.lock();
        inner.copy.clear();
        inner.inserted.clear();
        inner.pending.clear();
        inner.deleted.clear();

        let elapsed = started.elapsed().as_millis() as u64;
        self.last_flush_ms.store(elapsed, Ordering::Relaxed);
        debug!(head = %head, ms = %elapsed, "state flushed");
        Ok(())
    }

    /// Loads the hottest documents of a collection into the live store so
    /// the first blocks after boot don't hit the cold path.
    pub async fn warmup(&self, collection: &str, limit: usize) -> DbResult<usize> {
        if limit == 0 {
            return Ok(0);
        }
        let opts = match collection {
            ACCOUNTS => FindOptions::sorted_desc("node_appr")
                .then_desc("name")
                .with_limit(limit),
            TOKENS => FindOptions::sorted_desc("created").with_limit(limit),
            _ => FindOptions::default().with_limit(limit),
        };
        let docs = self.store.find(collection, opts).await?;
        let n = docs.len();
        let mut inner = self.inner.lock();
        for doc in docs {
            if let Some(key) = key_of(collection, &doc) {
                inner.put_live(collection, key, doc);
            }
        }
        debug!(collection = %collection, loaded = %n, "warmed up collection");
        Ok(n)
    }

    /// Loads every registered witness account so schedule computation
    /// never touches the cold path.
    pub async fn warmup_witnesses(&self) -> DbResult<usize> {
        let docs = self.store.find(ACCOUNTS, FindOptions::default()).await?;
        let mut n = 0;
        let mut inner = self.inner.lock();
        for doc in docs {
            let has_pub = doc.get("witness_pub").map(|v| !v.is_null()).unwrap_or(false);
            if !has_pub {
                continue;
            }
            if let Some(key) = key_of(ACCOUNTS, &doc) {
                inner.put_live(ACCOUNTS, key, doc);
                n += 1;
            }
        }
        debug!(witnesses = %n, "warmed up witness set");
        Ok(n)
    }

    /// Restores the persisted head cursor on boot.
    pub async fn load_head_cursor(&self) -> DbResult<Option<u64>> {
        let doc = self.store.find_one(STATE, "0").await?;
        let head = doc
            .as_ref()
            .and_then(|d| d.get("head_block"))
            .and_then(|v| v.as_u64());
        if let Some(h) = head {
            self.set_head_block(h);
        }
        Ok(head)
    }

    /// Deep snapshot of live collections, for tests and debugging.
    pub fn dump_live(&self) -> HashMap<String, HashMap<String, Document>> {
        self.inner.lock().live.clone()
    }

    pub fn collections(&self) -> &'static [&'static str] {
        collections::ALL
    }
}
