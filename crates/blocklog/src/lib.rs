//! Append-only binary block store.
//!
//! Two files live in the blocks dir.  `blocks.log` is a stream of records,
//! each a 4-byte LE length followed by that many bytes of JSON block body.
//! `blocks.index` holds one 8-byte LE u64 per block giving the byte offset
//! of record `n` in the log.  (The ancestral format split the offset into
//! two u32 halves; that packing dropped offset bits above 2^40, so this
//! store writes plain u64 LE and there is no legacy-file interop.)
//!
//! The store is the sole owner of both file handles.  A crash between the
//! log write and the index write is repaired at the next open by truncating
//! the index to the longest prefix the log fully covers and re-scanning the
//! remainder of the log.

mod errors;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::*;

use mirach_primitives::block::Block;

pub use errors::BlockLogError;

const LOG_FILE: &str = "blocks.log";
const INDEX_FILE: &str = "blocks.index";
const INDEX_ENTRY: u64 = 8;
const LEN_PREFIX: u64 = 4;

pub struct BlockLog {
    dir: PathBuf,
    log: File,
    index: File,
    log_size: u64,
    height: i64,
}

impl BlockLog {
    /// Opens (or creates) the store in `dir`, running crash repair.
    ///
    /// A non-empty index over an empty log is unrepairable and fatal; the
    /// inverse rebuilds the index by scanning the log.
    pub fn open(dir: &Path) -> Result<Self, BlockLogError> {
        std::fs::create_dir_all(dir)?;
        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join(LOG_FILE))?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(INDEX_FILE))?;

        let mut store = Self {
            dir: dir.to_owned(),
            log,
            index,
            log_size: 0,
            height: -1,
        };
        store.repair()?;
        Ok(store)
    }

    /// Highest stored block id, or -1 when the store is empty.
    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends a block.  `b.id` must be exactly `height() + 1`.
    pub fn append(&mut self, b: &Block) -> Result<(), BlockLogError> {
        if b.id as i64 != self.height + 1 {
            return Err(BlockLogError::OutOfOrder {
                got: b.id,
                expect: (self.height + 1) as u64,
            });
        }

        let body = serde_json::to_vec(b)?;
        let len = body.len() as u32;

        let mut rec = Vec::with_capacity(body.len() + 4);
        rec.extend_from_slice(&len.to_le_bytes());
        rec.extend_from_slice(&body);

        let offset = self.log_size;
        self.log.write_all(&rec)?;
        self.log.flush()?;
        self.log_size += rec.len() as u64;

        self.index.seek(SeekFrom::End(0))?;
        self.index.write_all(&offset.to_le_bytes())?;
        self.index.flush()?;

        self.height += 1;
        Ok(())
    }

    /// Reads block `n`.
    pub fn read(&mut self, n: i64) -> Result<Block, BlockLogError> {
        if n < 0 || n > self.height {
            return Err(BlockLogError::OutOfRange(n));
        }
        let offset = self.index_entry(n as u64)?;
        let body = self.read_record(offset)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Reads blocks `start..=end` with one physical log read.  Returns an
    /// empty vec when `start` is past the head; `end` is clamped to the
    /// head.
    pub fn read_range(&mut self, start: i64, end: i64) -> Result<Vec<Block>, BlockLogError> {
        if start < 0 || end < start {
            return Err(BlockLogError::OutOfRange(start.min(end)));
        }
        if start > self.height {
            return Ok(Vec::new());
        }
        let end = end.min(self.height);

        let start_off = self.index_entry(start as u64)?;
        let end_off = self.index_entry(end as u64)?;
        let end_len = self.record_len(end_off)?;
        let span = end_off + LEN_PREFIX + end_len as u64 - start_off;

        let mut buf = vec![0u8; span as usize];
        self.log.seek(SeekFrom::Start(start_off))?;
        self.log.read_exact(&mut buf)?;

        // Deserialize the contiguous record stream.
        let mut out = Vec::with_capacity((end - start + 1) as usize);
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let body = buf
                .get(pos + 4..pos + 4 + len)
                .ok_or_else(|| BlockLogError::Corrupt("range read past buffer".to_owned()))?;
            out.push(serde_json::from_slice(body)?);
            pos += 4 + len;
        }
        Ok(out)
    }

    /// Reads the head block.
    pub fn last(&mut self) -> Result<Block, BlockLogError> {
        self.read(self.height)
    }

    /// Flushes and drops the file handles.
    pub fn close(mut self) -> Result<(), BlockLogError> {
        self.log.flush()?;
        self.index.flush()?;
        Ok(())
    }

    fn index_entry(&mut self, n: u64) -> Result<u64, BlockLogError> {
        let mut raw = [0u8; 8];
        self.index.seek(SeekFrom::Start(n * INDEX_ENTRY))?;
        self.index.read_exact(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    fn record_len(&mut self, offset: u64) -> Result<u32, BlockLogError> {
        let mut raw = [0u8; 4];
        self.log.seek(SeekFrom::Start(offset))?;
        self.log.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Brings log and index back into agreement after a crash.
    fn repair(&mut self) -> Result<(), BlockLogError> {
        self.log_size = self.log.metadata()?.len();
        let mut index_size = self.index.metadata()?.len();

        if self.log_size == 0 && index_size > 0 {
            return Err(BlockLogError::Corrupt(
                "index is non-empty but log is empty".to_owned(),
            ));
        }

        // A torn index write leaves a partial trailing entry.
        if index_size % INDEX_ENTRY != 0 {
            index_size -= index_size % INDEX_ENTRY;
            self.index.set_len(index_size)?;
            warn!(%index_size, "truncated torn index entry");
        }

        // Walk entries back until one is fully covered by the log.
        let mut entries = index_size / INDEX_ENTRY;
        let mut resume_at = 0u64;
        while entries > 0 {
            let off = self.index_entry(entries - 1)?;
            if off + LEN_PREFIX <= self.log_size {
                let len = self.record_len(off)? as u64;
                if off + LEN_PREFIX + len <= self.log_size {
                    resume_at = off + LEN_PREFIX + len;
                    break;
                }
            }
            entries -= 1;
        }
        if entries * INDEX_ENTRY != index_size {
            warn!(
                covered = %entries,
                "index ran past log end, truncating to covered prefix"
            );
            self.index.set_len(entries * INDEX_ENTRY)?;
        }

        // Rebuild trailing entries by scanning the log forward.
        let mut scan = resume_at;
        let mut rebuilt = 0u64;
        self.index.seek(SeekFrom::End(0))?;
        while scan + LEN_PREFIX <= self.log_size {
            let len = self.record_len(scan)? as u64;
            if scan + LEN_PREFIX + len > self.log_size {
                break;
            }
            self.index.write_all(&scan.to_le_bytes())?;
            entries += 1;
            rebuilt += 1;
            scan += LEN_PREFIX + len;
        }
        self.index.flush()?;

        // Whatever trails `scan` is a torn log record; drop it.
        if scan < self.log_size {
            warn!(keep = %scan, total = %self.log_size, "truncating torn log record");
            self.log.set_len(scan)?;
            self.log_size = scan;
        }

        if rebuilt > 0 {
            info!(%rebuilt, height = %(entries as i64 - 1), "rebuilt index entries from log");
        }

        self.height = entries as i64 - 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
