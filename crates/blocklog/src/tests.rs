use std::fs::OpenOptions;
use std::io::Write;

use mirach_primitives::amount::Amount;
use mirach_primitives::block::Block;

use super::*;

fn mk_block(id: u64, phash: &str) -> Block {
    Block {
        id,
        phash: phash.to_owned(),
        timestamp: 1_000 + id * 3_000,
        steem_block: 100 + id,
        steem_ts: 900 + id * 3_000,
        txs: vec![],
        witness: "alice".to_owned(),
        missed_by: None,
        dist: Amount::new(0),
        sync: false,
        hash: Some(format!("h{id}")),
        signature: Some(format!("s{id}")),
    }
}

fn fill(store: &mut BlockLog, n: u64) {
    for id in 0..n {
        store.append(&mk_block(id, "h0")).expect("test: append");
    }
}

#[test]
fn test_single_append_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = BlockLog::open(dir.path()).unwrap();
    assert_eq!(store.height(), -1);

    store.append(&mk_block(0, "")).unwrap();
    let b1 = mk_block(1, "h0");
    store.append(&b1).unwrap();

    assert_eq!(store.height(), 1);
    assert_eq!(store.read(1).unwrap(), b1);
    assert_eq!(store.last().unwrap(), b1);
}

#[test]
fn test_append_rejects_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = BlockLog::open(dir.path()).unwrap();
    store.append(&mk_block(0, "")).unwrap();
    assert!(matches!(
        store.append(&mk_block(2, "h0")),
        Err(BlockLogError::OutOfOrder { got: 2, expect: 1 })
    ));
}

#[test]
fn test_read_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = BlockLog::open(dir.path()).unwrap();
    fill(&mut store, 4);

    let r = store.read_range(1, 2).unwrap();
    assert_eq!(r.len(), 2);
    assert_eq!(r[0].id, 1);
    assert_eq!(r[1].id, 2);

    // Full range including genesis; end clamps to the head.
    let r = store.read_range(0, 3).unwrap();
    assert_eq!(r.iter().map(|b| b.id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    let r = store.read_range(0, 30).unwrap();
    assert_eq!(r.len(), 4);

    // Start past the head is empty, not an error.
    assert!(store.read_range(10, 20).unwrap().is_empty());
}

#[test]
fn test_read_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = BlockLog::open(dir.path()).unwrap();
    fill(&mut store, 2);
    assert!(matches!(store.read(-1), Err(BlockLogError::OutOfRange(-1))));
    assert!(matches!(store.read(2), Err(BlockLogError::OutOfRange(2))));
}

#[test]
fn test_roundtrip_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let blocks: Vec<Block> = (0..50).map(|i| mk_block(i, "p")).collect();
    {
        let mut store = BlockLog::open(dir.path()).unwrap();
        for b in &blocks {
            store.append(b).unwrap();
        }
        store.close().unwrap();
    }

    let mut store = BlockLog::open(dir.path()).unwrap();
    assert_eq!(store.height(), 49);
    for b in &blocks {
        assert_eq!(&store.read(b.id as i64).unwrap(), b);
    }
    assert_eq!(store.read_range(0, 49).unwrap(), blocks);
}

#[test]
fn test_index_rebuild_after_truncation() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = BlockLog::open(dir.path()).unwrap();
        fill(&mut store, 20);
        store.close().unwrap();
    }

    let index_path = dir.path().join("blocks.index");
    let full_index = std::fs::read(&index_path).unwrap();

    // Truncate the index at each 8-byte boundary; reopen must rebuild the
    // identical index every time.
    for keep_entries in [0usize, 1, 7, 19] {
        let f = OpenOptions::new().write(true).open(&index_path).unwrap();
        f.set_len((keep_entries * 8) as u64).unwrap();
        drop(f);

        let mut store = BlockLog::open(dir.path()).unwrap();
        assert_eq!(store.height(), 19);
        assert_eq!(store.read(19).unwrap().id, 19);
        store.close().unwrap();

        assert_eq!(std::fs::read(&index_path).unwrap(), full_index);
    }
}

#[test]
fn test_torn_index_entry_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = BlockLog::open(dir.path()).unwrap();
        fill(&mut store, 5);
        store.close().unwrap();
    }

    // Append 3 junk bytes, simulating a crash mid index write.
    let index_path = dir.path().join("blocks.index");
    let mut f = OpenOptions::new().append(true).open(&index_path).unwrap();
    f.write_all(&[0xab, 0xcd, 0xef]).unwrap();
    drop(f);

    let mut store = BlockLog::open(dir.path()).unwrap();
    assert_eq!(store.height(), 4);
    assert_eq!(store.read(4).unwrap().id, 4);
}

#[test]
fn test_torn_log_record_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = BlockLog::open(dir.path()).unwrap();
        fill(&mut store, 5);
        store.close().unwrap();
    }

    // A length prefix promising more bytes than exist.
    let log_path = dir.path().join("blocks.log");
    let mut f = OpenOptions::new().append(true).open(&log_path).unwrap();
    f.write_all(&1000u32.to_le_bytes()).unwrap();
    f.write_all(b"partial").unwrap();
    drop(f);

    let mut store = BlockLog::open(dir.path()).unwrap();
    assert_eq!(store.height(), 4);
    // The torn record is gone, so the next append lands cleanly.
    store.append(&mk_block(5, "p")).unwrap();
    assert_eq!(store.read(5).unwrap().id, 5);
}

#[test]
fn test_empty_log_nonempty_index_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("blocks.log"), b"").unwrap();
    std::fs::write(dir.path().join("blocks.index"), 0u64.to_le_bytes()).unwrap();
    assert!(matches!(
        BlockLog::open(dir.path()),
        Err(BlockLogError::Corrupt(_))
    ));
}

#[test]
fn test_index_rebuilt_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = BlockLog::open(dir.path()).unwrap();
        fill(&mut store, 8);
        store.close().unwrap();
    }
    std::fs::remove_file(dir.path().join("blocks.index")).unwrap();

    let mut store = BlockLog::open(dir.path()).unwrap();
    assert_eq!(store.height(), 7);
    assert_eq!(store.read_range(0, 7).unwrap().len(), 8);
}
