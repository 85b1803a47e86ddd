use std::collections::BTreeSet;

use filestore::block::{BlockHeader, BlockStore};
use filestore::index::BTreeIndex;
use filestore::io::FileBlockDevice;
use filestore::{FileRecord, FileStore, StoreConfig, StoreError};
use tempfile::TempDir;

const SMALL_BLOCK: usize = 128;
const SMALL_CAPACITY: usize = SMALL_BLOCK - 16;

fn small_config(dir: &TempDir, blocks: usize) -> StoreConfig {
    StoreConfig::new(dir.path())
        .block_size(SMALL_BLOCK)
        .total_blocks(blocks)
}

fn record(id: i32, content: Vec<u8>) -> FileRecord {
    FileRecord::new(id, 1, format!("file-{}", id), content).with_times(1_000, 2_000)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn records_round_trip_at_chain_boundaries() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 64)).unwrap();

    let lengths = [0, 1, SMALL_CAPACITY, SMALL_CAPACITY * 5 / 2];
    for (id, &len) in lengths.iter().enumerate() {
        store.save(&record(id as i32, pattern(len))).unwrap();
    }
    for (id, &len) in lengths.iter().enumerate() {
        let loaded = store.load(id as i32).unwrap().expect("record was saved");
        assert_eq!(loaded.content, pattern(len));
        assert_eq!(loaded.name, format!("file-{}", id));
        assert_eq!(loaded.create_time, 1_000);
        assert_eq!(loaded.expire_time, 2_000);
    }
}

#[test]
fn large_record_takes_three_default_blocks() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path()).total_blocks(8);
    let mut store = FileStore::open(&config).unwrap();

    let before = store.used_blocks();
    store
        .save(&FileRecord::new(1, 1, "big.bin", pattern(150_000)))
        .unwrap();
    assert_eq!(store.used_blocks() - before, 3);
    assert_eq!(store.load(1).unwrap().unwrap().content.len(), 150_000);
}

#[test]
fn update_shrinks_and_grows_chains() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 32)).unwrap();

    store.save(&record(7, pattern(SMALL_CAPACITY * 2 + 10))).unwrap();
    assert_eq!(store.used_blocks(), 3);

    store.update(&record(7, pattern(10))).unwrap();
    assert_eq!(store.used_blocks(), 1);
    assert_eq!(store.load(7).unwrap().unwrap().content, pattern(10));

    store.update(&record(7, pattern(SMALL_CAPACITY * 3))).unwrap();
    assert_eq!(store.used_blocks(), 4);
    assert_eq!(
        store.load(7).unwrap().unwrap().content,
        pattern(SMALL_CAPACITY * 3)
    );
}

#[test]
fn enumeration_ignores_insertion_order() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 128)).unwrap();

    let ids: Vec<i32> = (0..61).map(|i| (i * 17 + 5) % 61).collect();
    for &id in &ids {
        store.save(&record(id, vec![id as u8])).unwrap();
    }
    for id in (0..61).step_by(4) {
        assert!(store.delete(id).unwrap());
    }

    let expected: BTreeSet<i32> = (0..61).filter(|id| id % 4 != 0).collect();
    assert_eq!(store.enumerate_ids().unwrap(), expected);
}

#[test]
fn deleted_record_is_gone_and_can_come_back() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 16)).unwrap();

    store.save(&record(3, pattern(200))).unwrap();
    assert!(store.delete(3).unwrap());
    assert_eq!(store.used_blocks(), 0);
    assert!(store.load(3).unwrap().is_none());
    assert!(!store.enumerate_ids().unwrap().contains(&3));
    assert!(!store.delete(3).unwrap());

    store.save(&record(3, pattern(5))).unwrap();
    assert_eq!(store.load(3).unwrap().unwrap().content, pattern(5));
}

#[test]
fn full_store_rejects_writes_without_damage() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 4)).unwrap();

    store.save(&record(1, pattern(SMALL_CAPACITY))).unwrap();
    store.save(&record(2, pattern(10))).unwrap();
    assert_eq!(store.free_blocks(), 1);

    // Needs three blocks, one is free.
    let result = store.save(&record(3, pattern(SMALL_CAPACITY * 2)));
    assert!(matches!(result, Err(StoreError::DiskFull)));
    assert_eq!(store.free_blocks(), 1);
    assert!(store.load(3).unwrap().is_none());

    // Growing an existing record past the free space keeps the old version.
    let result = store.update(&record(2, pattern(SMALL_CAPACITY * 3)));
    assert!(matches!(result, Err(StoreError::DiskFull)));
    assert_eq!(store.load(2).unwrap().unwrap().content, pattern(10));
    assert_eq!(store.free_blocks(), 1);

    assert!(store.delete(1).unwrap());
    store.save(&record(3, pattern(SMALL_CAPACITY * 2))).unwrap();
    assert_eq!(store.free_blocks(), 0);
}

#[test]
fn store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir, 256);
    let mut before = Vec::new();
    {
        let mut store = FileStore::open(&config).unwrap();
        for id in 0..40 {
            store.save(&record(id, pattern(id as usize * 13))).unwrap();
        }
        store.delete(11).unwrap();
        store.update(&record(12, pattern(3))).unwrap();
        for id in store.enumerate_ids().unwrap() {
            before.push(store.load(id).unwrap().unwrap());
        }
    }

    let mut store = FileStore::open(&config).unwrap();
    let ids: Vec<i32> = store.enumerate_ids().unwrap().into_iter().collect();
    assert_eq!(ids, before.iter().map(|r| r.file_id).collect::<Vec<_>>());
    for expected in &before {
        assert_eq!(&store.load(expected.file_id).unwrap().unwrap(), expected);
    }
    assert!(store.load(11).unwrap().is_none());
}

#[test]
fn load_owned_filters_by_owner() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 32)).unwrap();
    for id in 0..6 {
        store
            .save(&FileRecord::new(id, id % 2, format!("f{}", id), vec![]))
            .unwrap();
    }

    let owned: Vec<i32> = store
        .load_owned(1)
        .unwrap()
        .into_iter()
        .map(|r| r.file_id)
        .collect();
    assert_eq!(owned, vec![1, 3, 5]);
}

#[test]
fn expired_records_move_to_bin_once() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 32)).unwrap();
    store
        .save(&FileRecord::new(1, 1, "a", vec![1]).with_times(0, 100))
        .unwrap();
    store
        .save(&FileRecord::new(2, 1, "b", vec![2]).with_times(0, 300))
        .unwrap();

    assert_eq!(store.move_expired_to_bin(200).unwrap(), vec![1]);
    assert!(store.load(1).unwrap().unwrap().in_bin);
    assert!(!store.load(2).unwrap().unwrap().in_bin);
    assert!(store.move_expired_to_bin(200).unwrap().is_empty());
}

#[test]
fn stats_track_block_usage() {
    let dir = TempDir::new().unwrap();
    let mut store = FileStore::open(&small_config(&dir, 10)).unwrap();
    store.save(&record(1, pattern(SMALL_CAPACITY))).unwrap();

    let stats = store.stats();
    assert_eq!(stats.total_blocks, 10);
    assert_eq!(stats.used_blocks, 2);
    assert_eq!(stats.free_blocks, 8);
    assert_eq!(stats.used_bytes(), 2 * SMALL_BLOCK as u64);
}

/// Assembles a store by hand so index and blocks can disagree.
fn hand_built_store(dir: &TempDir, total: usize) -> (BlockStore<FileBlockDevice>, BTreeIndex) {
    let dev = FileBlockDevice::open(dir.path().join("disk.dat"), SMALL_BLOCK, total).unwrap();
    let blocks = BlockStore::open(dev, dir.path().join("bitmap.dat")).unwrap();
    let index = BTreeIndex::open(dir.path().join("btree.dat"), 3).unwrap();
    (blocks, index)
}

#[test]
fn stale_index_entry_is_unreadable_but_deletable() {
    let dir = TempDir::new().unwrap();
    let (blocks, mut index) = hand_built_store(&dir, 8);
    index.insert(5, 3).unwrap();
    let mut store = FileStore::from_parts(blocks, index);

    assert!(matches!(
        store.load(5),
        Err(StoreError::CorruptChain { file_id: 5, .. })
    ));
    assert!(store.delete(5).unwrap());
    assert!(store.enumerate_ids().unwrap().is_empty());
}

#[test]
fn cyclic_chain_is_reported_not_followed() {
    let dir = TempDir::new().unwrap();
    let (mut blocks, mut index) = hand_built_store(&dir, 8);
    let a = blocks.allocate_block().unwrap();
    let b = blocks.allocate_block().unwrap();
    blocks
        .write_block(a, &BlockHeader::new(9, 0, b as i32), &[1; 4])
        .unwrap();
    blocks
        .write_block(b, &BlockHeader::new(9, 1, a as i32), &[2; 4])
        .unwrap();
    index.insert(9, a as i32).unwrap();
    let mut store = FileStore::from_parts(blocks, index);

    assert!(matches!(
        store.load(9),
        Err(StoreError::CorruptChain { file_id: 9, .. })
    ));
}

#[test]
fn cycle_through_every_block_stops_at_store_size() {
    let dir = TempDir::new().unwrap();
    let (mut blocks, mut index) = hand_built_store(&dir, 2);
    let a = blocks.allocate_block().unwrap();
    let b = blocks.allocate_block().unwrap();
    // Sequence indices are consistent, only the length gives the loop away.
    blocks
        .write_block(a, &BlockHeader::new(4, 0, b as i32), &[1; 4])
        .unwrap();
    blocks
        .write_block(b, &BlockHeader::new(4, 1, a as i32), &[2; 4])
        .unwrap();
    index.insert(4, a as i32).unwrap();
    let mut store = FileStore::from_parts(blocks, index);

    match store.load(4) {
        Err(StoreError::CorruptChain { file_id, reason }) => {
            assert_eq!(file_id, 4);
            assert!(reason.contains("longer than"), "{}", reason);
        }
        other => panic!("expected a corrupt chain, got {:?}", other),
    }
    assert!(store.delete(4).unwrap());
    assert_eq!(store.used_blocks(), 2);
}
