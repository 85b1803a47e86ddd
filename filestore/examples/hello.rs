use filestore::{FileRecord, FileStore, StoreConfig};

pub fn main() -> filestore::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = StoreConfig::new(dir.path()).total_blocks(64);

    {
        let mut store = FileStore::open(&config)?;
        store.save(&FileRecord::new(1, 100, "hello.txt", b"hello, blocks".to_vec()))?;
    }

    // Reopen and read it back from disk.
    let mut store = FileStore::open(&config)?;
    for id in store.enumerate_ids()? {
        if let Some(record) = store.load(id)? {
            println!(
                "{} ({} bytes): {}",
                record.name,
                record.content.len(),
                String::from_utf8_lossy(&record.content)
            );
        }
    }
    let stats = store.stats();
    println!("{}/{} blocks used", stats.used_blocks, stats.total_blocks);
    Ok(())
}
