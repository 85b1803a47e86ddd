use std::collections::BTreeSet;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::io::{BlockDevice, FileBlockDevice};
use crate::record::FileRecord;
use crate::store::FileStore;

/// Shared access to one `FileStore`.
///
/// All clones go through the same lock, held for exactly one closure passed
/// to `with`. Compound sequences that must see a consistent store (look up,
/// then update) belong in a single `with` call.
pub struct StoreHandle<D: BlockDevice = FileBlockDevice> {
    inner: Arc<Mutex<FileStore<D>>>,
}

impl<D: BlockDevice> Clone for StoreHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: BlockDevice> StoreHandle<D> {
    pub fn new(store: FileStore<D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Runs `f` with exclusive access to the store.
    pub fn with<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut FileStore<D>) -> Result<R>,
    {
        let mut store = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut store)
    }

    pub fn save(&self, record: &FileRecord) -> Result<()> {
        self.with(|store| store.save(record))
    }

    pub fn load(&self, file_id: i32) -> Result<Option<FileRecord>> {
        self.with(|store| store.load(file_id))
    }

    pub fn delete(&self, file_id: i32) -> Result<bool> {
        self.with(|store| store.delete(file_id))
    }

    pub fn enumerate_ids(&self) -> Result<BTreeSet<i32>> {
        self.with(|store| store.enumerate_ids())
    }
}

impl<D: BlockDevice + Send + 'static> StoreHandle<D> {
    /// Starts a background thread moving expired records to the bin every
    /// `interval`, judged against the system clock.
    pub fn spawn_expiry_sweeper(&self, interval: Duration) -> Result<ExpirySweeper> {
        self.spawn_expiry_sweeper_with_clock(interval, unix_now)
    }

    /// Like `spawn_expiry_sweeper`, reading the current time from `clock`
    /// (seconds since epoch).
    pub fn spawn_expiry_sweeper_with_clock<C>(
        &self,
        interval: Duration,
        clock: C,
    ) -> Result<ExpirySweeper>
    where
        C: Fn() -> i64 + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = self.clone();
        let thread = thread::Builder::new()
            .name("expiry-sweeper".to_string())
            .spawn(move || {
                info!("Expiry sweeper started, interval {:?}.", interval);
                loop {
                    // Waiting happens outside the store lock.
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let now = clock();
                    match handle.with(|store| store.move_expired_to_bin(now)) {
                        Ok(moved) if !moved.is_empty() => {
                            debug!("Expiry sweep moved {:?} to the bin.", moved)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Expiry sweep failed: {}", e),
                    }
                }
                info!("Expiry sweeper stopped.");
            })?;
        Ok(ExpirySweeper {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// Running expiry sweeper. Stops (and joins its thread) on `stop` or drop.
pub struct ExpirySweeper {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the thread as well, the send is best effort.
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Expiry sweeper thread panicked.");
            }
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::TempDir;

    fn open_handle(dir: &TempDir) -> StoreHandle {
        let config = StoreConfig::new(dir.path())
            .block_size(256)
            .total_blocks(256);
        StoreHandle::new(FileStore::open(&config).unwrap())
    }

    #[test]
    fn concurrent_sessions_see_every_write() {
        let dir = TempDir::new().unwrap();
        let handle = open_handle(&dir);

        let workers: Vec<_> = (0..4)
            .map(|w| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        let id = w * 100 + i;
                        let record = FileRecord::new(id, w, format!("f{}", id), vec![w as u8; 300]);
                        handle.save(&record).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handle.enumerate_ids().unwrap().len(), 40);
        assert_eq!(handle.load(307).unwrap().unwrap().content, vec![3u8; 300]);
    }

    #[test]
    fn compound_update_runs_under_one_lock() {
        let dir = TempDir::new().unwrap();
        let handle = open_handle(&dir);
        handle
            .save(&FileRecord::new(1, 1, "counter", vec![0]))
            .unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        handle
                            .with(|store| {
                                let mut record = store.load(1)?.unwrap();
                                record.content[0] += 1;
                                store.update(&record)
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handle.load(1).unwrap().unwrap().content, vec![20]);
    }

    #[test]
    fn sweeper_moves_expired_records_to_bin() {
        let dir = TempDir::new().unwrap();
        let handle = open_handle(&dir);
        handle
            .save(&FileRecord::new(1, 1, "old", b"x".to_vec()).with_times(0, 500))
            .unwrap();
        handle
            .save(&FileRecord::new(2, 1, "fresh", b"y".to_vec()).with_times(0, 5000))
            .unwrap();

        let sweeper = handle
            .spawn_expiry_sweeper_with_clock(Duration::from_millis(5), || 1000)
            .unwrap();
        let mut binned = false;
        for _ in 0..400 {
            if handle.load(1).unwrap().unwrap().in_bin {
                binned = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();

        assert!(binned);
        assert!(!handle.load(2).unwrap().unwrap().in_bin);
    }
}
