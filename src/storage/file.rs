//! File-backed key-value store
//!
//! Keeps the full map in memory and periodically rewrites a single snapshot
//! file. Snapshot writes go to a temp file in the same directory followed by
//! a rename, so a crash never leaves a torn snapshot. Writes between flushes
//! live only in memory; gateways needing stricter durability plug an
//! external engine in behind [`KvStore`].

use super::engine::KvStore;
use crate::core::{GatewayError, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

pub struct FileStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    dirty: Arc<AtomicBool>,
    snapshot_path: PathBuf,
    stop: Arc<Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl FileStore {
    /// Open the store at `snapshot_path`, loading the snapshot if present,
    /// and start the background flush task.
    pub fn open<P: AsRef<Path>>(snapshot_path: P, flush_interval: Duration) -> Result<Self> {
        let snapshot_path = snapshot_path.as_ref().to_path_buf();
        let entries = Arc::new(RwLock::new(Self::load_snapshot(&snapshot_path)?));
        let dirty = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());

        let flusher = {
            let entries = Arc::clone(&entries);
            let dirty = Arc::clone(&dirty);
            let stop = Arc::clone(&stop);
            let path = snapshot_path.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.notified() => break,
                        _ = tokio::time::sleep(flush_interval) => {}
                    }
                    if dirty.swap(false, Ordering::AcqRel) {
                        let snapshot = entries.read().await.clone();
                        if let Err(e) = Self::save_snapshot(&path, &snapshot) {
                            error!("Failed to flush store snapshot: {}", e);
                            dirty.store(true, Ordering::Release);
                        }
                    }
                }
            })
        };

        Ok(Self {
            entries,
            dirty,
            snapshot_path,
            stop,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    fn load_snapshot(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let mut file = File::open(path)
            .map_err(|e| GatewayError::Storage(format!("Failed to open snapshot: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| GatewayError::Storage(format!("Failed to read snapshot: {}", e)))?;
        let entries: BTreeMap<String, Vec<u8>> = rmp_serde::from_slice(&data)?;
        info!("Loaded {} entries from {}", entries.len(), path.display());
        Ok(entries)
    }

    fn save_snapshot(path: &Path, entries: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Storage(format!("Failed to create store directory: {}", e)))?;
        }
        let temp_path = path.with_extension("tmp");
        let temp_file = File::create(&temp_path)
            .map_err(|e| GatewayError::Storage(format!("Failed to create temp snapshot: {}", e)))?;
        let mut writer = BufWriter::new(temp_file);
        let serialized = rmp_serde::to_vec(entries)?;
        writer
            .write_all(&serialized)
            .map_err(|e| GatewayError::Storage(format!("Failed to write snapshot: {}", e)))?;
        writer
            .flush()
            .map_err(|e| GatewayError::Storage(format!("Failed to flush snapshot: {}", e)))?;
        writer
            .get_mut()
            .sync_all()
            .map_err(|e| GatewayError::Storage(format!("Failed to sync snapshot: {}", e)))?;
        fs::rename(&temp_path, path)
            .map_err(|e| GatewayError::Storage(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn iterate<'life0, 'life1, 'life2, 'async_trait>(
        &'life0 self,
        prefix: &'life1 str,
        visit: &'life2 mut (dyn FnMut(&str, &[u8]) + Send),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        'life2: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let entries = self.entries.read().await;
            for (key, value) in entries.range(prefix.to_string()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                visit(key, value);
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        self.stop.notify_waiters();
        if let Some(handle) = self.flusher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Store flush task ended abnormally: {}", e);
            }
        }
        if self.dirty.swap(false, Ordering::AcqRel) {
            let snapshot = self.entries.read().await.clone();
            Self::save_snapshot(&self.snapshot_path, &snapshot)?;
        }
        Ok(())
    }
}
