//! Reported-properties queue
//!
//! Semantic merge buffer between local reported updates and the cloud: at
//! most one pending patch per twin, later updates merged into it in arrival
//! order. A background drain task pushes pending patches upstream, honoring
//! a per-id minimum sync interval and backing off after transient failures.
//! Pending patches persist under `reported/<id>` and survive a restart.

use crate::core::{GatewayConfig, GatewayError, KeyedLockTable, Result};
use crate::storage::{keys, KvStore};
use crate::twin::cloud::{CloudSync, ReportedOutcome};
use crate::twin::merge;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Default)]
struct QueueEntry {
    pending: Option<Value>,
    last_attempt: Option<Instant>,
    retry_at: Option<Instant>,
}

pub struct ReportedQueue {
    store: Arc<dyn KvStore>,
    cloud: Arc<dyn CloudSync>,
    locks: KeyedLockTable,
    entries: RwLock<HashMap<String, QueueEntry>>,
    drain_signal: Notify,
    stop: Notify,
    stopped: AtomicBool,
    drainer: Mutex<Option<JoinHandle<()>>>,
    min_sync_interval: Duration,
    backoff: Duration,
    cloud_timeout: Duration,
}

impl ReportedQueue {
    /// Build the queue, restoring pending patches persisted by a previous
    /// run. Call [`ReportedQueue::start`] afterwards to begin draining.
    pub async fn new(
        store: Arc<dyn KvStore>,
        cloud: Arc<dyn CloudSync>,
        config: &GatewayConfig,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(GatewayError::Config)?;

        let mut persisted = Vec::new();
        store
            .iterate(keys::REPORTED_PREFIX, &mut |key, value| {
                persisted.push((
                    keys::id_from_key(key, keys::REPORTED_PREFIX).to_string(),
                    value.to_vec(),
                ));
            })
            .await?;

        let mut entries = HashMap::new();
        for (id, bytes) in persisted {
            match serde_json::from_slice(&bytes) {
                Ok(patch) => {
                    entries.insert(
                        id,
                        QueueEntry {
                            pending: Some(patch),
                            ..QueueEntry::default()
                        },
                    );
                }
                Err(e) => warn!("Discarding unreadable pending patch for {}: {}", id, e),
            }
        }
        if !entries.is_empty() {
            info!("Restored {} pending reported-property patches", entries.len());
        }

        Ok(Arc::new(Self {
            store,
            cloud,
            locks: KeyedLockTable::new(config.lock_stripes),
            entries: RwLock::new(entries),
            drain_signal: Notify::new(),
            stop: Notify::new(),
            stopped: AtomicBool::new(false),
            drainer: Mutex::new(None),
            min_sync_interval: config.reported_sync_interval,
            backoff: config.reported_backoff,
            cloud_timeout: config.cloud_timeout,
        }))
    }

    /// Start the background drain task
    pub async fn start(self: Arc<Self>) {
        let queue = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = queue.stop.notified() => break,
                    _ = queue.drain_signal.notified() => {}
                    _ = tokio::time::sleep(queue.min_sync_interval) => {}
                }
                queue.drain_ready().await;
            }
            debug!("Reported-properties drain task stopped");
        });
        *self.drainer.lock().await = Some(handle);
    }

    /// Stop the drain task, allowing up to `grace` for an in-flight push.
    /// Later enqueues are refused; persisted pending state stays intact for
    /// the next run.
    pub async fn shutdown(&self, grace: Duration) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        if let Some(handle) = self.drainer.lock().await.take() {
            let mut handle = handle;
            if timeout(grace, &mut handle).await.is_err() {
                warn!("Drain task did not stop within grace period, aborting");
                handle.abort();
            }
        }
    }

    /// Merge `patch` into the pending buffer for `id` and persist it. The
    /// patch is not acknowledged (an error is returned) if it cannot be
    /// persisted.
    pub async fn enqueue(&self, id: &str, patch: &Value) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GatewayError::Shutdown);
        }
        let _guard = self.locks.acquire(id).await;

        let merged = {
            let entries = self.entries.read().await;
            match entries.get(id).and_then(|e| e.pending.clone()) {
                Some(mut pending) => {
                    merge::merge(&mut pending, patch);
                    pending
                }
                None => patch.clone(),
            }
        };
        self.store
            .put(&keys::reported_key(id), serde_json::to_vec(&merged)?)
            .await?;

        let mut entries = self.entries.write().await;
        entries.entry(id.to_string()).or_default().pending = Some(merged);
        Ok(())
    }

    /// Schedule an asynchronous drain. Multiple calls coalesce: the signal
    /// holds a single slot and the task drains every pending id per pass.
    pub fn initiate_sync(&self, _id: &str) {
        self.drain_signal.notify_one();
    }

    /// Drain every id with a pending patch, ignoring interval gating
    pub async fn sync_all(&self) {
        for id in self.pending_ids().await {
            self.drain_one(&id, true).await;
        }
    }

    /// Drain one id immediately (used on client reconnection)
    pub async fn drain(&self, id: &str) {
        self.drain_one(id, true).await;
    }

    /// True when a pending patch is buffered for `id`
    pub async fn has_pending(&self, id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.pending.is_some())
            .unwrap_or(false)
    }

    async fn pending_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.pending.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn drain_ready(&self) {
        for id in self.pending_ids().await {
            self.drain_one(&id, false).await;
        }
    }

    async fn drain_one(&self, id: &str, force: bool) {
        // Take the pending patch under the id's lock; the RPC itself runs
        // outside it so new updates can keep merging in.
        let patch = {
            let _guard = self.locks.acquire(id).await;
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            if !force && !entry_due(entry, self.min_sync_interval) {
                return;
            }
            let Some(patch) = entry.pending.take() else {
                return;
            };
            entry.last_attempt = Some(Instant::now());
            entry.retry_at = None;
            patch
        };

        let outcome = match timeout(self.cloud_timeout, self.cloud.update_reported(id, &patch)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Reported-properties push for {} timed out", id);
                ReportedOutcome::Transient
            }
        };

        match outcome {
            ReportedOutcome::Accepted => {
                debug!("Drained reported properties for {}", id);
                self.persist_current(id).await;
            }
            ReportedOutcome::Transient => {
                warn!(
                    "Transient failure pushing reported properties for {}, retrying in {:?}",
                    id, self.backoff
                );
                {
                    let _guard = self.locks.acquire(id).await;
                    let mut entries = self.entries.write().await;
                    let entry = entries.entry(id.to_string()).or_default();
                    // Patches that arrived during the RPC merge on top of the copy
                    let mut restored = patch;
                    if let Some(newer) = entry.pending.take() {
                        merge::merge(&mut restored, &newer);
                    }
                    entry.pending = Some(restored);
                    entry.retry_at = Some(Instant::now() + self.backoff);
                }
                self.persist_current(id).await;
            }
            ReportedOutcome::Permanent => {
                warn!(
                    "Cloud permanently rejected reported properties for {}, dropping the patch",
                    id
                );
                self.persist_current(id).await;
            }
        }
    }

    // Bring `reported/<id>` in line with the in-memory pending state.
    async fn persist_current(&self, id: &str) {
        let _guard = self.locks.acquire(id).await;
        let pending = {
            let entries = self.entries.read().await;
            entries.get(id).and_then(|e| e.pending.clone())
        };
        let result = match pending {
            Some(patch) => match serde_json::to_vec(&patch) {
                Ok(bytes) => self.store.put(&keys::reported_key(id), bytes).await,
                Err(e) => Err(e.into()),
            },
            None => self.store.remove(&keys::reported_key(id)).await,
        };
        if let Err(e) = result {
            error!("Failed to persist reported-queue state for {}: {}", id, e);
        }
    }
}

fn entry_due(entry: &QueueEntry, min_interval: Duration) -> bool {
    if let Some(retry_at) = entry.retry_at {
        if retry_at > Instant::now() {
            return false;
        }
    }
    if let Some(last) = entry.last_attempt {
        if last.elapsed() < min_interval {
            return false;
        }
    }
    true
}
