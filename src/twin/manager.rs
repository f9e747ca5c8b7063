//! Twin manager
//!
//! Front door for all twin operations: reads that prefer the cloud and fall
//! back to the store, desired-property updates with version arbitration,
//! reported-property updates feeding the upstream queue, and the
//! resync-and-fanout path that catches clients up after a disconnection.

use crate::connection::{ConnectionManager, Subscription};
use crate::core::{GatewayConfig, GatewayError, KeyedLockTable, Result};
use crate::storage::KvStore;
use crate::twin::cloud::CloudSync;
use crate::twin::merge;
use crate::twin::model::{Twin, VERSION_KEY};
use crate::twin::reported::ReportedQueue;
use crate::twin::store::TwinStore;
use crate::twin::validation;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;

pub struct TwinManager {
    twins: TwinStore,
    queue: Arc<ReportedQueue>,
    cloud: Arc<dyn CloudSync>,
    connections: Arc<dyn ConnectionManager>,
    locks: KeyedLockTable,
    last_sync: RwLock<HashMap<String, Instant>>,
    min_sync_period: Duration,
    cloud_timeout: Duration,
}

impl TwinManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        cloud: Arc<dyn CloudSync>,
        connections: Arc<dyn ConnectionManager>,
        queue: Arc<ReportedQueue>,
        config: &GatewayConfig,
    ) -> Result<Self> {
        config.validate().map_err(GatewayError::Config)?;

        Ok(Self {
            twins: TwinStore::new(store),
            queue,
            cloud,
            connections,
            locks: KeyedLockTable::new(config.lock_stripes),
            last_sync: RwLock::new(HashMap::new()),
            min_sync_period: config.min_twin_sync_period,
            cloud_timeout: config.cloud_timeout,
        })
    }

    /// Read the twin for `id`: cloud first, stored twin when unreachable, a
    /// synthesized empty twin when nothing is stored either.
    pub async fn get_twin(&self, id: &str) -> Result<Twin> {
        match self.fetch_cloud_twin(id).await {
            Some(twin) => {
                {
                    let _guard = self.locks.acquire(id).await;
                    self.twins.put(id, &twin).await?;
                }
                self.mark_synced(id).await;
                Ok(twin)
            }
            None => {
                debug!("Cloud unreachable reading twin for {}, serving store", id);
                Ok(self.twins.get(id).await?.unwrap_or_default())
            }
        }
    }

    /// Stored twin only; no cloud round-trip
    pub async fn get_cached_twin(&self, id: &str) -> Result<Option<Twin>> {
        self.twins.get(id).await
    }

    /// Apply a cloud-produced desired-properties patch.
    ///
    /// In-order patches (`$version` exactly one past the stored version)
    /// merge directly; stale patches are ignored; a version gap falls back to
    /// a full resync. The patch is fanned out to the client when it
    /// subscribes to desired updates.
    pub async fn update_desired(&self, id: &str, patch: &Value) -> Result<()> {
        let patch_version = patch.get(VERSION_KEY).and_then(Value::as_i64).unwrap_or(0);

        let stored_version = {
            let guard = self.locks.acquire(id).await;
            match self.twins.get(id).await? {
                Some(stored) => {
                    let stored_version = stored.desired().version();
                    if patch_version <= stored_version {
                        debug!(
                            "Ignoring desired patch v{} for {} (stored v{})",
                            patch_version, id, stored_version
                        );
                        return Ok(());
                    }
                    if patch_version != stored_version + 1 {
                        drop(guard);
                        info!(
                            "Desired version gap for {} (stored v{}, patch v{}), resyncing",
                            id, stored_version, patch_version
                        );
                        return self.resync(id).await;
                    }
                    self.twins.apply_desired(id, patch).await?;
                    Some(stored_version)
                }
                None => {
                    self.twins.apply_desired(id, patch).await?;
                    None
                }
            }
        };
        debug!(
            "Applied desired patch v{} for {} (previous {:?})",
            patch_version, id, stored_version
        );
        self.send_desired_patch(id, patch).await;
        Ok(())
    }

    /// Apply a locally produced reported-properties patch and queue it for
    /// upstream transmission.
    pub async fn update_reported(&self, id: &str, patch: &Value) -> Result<()> {
        validation::validate_reported_patch(patch)?;
        {
            let _guard = self.locks.acquire(id).await;
            self.twins.apply_reported(id, patch).await?;
        }
        self.queue.enqueue(id, patch).await?;
        self.queue.initiate_sync(id);
        Ok(())
    }

    /// Upstream connectivity returned: drain pending reported properties and
    /// resync the twin of every locally connected client.
    pub async fn on_device_connected(&self) {
        let clients = self.connections.connected_clients();
        info!("Connectivity restored, resyncing {} local clients", clients.len());
        let tasks = clients.iter().map(|id| async move {
            self.queue.drain(id).await;
            if let Err(e) = self.resync(id).await {
                warn!("Resync failed for {}: {}", id, e);
            }
        });
        futures::future::join_all(tasks).await;
    }

    /// Pull the authoritative twin from the cloud and push any missed
    /// desired-property changes to the client. Throttled per id by the
    /// minimum sync period; silently aborted when the cloud is unreachable.
    pub async fn resync(&self, id: &str) -> Result<()> {
        if !self.sync_due(id).await {
            debug!("Resync for {} skipped, synced recently", id);
            return Ok(());
        }

        let delta = {
            let _guard = self.locks.acquire(id).await;
            let stored = self.twins.get(id).await?.unwrap_or_default();
            let Some(cloud_twin) = self.fetch_cloud_twin(id).await else {
                warn!("Cloud unreachable, aborting resync for {}", id);
                return Ok(());
            };
            self.twins.put(id, &cloud_twin).await?;

            let mut delta = stored.desired().diff(cloud_twin.desired());
            if let Some(obj) = delta.as_object_mut() {
                obj.insert(
                    VERSION_KEY.to_string(),
                    json!(cloud_twin.desired().version()),
                );
            }
            delta
        };
        self.mark_synced(id).await;

        if merge::is_empty_patch(&delta) {
            debug!("Resync for {} found no desired changes", id);
        } else {
            self.send_desired_patch(id, &delta).await;
        }
        Ok(())
    }

    /// Deliver a desired-properties patch to the local client if it
    /// subscribes to desired updates; otherwise a no-op.
    pub async fn send_desired_patch(&self, id: &str, patch: &Value) {
        if !self
            .connections
            .is_subscribed(id, Subscription::DesiredPropertyUpdates)
        {
            debug!("{} has no desired-update subscription, suppressing fanout", id);
            return;
        }
        let Some(proxy) = self.connections.get_proxy(id) else {
            debug!("No proxy for {}, suppressing fanout", id);
            return;
        };
        // The transport owns retry/QoS; fire once and log.
        if let Err(e) = proxy.on_desired_update(patch.clone()).await {
            warn!("Failed to deliver desired update to {}: {}", id, e);
        }
    }

    async fn fetch_cloud_twin(&self, id: &str) -> Option<Twin> {
        match timeout(self.cloud_timeout, self.cloud.get_twin(id)).await {
            Ok(twin) => twin,
            Err(_) => {
                warn!("Cloud twin fetch for {} timed out", id);
                None
            }
        }
    }

    async fn sync_due(&self, id: &str) -> bool {
        match self.last_sync.read().await.get(id) {
            Some(last) => last.elapsed() > self.min_sync_period,
            None => true,
        }
    }

    async fn mark_synced(&self, id: &str) {
        self.last_sync
            .write()
            .await
            .insert(id.to_string(), Instant::now());
    }
}
