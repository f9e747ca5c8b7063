//! Identity scope cache
//!
//! Authoritative local view of the identities allowed to connect through
//! this gateway. A singleton refresher task re-enumerates the scope from the
//! remote identity service, on a period or on demand; targeted lookups
//! refresh single identities between cycles. Every observable change is
//! published on a broadcast channel, dispatched inside the write critical
//! section so subscribers see changes in write order.

use crate::core::{GatewayConfig, GatewayError, Result};
use crate::identity::hierarchy::IdentityHierarchy;
use crate::identity::model::{
    split_module_id, AuthChain, AuthType, ServiceIdentity, StoredIdentity,
};
use crate::identity::proxy::ServiceProxy;
use crate::storage::{keys, KvStore};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Observable scope transition
#[derive(Debug, Clone)]
pub enum IdentityChange {
    /// Structurally new or changed identity
    Updated(ServiceIdentity),
    /// Previously enabled identity no longer in scope
    Removed(String),
}

#[derive(Default)]
struct RefreshTimestamps {
    last_cycle_started: Option<Instant>,
    last_cycle_completed: Option<Instant>,
    per_id: std::collections::HashMap<String, Instant>,
}

pub struct ScopeCache {
    store: Arc<dyn KvStore>,
    proxy: Arc<dyn ServiceProxy>,
    /// Guards the hierarchy and its persisted mirror together
    hierarchy: Mutex<IdentityHierarchy>,
    events: broadcast::Sender<IdentityChange>,
    timestamps: Mutex<RefreshTimestamps>,
    refresh_signal: Notify,
    /// Set when a cycle completes, reset when a fresh one is requested
    refresh_complete: watch::Sender<bool>,
    refresh_delay: Duration,
    refresh_interval: Duration,
    stop: Notify,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl ScopeCache {
    /// Load the persisted scope into memory and start the refresher task.
    /// `gateway_id` is the device identity of this gateway, the mandatory
    /// root of every auth chain.
    pub async fn start(
        store: Arc<dyn KvStore>,
        proxy: Arc<dyn ServiceProxy>,
        gateway_id: &str,
        config: &GatewayConfig,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(GatewayError::Config)?;

        let mut hierarchy = IdentityHierarchy::new(gateway_id);
        let mut persisted = Vec::new();
        store
            .iterate(keys::IDENTITY_PREFIX, &mut |key, value| {
                persisted.push((key.to_string(), value.to_vec()));
            })
            .await?;

        let mut loaded = 0usize;
        for (key, bytes) in persisted {
            match rmp_serde::from_slice::<StoredIdentity>(&bytes) {
                Ok(stored) => {
                    if let Some(identity) = stored.identity {
                        hierarchy.insert_or_update(identity);
                        loaded += 1;
                    }
                }
                Err(e) => warn!("Discarding unreadable cached identity at {}: {}", key, e),
            }
        }
        info!("Loaded {} identities into the scope cache", loaded);

        let (refresh_complete, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = Arc::new(Self {
            store,
            proxy,
            hierarchy: Mutex::new(hierarchy),
            events,
            timestamps: Mutex::new(RefreshTimestamps::default()),
            refresh_signal: Notify::new(),
            refresh_complete,
            refresh_delay: config.identity_refresh_delay,
            refresh_interval: config.identity_refresh_interval,
            stop: Notify::new(),
            refresher: Mutex::new(None),
        });

        let task = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                loop {
                    cache.refresh_cycle().await;
                    tokio::select! {
                        _ = cache.stop.notified() => break,
                        _ = cache.refresh_signal.notified() => {}
                        _ = tokio::time::sleep(cache.refresh_interval) => {}
                    }
                }
                debug!("Scope refresher task stopped");
            })
        };
        *cache.refresher.lock().await = Some(task);
        Ok(cache)
    }

    /// Stop the refresher task
    pub async fn shutdown(&self, grace: Duration) {
        self.stop.notify_one();
        if let Some(handle) = self.refresher.lock().await.take() {
            let mut handle = handle;
            if timeout(grace, &mut handle).await.is_err() {
                warn!("Scope refresher did not stop within grace period, aborting");
                handle.abort();
            }
        }
    }

    /// Subscribe to scope change events
    pub fn subscribe(&self) -> broadcast::Receiver<IdentityChange> {
        self.events.subscribe()
    }

    /// Request a full refresh cycle. Requests inside the debounce window
    /// collapse into the previous cycle and complete immediately.
    pub async fn initiate_refresh(&self) {
        {
            let mut timestamps = self.timestamps.lock().await;
            if let Some(started) = timestamps.last_cycle_started {
                if started.elapsed() < self.refresh_delay {
                    debug!("Scope refresh request debounced");
                    drop(timestamps);
                    self.refresh_complete.send_replace(true);
                    return;
                }
            }
            timestamps.last_cycle_started = Some(Instant::now());
        }
        self.refresh_complete.send_replace(false);
        self.refresh_signal.notify_one();
    }

    /// Wait until the pending refresh completes. Returns immediately when no
    /// refresh is outstanding.
    pub async fn wait_refresh_complete(&self) {
        let mut done = self.refresh_complete.subscribe();
        let _ = done.wait_for(|complete| *complete).await;
    }

    /// Refresh a single identity from the service, gated by the per-id
    /// refresh delay. Identities cached without credentials are always
    /// refreshed; they may have been created first and upgraded later.
    pub async fn refresh_identity(&self, id: &str) {
        if !self.should_refresh(id).await {
            debug!("Identity {} refreshed recently, skipping lookup", id);
            return;
        }
        let result = match split_module_id(id) {
            Some((device_id, module_id)) => {
                self.proxy.get_identity(device_id, Some(module_id)).await
            }
            None => self.proxy.get_identity(id, None).await,
        };
        let outcome = match result {
            Some(identity) => self.upsert(identity).await,
            None => self.remove_and_tombstone(id).await,
        };
        if let Err(e) = outcome {
            error!("Failed to apply identity refresh for {}: {}", id, e);
        }
        self.timestamps
            .lock()
            .await
            .per_id
            .insert(id.to_string(), Instant::now());
    }

    /// Refresh every id on an auth chain, target first
    pub async fn refresh_auth_chain(&self, chain: &str) {
        for id in AuthChain::parse(chain).ids() {
            self.refresh_identity(id).await;
        }
    }

    pub async fn get_service_identity(&self, id: &str) -> Option<ServiceIdentity> {
        self.hierarchy.lock().await.get(id).cloned()
    }

    pub async fn get_auth_chain(&self, id: &str) -> Option<AuthChain> {
        self.hierarchy.lock().await.get_auth_chain(id)
    }

    pub async fn get_immediate_children(&self, device_id: &str) -> Vec<ServiceIdentity> {
        self.hierarchy.lock().await.get_immediate_children(device_id)
    }

    /// When the last full refresh cycle finished, if any has
    pub async fn last_refresh_completed(&self) -> Option<Instant> {
        self.timestamps.lock().await.last_cycle_completed
    }

    async fn refresh_cycle(&self) {
        self.timestamps.lock().await.last_cycle_started = Some(Instant::now());

        let mut pager = self.proxy.identities();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(page) = pager.next().await {
            for identity in page {
                seen.insert(identity.id.clone());
                if let Err(e) = self.upsert(identity).await {
                    error!("Failed to cache identity during refresh: {}", e);
                }
            }
        }

        let cached: Vec<String> = self.hierarchy.lock().await.get_all_ids();
        for id in cached.into_iter().filter(|id| !seen.contains(id)) {
            if let Err(e) = self.remove_and_tombstone(&id).await {
                error!("Failed to evict {} from the scope cache: {}", id, e);
            }
        }

        self.timestamps.lock().await.last_cycle_completed = Some(Instant::now());
        self.refresh_complete.send_replace(true);
        debug!("Scope refresh cycle complete, {} identities in scope", seen.len());
    }

    // Persist-then-insert under the hierarchy lock; the change event is
    // dispatched inside the same critical section.
    async fn upsert(&self, identity: ServiceIdentity) -> Result<()> {
        let mut hierarchy = self.hierarchy.lock().await;
        let changed = hierarchy.get(&identity.id) != Some(&identity);
        let stored = StoredIdentity::present(identity.clone());
        self.store
            .put(&keys::identity_key(&identity.id), rmp_serde::to_vec(&stored)?)
            .await?;
        hierarchy.insert_or_update(identity.clone());
        if changed {
            let _ = self.events.send(IdentityChange::Updated(identity));
        }
        Ok(())
    }

    async fn remove_and_tombstone(&self, id: &str) -> Result<()> {
        let mut hierarchy = self.hierarchy.lock().await;
        let previous = hierarchy.get(id).cloned();
        let stored = StoredIdentity::tombstone(id);
        self.store
            .put(&keys::identity_key(id), rmp_serde::to_vec(&stored)?)
            .await?;
        hierarchy.remove(id);
        if previous.map(|p| p.is_enabled()).unwrap_or(false) {
            let _ = self.events.send(IdentityChange::Removed(id.to_string()));
        }
        Ok(())
    }

    async fn should_refresh(&self, id: &str) -> bool {
        let uncredentialed = self
            .hierarchy
            .lock()
            .await
            .get(id)
            .map(|i| i.auth_type == AuthType::None)
            .unwrap_or(false);
        if uncredentialed {
            return true;
        }
        match self.timestamps.lock().await.per_id.get(id) {
            Some(refreshed) => refreshed.elapsed() > self.refresh_delay,
            None => true,
        }
    }
}
