/// Twin manager tests
///
/// End-to-end twin flows over in-memory fakes: cloud-first reads with store
/// fallback, desired version arbitration, reported updates feeding the
/// upstream queue, and reconnection resync with delta fanout.
/// Run with: cargo test --test twin_manager_tests

use async_trait::async_trait;
use edgetwin::connection::{ConnectionManager, DeviceProxy, Subscription};
use edgetwin::core::GatewayConfig;
use edgetwin::storage::{KvStore, MemoryStore};
use edgetwin::twin::{CloudSync, ReportedOutcome, ReportedQueue, Twin, TwinManager, TwinStore};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeCloud {
    twin: Mutex<Option<Twin>>,
    unreachable: AtomicBool,
    get_calls: AtomicUsize,
    pushes: Mutex<Vec<(String, Value)>>,
}

impl FakeCloud {
    fn set_twin(&self, twin: Twin) {
        *self.twin.lock().unwrap() = Some(twin);
    }

    fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloudSync for FakeCloud {
    async fn get_twin(&self, _id: &str) -> Option<Twin> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return None;
        }
        self.twin.lock().unwrap().clone()
    }

    async fn update_reported(&self, id: &str, patch: &Value) -> ReportedOutcome {
        self.pushes
            .lock()
            .unwrap()
            .push((id.to_string(), patch.clone()));
        ReportedOutcome::Accepted
    }
}

struct RecordingProxy {
    received: Mutex<Vec<Value>>,
}

#[async_trait]
impl DeviceProxy for RecordingProxy {
    async fn on_desired_update(&self, patch: Value) -> edgetwin::Result<()> {
        self.received.lock().unwrap().push(patch);
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnections {
    subscribed: Mutex<HashSet<String>>,
    proxies: Mutex<HashMap<String, Arc<RecordingProxy>>>,
}

impl FakeConnections {
    fn connect(&self, id: &str, subscribe: bool) -> Arc<RecordingProxy> {
        let proxy = Arc::new(RecordingProxy {
            received: Mutex::new(Vec::new()),
        });
        self.proxies
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&proxy));
        if subscribe {
            self.subscribed.lock().unwrap().insert(id.to_string());
        }
        proxy
    }
}

impl ConnectionManager for FakeConnections {
    fn is_subscribed(&self, id: &str, _topic: Subscription) -> bool {
        self.subscribed.lock().unwrap().contains(id)
    }

    fn get_proxy(&self, id: &str) -> Option<Arc<dyn DeviceProxy>> {
        self.proxies
            .lock()
            .unwrap()
            .get(id)
            .map(|p| Arc::clone(p) as Arc<dyn DeviceProxy>)
    }

    fn connected_clients(&self) -> Vec<String> {
        self.proxies.lock().unwrap().keys().cloned().collect()
    }
}

struct Fixture {
    manager: TwinManager,
    cloud: Arc<FakeCloud>,
    connections: Arc<FakeConnections>,
    queue: Arc<ReportedQueue>,
    kv: Arc<MemoryStore>,
}

async fn fixture() -> Fixture {
    let config = GatewayConfig::new();
    let kv = Arc::new(MemoryStore::new());
    let cloud = Arc::new(FakeCloud::default());
    let connections = Arc::new(FakeConnections::default());
    let queue = ReportedQueue::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::clone(&cloud) as Arc<dyn CloudSync>,
        &config,
    )
    .await
    .unwrap();
    let manager = TwinManager::new(
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::clone(&cloud) as Arc<dyn CloudSync>,
        Arc::clone(&connections) as Arc<dyn ConnectionManager>,
        Arc::clone(&queue),
        &config,
    )
    .unwrap();
    Fixture {
        manager,
        cloud,
        connections,
        queue,
        kv,
    }
}

fn desired_twin(version: i64, body: Value) -> Twin {
    let mut doc = body;
    doc["$version"] = json!(version);
    Twin::new(
        edgetwin::Collection::from_value(doc),
        edgetwin::Collection::new(),
    )
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn get_twin_prefers_cloud_and_stores_it() {
    let f = fixture().await;
    f.cloud.set_twin(desired_twin(3, json!({ "color": "red" })));

    let twin = f.manager.get_twin("d1").await.unwrap();
    assert_eq!(twin.desired().version(), 3);

    // stored copy is now served without the cloud
    f.cloud.set_unreachable(true);
    let cached = f.manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(cached.desired().value()["color"], json!("red"));
}

#[tokio::test]
async fn get_twin_falls_back_to_store_when_cloud_unreachable() {
    let f = fixture().await;
    f.cloud.set_twin(desired_twin(3, json!({ "a": 1 })));
    f.manager.get_twin("d1").await.unwrap();

    f.cloud.set_unreachable(true);
    let twin = f.manager.get_twin("d1").await.unwrap();
    assert_eq!(twin.desired().version(), 3);
}

#[tokio::test]
async fn get_twin_synthesizes_empty_twin_when_nothing_known() {
    let f = fixture().await;
    f.cloud.set_unreachable(true);
    let twin = f.manager.get_twin("unknown").await.unwrap();
    assert_eq!(twin.desired().version(), 0);
    assert_eq!(twin.reported().version(), 0);
}

// ============================================================================
// Desired updates
// ============================================================================

#[tokio::test]
async fn in_order_desired_patch_applies_and_fans_out() {
    let f = fixture().await;
    let proxy = f.connections.connect("d1", true);
    f.cloud.set_twin(desired_twin(1, json!({ "a": 1 })));
    f.manager.get_twin("d1").await.unwrap();

    f.manager
        .update_desired("d1", &json!({ "$version": 2, "a": 2 }))
        .await
        .unwrap();

    let stored = f.manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.desired().version(), 2);
    assert_eq!(stored.desired().value()["a"], json!(2));

    let received = proxy.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["$version"], json!(2));
}

#[tokio::test]
async fn stale_desired_patch_is_ignored() {
    let f = fixture().await;
    let proxy = f.connections.connect("d1", true);
    f.cloud.set_twin(desired_twin(5, json!({ "a": 1 })));
    f.manager.get_twin("d1").await.unwrap();

    f.manager
        .update_desired("d1", &json!({ "$version": 4, "a": 99 }))
        .await
        .unwrap();

    let stored = f.manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.desired().version(), 5);
    assert_eq!(stored.desired().value()["a"], json!(1));
    assert!(proxy.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn version_gap_triggers_resync_and_delta_fanout() {
    let f = fixture().await;
    let proxy = f.connections.connect("d1", true);

    // seed the store at v5 without touching lastSync
    let twins = TwinStore::new(Arc::clone(&f.kv) as Arc<dyn KvStore>);
    twins
        .put("d1", &desired_twin(5, json!({ "a": 1, "old": true })))
        .await
        .unwrap();

    // cloud has moved on to v9
    f.cloud
        .set_twin(desired_twin(9, json!({ "a": 2, "fresh": "yes" })));

    f.manager
        .update_desired("d1", &json!({ "$version": 7, "a": 9 }))
        .await
        .unwrap();

    // store now holds the cloud twin
    let stored = f.manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.desired().version(), 9);

    // the client got the computed delta, not the gap patch
    let received = proxy.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["a"], json!(2));
    assert_eq!(received[0]["fresh"], json!("yes"));
    assert_eq!(received[0]["old"], json!(null));
    assert_eq!(received[0]["$version"], json!(9));
}

#[tokio::test]
async fn fanout_is_suppressed_without_subscription() {
    let f = fixture().await;
    let proxy = f.connections.connect("d1", false);
    f.manager
        .update_desired("d1", &json!({ "$version": 1, "a": 1 }))
        .await
        .unwrap();

    // store updated, nothing delivered
    assert!(f.manager.get_cached_twin("d1").await.unwrap().is_some());
    assert!(proxy.received.lock().unwrap().is_empty());
}

// ============================================================================
// Reported updates
// ============================================================================

#[tokio::test]
async fn reported_updates_merge_and_drain_in_one_push() {
    let f = fixture().await;
    f.manager
        .update_reported("d1", &json!({ "a": 1 }))
        .await
        .unwrap();
    f.manager
        .update_reported("d1", &json!({ "b": 2 }))
        .await
        .unwrap();

    let stored = f.manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.reported().version(), 2);
    assert_eq!(stored.reported().value()["a"], json!(1));
    assert_eq!(stored.reported().value()["b"], json!(2));

    f.queue.sync_all().await;
    let pushes = f.cloud.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].1["a"], json!(1));
    assert_eq!(pushes[0].1["b"], json!(2));
}

#[tokio::test]
async fn invalid_reported_patch_is_rejected_without_mutation() {
    let f = fixture().await;
    let result = f.manager.update_reported("d1", &json!({ "$bad": 1 })).await;
    assert!(result.is_err());
    assert!(f.manager.get_cached_twin("d1").await.unwrap().is_none());
    assert!(!f.queue.has_pending("d1").await);
}

#[tokio::test]
async fn concurrent_reported_updates_keep_both_changes() {
    let f = Arc::new(fixture().await);
    let mut handles = Vec::new();
    for i in 0..10 {
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move {
            let mut patch = serde_json::Map::new();
            patch.insert(format!("k{}", i), json!(i));
            f.manager
                .update_reported("d1", &Value::Object(patch))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stored = f.manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.reported().version(), 10);
    for i in 0..10 {
        let key = format!("k{}", i);
        assert_eq!(stored.reported().value()[key.as_str()], json!(i));
    }
}

// ============================================================================
// Reconnection resync
// ============================================================================

#[tokio::test]
async fn reconnect_drains_pending_and_resyncs_missed_desired_changes() {
    let f = fixture().await;

    // offline activity: reported update queued, cloud desired moved 5 -> 9
    let twins = TwinStore::new(Arc::clone(&f.kv) as Arc<dyn KvStore>);
    twins
        .put("d1", &desired_twin(5, json!({ "speed": 10 })))
        .await
        .unwrap();
    f.manager
        .update_reported("d1", &json!({ "status": "recovering" }))
        .await
        .unwrap();
    f.cloud.set_twin(desired_twin(9, json!({ "speed": 50 })));

    let proxy = f.connections.connect("d1", true);
    f.manager.on_device_connected().await;

    // pending reported properties went upstream
    let pushes = f.cloud.pushes.lock().unwrap();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].1["status"], json!("recovering"));
    drop(pushes);

    // the twin caught up and the delta reached the client
    let stored = f.manager.get_cached_twin("d1").await.unwrap().unwrap();
    assert_eq!(stored.desired().version(), 9);
    let received = proxy.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["speed"], json!(50));
}

#[tokio::test]
async fn resync_is_throttled_by_min_sync_period() {
    let f = fixture().await;
    f.connections.connect("d1", true);
    f.cloud.set_twin(desired_twin(1, json!({ "a": 1 })));
    f.manager.get_twin("d1").await.unwrap();
    assert_eq!(f.cloud.get_calls.load(Ordering::SeqCst), 1);

    // synced moments ago, so the reconnect resync is skipped
    f.manager.resync("d1").await.unwrap();
    assert_eq!(f.cloud.get_calls.load(Ordering::SeqCst), 1);
}
