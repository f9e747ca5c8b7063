//! Local client connection interfaces
//!
//! The transport layer owns sockets, sessions, and retry/QoS. The core only
//! needs to know who is connected, what they subscribe to, and how to hand
//! them a desired-properties patch.

use crate::core::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Topics a local client can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscription {
    DesiredPropertyUpdates,
}

/// Outbound channel to one locally connected client
#[async_trait]
pub trait DeviceProxy: Send + Sync {
    /// Deliver a desired-properties patch. Failures are the transport's
    /// problem; the caller logs and never retries synchronously.
    async fn on_desired_update(&self, patch: Value) -> Result<()>;
}

/// Connection state as seen by the transport layer
pub trait ConnectionManager: Send + Sync {
    /// Does `id` currently subscribe to `topic`?
    fn is_subscribed(&self, id: &str, topic: Subscription) -> bool;

    /// Outbound proxy for `id`, if it is connected
    fn get_proxy(&self, id: &str) -> Option<Arc<dyn DeviceProxy>>;

    /// Ids of all currently connected local clients
    fn connected_clients(&self) -> Vec<String>;
}
