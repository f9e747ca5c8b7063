// ============================================================================
// EdgeTwin Library
// ============================================================================

pub mod connection;
pub mod core;
pub mod identity;
pub mod storage;
pub mod twin;

// Re-export main types for convenience
pub use crate::connection::{ConnectionManager, DeviceProxy, Subscription};
pub use crate::core::{GatewayConfig, GatewayError, KeyedLockTable, Result};
pub use crate::identity::{
    AuthChain, AuthType, IdentityChange, IdentityHierarchy, IdentityKind, IdentityPager,
    IdentityStatus, ScopeCache, ServiceIdentity, ServiceProxy, StoredIdentity,
};
pub use crate::storage::{FileStore, KvStore, MemoryStore};
pub use crate::twin::{
    CloudSync, Collection, ReportedOutcome, ReportedQueue, Twin, TwinManager, TwinStore,
};
