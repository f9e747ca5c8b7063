use crate::core::Result;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;

/// Key-value store trait - allows pluggable storage backends
///
/// Successful `put`/`remove` returns mean the write is durable as far as the
/// backend guarantees durability.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key` if present
    async fn remove(&self, key: &str) -> Result<()>;

    /// Visit every entry whose key starts with `prefix`
    ///
    /// Written out as a manually-desugared `async_trait` signature (rather
    /// than `async fn`) because the macro rewrites the elided lifetimes
    /// inside `dyn FnMut(&str, &[u8])` into named, non-higher-ranked
    /// lifetimes, which then fails to borrow-check against any value
    /// created inside the method body.
    fn iterate<'life0, 'life1, 'life2, 'async_trait>(
        &'life0 self,
        prefix: &'life1 str,
        visit: &'life2 mut (dyn FnMut(&str, &[u8]) + Send),
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        'life2: 'async_trait,
        Self: 'async_trait;

    /// Flush and release the backend
    async fn close(&self) -> Result<()>;
}
