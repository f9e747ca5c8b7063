//! Durable twin store
//!
//! One store entry per client id holds the full twin. Mutating operations
//! merge-then-write; callers serialize access per id through the twin key
//! lock owned by the manager, so a load-merge-store sequence here is never
//! interleaved with another writer for the same id.

use crate::core::Result;
use crate::storage::{keys, KvStore};
use crate::twin::model::{Collection, Twin};
use crate::twin::validation;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

pub struct TwinStore {
    store: Arc<dyn KvStore>,
}

impl TwinStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Read the stored twin for `id`
    pub async fn get(&self, id: &str) -> Result<Option<Twin>> {
        match self.store.get(&keys::twin_key(id)).await? {
            Some(bytes) => Ok(Some(Twin::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replace the stored twin for `id`
    pub async fn put(&self, id: &str, twin: &Twin) -> Result<()> {
        self.store.put(&keys::twin_key(id), twin.to_bytes()?).await
    }

    /// Merge a desired-properties patch into the stored twin. A missing twin
    /// is created with a default reported side.
    pub async fn apply_desired(&self, id: &str, patch: &Value) -> Result<Twin> {
        let mut twin = self.get(id).await?.unwrap_or_default();
        twin.desired_mut().apply_patch(patch);
        self.put(id, &twin).await?;
        Ok(twin)
    }

    /// Merge a reported-properties patch into the stored twin and bump the
    /// reported version. The merged document is validated against the size
    /// and version caps before anything is written.
    pub async fn apply_reported(&self, id: &str, patch: &Value) -> Result<Twin> {
        let mut twin = self.get(id).await?.unwrap_or_default();

        let mut merged: Collection = twin.reported().clone();
        merged.apply_patch(patch);
        let next_version = twin.reported().version() + 1;
        validation::validate_merged_document(merged.encoded_len()?, next_version)?;

        merged.set_version(next_version);
        merged.stamp_metadata(patch, next_version, Utc::now());
        *twin.reported_mut() = merged;
        self.put(id, &twin).await?;
        Ok(twin)
    }
}
