//! Twin document model
//!
//! A twin is a pair of property collections: `desired` (cloud to client) and
//! `reported` (client to cloud). On the wire both sit under a top-level
//! `properties` object, each carrying `$version` and a `$metadata` subtree
//! mirroring the property structure.

use crate::core::Result;
use crate::twin::merge;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const VERSION_KEY: &str = "$version";
pub const METADATA_KEY: &str = "$metadata";
pub const LAST_UPDATED_KEY: &str = "$lastUpdated";
pub const LAST_UPDATED_VERSION_KEY: &str = "$lastUpdatedVersion";

/// One side of a twin: a JSON object with `$version` and `$metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection {
    doc: Value,
}

impl Collection {
    /// Empty collection at version 0
    pub fn new() -> Self {
        Self {
            doc: json!({ VERSION_KEY: 0 }),
        }
    }

    pub fn from_value(doc: Value) -> Self {
        Self { doc }
    }

    pub fn value(&self) -> &Value {
        &self.doc
    }

    pub fn into_value(self) -> Value {
        self.doc
    }

    /// `$version` at the document root; 0 when absent
    pub fn version(&self) -> i64 {
        self.doc
            .get(VERSION_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn set_version(&mut self, version: i64) {
        if let Some(obj) = self.doc.as_object_mut() {
            obj.insert(VERSION_KEY.to_string(), json!(version));
        }
    }

    /// Merge `patch` into this collection (see [`merge::merge`])
    pub fn apply_patch(&mut self, patch: &Value) {
        merge::merge(&mut self.doc, patch);
    }

    /// Minimal patch turning this collection into `other`, modulo metadata
    pub fn diff(&self, other: &Collection) -> Value {
        merge::diff(&self.doc, &other.doc)
    }

    /// Encoded size of the document in bytes
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(serde_json::to_vec(&self.doc)?.len())
    }

    /// Record `$lastUpdated`/`$lastUpdatedVersion` for every leaf the patch
    /// touched, and drop metadata of removed leaves. The cloud stamps desired
    /// properties this way; we do the same for locally applied reported
    /// patches.
    pub fn stamp_metadata(&mut self, patch: &Value, version: i64, now: DateTime<Utc>) {
        let Some(patch_obj) = patch.as_object() else {
            return;
        };
        let Some(doc_obj) = self.doc.as_object_mut() else {
            return;
        };
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        let meta = doc_obj
            .entry(METADATA_KEY.to_string())
            .or_insert_with(|| json!({}));
        if !meta.is_object() {
            *meta = json!({});
        }
        let meta_obj = meta.as_object_mut().unwrap();
        stamp_level(meta_obj, patch_obj, &timestamp, version);
        meta_obj.insert(LAST_UPDATED_KEY.to_string(), json!(timestamp));
        meta_obj.insert(LAST_UPDATED_VERSION_KEY.to_string(), json!(version));
    }
}

fn stamp_level(meta: &mut Map<String, Value>, patch: &Map<String, Value>, timestamp: &str, version: i64) {
    for (key, patch_value) in patch {
        if key.starts_with('$') {
            continue;
        }
        if patch_value.is_null() {
            meta.remove(key);
            continue;
        }
        if let Some(patch_child) = patch_value.as_object() {
            let entry = meta.entry(key.clone()).or_insert_with(|| json!({}));
            if !entry.is_object() {
                *entry = json!({});
            }
            let entry_obj = entry.as_object_mut().unwrap();
            stamp_level(entry_obj, patch_child, timestamp, version);
            entry_obj.insert(LAST_UPDATED_KEY.to_string(), json!(timestamp));
            entry_obj.insert(LAST_UPDATED_VERSION_KEY.to_string(), json!(version));
        } else {
            meta.insert(
                key.clone(),
                json!({
                    LAST_UPDATED_KEY: timestamp,
                    LAST_UPDATED_VERSION_KEY: version,
                }),
            );
        }
    }
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable shadow document for one client
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Twin {
    #[serde(default)]
    pub properties: TwinProperties,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: Collection,
    #[serde(default)]
    pub reported: Collection,
}

impl Twin {
    pub fn new(desired: Collection, reported: Collection) -> Self {
        Self {
            properties: TwinProperties { desired, reported },
        }
    }

    pub fn desired(&self) -> &Collection {
        &self.properties.desired
    }

    pub fn desired_mut(&mut self) -> &mut Collection {
        &mut self.properties.desired
    }

    pub fn reported(&self) -> &Collection {
        &self.properties.reported
    }

    pub fn reported_mut(&mut self) -> &mut Collection {
        &mut self.properties.reported
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
