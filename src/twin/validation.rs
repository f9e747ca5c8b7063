//! Reported-properties patch validation
//!
//! Limits mirror the upstream service: patches over 8 KiB, nesting deeper
//! than 5 levels below the reported root, `$`-prefixed keys other than
//! `$metadata`, and keys containing `.`, `$`, space, or control characters
//! are all rejected before any state mutation.

use crate::core::{GatewayError, Result};
use crate::twin::model::METADATA_KEY;
use serde_json::Value;

pub const MAX_PATCH_BYTES: usize = 8 * 1024;
pub const MAX_DOCUMENT_BYTES: usize = 32 * 1024;
pub const MAX_NESTING_DEPTH: usize = 5;
pub const MAX_VERSION: i64 = i32::MAX as i64;

/// Validate an incoming reported-properties patch
pub fn validate_reported_patch(patch: &Value) -> Result<()> {
    if !patch.is_object() {
        return Err(GatewayError::Validation(
            "patch must be a JSON object".to_string(),
        ));
    }
    let encoded = serde_json::to_vec(patch)?;
    if encoded.len() > MAX_PATCH_BYTES {
        return Err(GatewayError::Validation(format!(
            "patch is {} bytes, limit is {}",
            encoded.len(),
            MAX_PATCH_BYTES
        )));
    }
    check_level(patch, 0)
}

/// Validate the document a patch would produce before persisting it
pub fn validate_merged_document(encoded_len: usize, version: i64) -> Result<()> {
    if encoded_len > MAX_DOCUMENT_BYTES {
        return Err(GatewayError::Validation(format!(
            "merged reported properties would be {} bytes, limit is {}",
            encoded_len, MAX_DOCUMENT_BYTES
        )));
    }
    if version > MAX_VERSION {
        return Err(GatewayError::Validation(format!(
            "reported version {} exceeds the maximum of {}",
            version, MAX_VERSION
        )));
    }
    Ok(())
}

fn check_level(value: &Value, depth: usize) -> Result<()> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };
    if depth > MAX_NESTING_DEPTH {
        return Err(GatewayError::Validation(format!(
            "nesting exceeds {} levels",
            MAX_NESTING_DEPTH
        )));
    }
    for (key, child) in obj {
        check_key(key)?;
        check_level(child, depth + 1)?;
    }
    Ok(())
}

fn check_key(key: &str) -> Result<()> {
    if key == METADATA_KEY {
        return Ok(());
    }
    if key.starts_with('$') {
        return Err(GatewayError::Validation(format!(
            "key '{}' uses a reserved prefix",
            key
        )));
    }
    if key.is_empty() {
        return Err(GatewayError::Validation("empty key".to_string()));
    }
    if key
        .chars()
        .any(|c| c == '.' || c == '$' || c == ' ' || c.is_control())
    {
        return Err(GatewayError::Validation(format!(
            "key '{}' contains a forbidden character",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_plain_patch() {
        assert!(validate_reported_patch(&json!({ "temp": 21, "tags": { "site": "b12" } })).is_ok());
    }

    #[test]
    fn rejects_non_object() {
        assert!(validate_reported_patch(&json!([1, 2])).is_err());
        assert!(validate_reported_patch(&json!("x")).is_err());
    }

    #[test]
    fn size_limit_is_exact() {
        // {"k":"aaa...a"} -> 8 bytes of framing + payload
        let payload = "a".repeat(MAX_PATCH_BYTES - 8);
        let at_limit = json!({ "k": payload });
        assert_eq!(serde_json::to_vec(&at_limit).unwrap().len(), MAX_PATCH_BYTES);
        assert!(validate_reported_patch(&at_limit).is_ok());

        let payload = "a".repeat(MAX_PATCH_BYTES - 7);
        let over = json!({ "k": payload });
        assert!(validate_reported_patch(&over).is_err());
    }

    #[test]
    fn rejects_deep_nesting() {
        // deepest object MAX_NESTING_DEPTH levels below the root is allowed
        let mut value = json!(1);
        for _ in 0..=MAX_NESTING_DEPTH {
            value = json!({ "level": value });
        }
        assert!(validate_reported_patch(&value).is_ok());

        // one level deeper is not
        let deeper = json!({ "level": value });
        assert!(validate_reported_patch(&deeper).is_err());
    }

    #[test]
    fn rejects_reserved_and_malformed_keys() {
        assert!(validate_reported_patch(&json!({ "$version": 1 })).is_err());
        assert!(validate_reported_patch(&json!({ "a.b": 1 })).is_err());
        assert!(validate_reported_patch(&json!({ "a b": 1 })).is_err());
        assert!(validate_reported_patch(&json!({ "a\tb": 1 })).is_err());
        assert!(validate_reported_patch(&json!({ METADATA_KEY: {} })).is_ok());
    }

    #[test]
    fn merged_document_limits() {
        assert!(validate_merged_document(MAX_DOCUMENT_BYTES, 5).is_ok());
        assert!(validate_merged_document(MAX_DOCUMENT_BYTES + 1, 5).is_err());
        assert!(validate_merged_document(10, MAX_VERSION + 1).is_err());
    }
}
