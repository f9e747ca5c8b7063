//! Service identity model
//!
//! Identities describe devices and modules authorized to connect through
//! this gateway. Module ids are `<deviceId>/<moduleId>` with the device as
//! parent; devices chain to their parent gateway up to the gateway's own
//! identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Device,
    Module,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    Sas,
    X509CaSigned,
    X509Thumbprint,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Enabled,
    Disabled,
}

/// Authorization record for one device or module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    pub id: String,
    pub kind: IdentityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub auth_type: AuthType,
    pub status: IdentityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_scope: Option<String>,
    /// Credential material, opaque to the core
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_secrets: Option<Value>,
}

impl ServiceIdentity {
    pub fn is_enabled(&self) -> bool {
        self.status == IdentityStatus::Enabled
    }

    /// `(deviceId, moduleId)` when this is a module identity
    pub fn module_parts(&self) -> Option<(&str, &str)> {
        split_module_id(&self.id)
    }
}

/// Split `<deviceId>/<moduleId>`; `None` for a plain device id
pub fn split_module_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('/')
}

/// Persisted cache entry; a `None` identity is a tombstone recording that
/// the id fell out of scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub id: String,
    pub identity: Option<ServiceIdentity>,
    pub timestamp: DateTime<Utc>,
}

impl StoredIdentity {
    pub fn present(identity: ServiceIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            identity: Some(identity),
            timestamp: Utc::now(),
        }
    }

    pub fn tombstone(id: &str) -> Self {
        Self {
            id: id.to_string(),
            identity: None,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered ids from an authentication target up to the gateway root,
/// rendered as `target;hop;...;root`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChain(Vec<String>);

impl AuthChain {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// The id being authenticated
    pub fn target(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AuthChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_renders_and_parses() {
        let chain = AuthChain::new(vec!["d1".into(), "gw1".into(), "root".into()]);
        assert_eq!(chain.to_string(), "d1;gw1;root");
        assert_eq!(AuthChain::parse("d1;gw1;root"), chain);
        assert_eq!(chain.target(), Some("d1"));
    }

    #[test]
    fn module_ids_split() {
        assert_eq!(split_module_id("d1/mod1"), Some(("d1", "mod1")));
        assert_eq!(split_module_id("d1"), None);
    }
}
