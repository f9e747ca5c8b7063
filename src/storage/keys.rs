//! Persistence key layout
//!
//! One flat namespace, segmented by prefix:
//! `twin/<id>`, `reported/<id>`, `identity/<id>`.

pub const TWIN_PREFIX: &str = "twin/";
pub const REPORTED_PREFIX: &str = "reported/";
pub const IDENTITY_PREFIX: &str = "identity/";

pub fn twin_key(id: &str) -> String {
    format!("{}{}", TWIN_PREFIX, id)
}

pub fn reported_key(id: &str) -> String {
    format!("{}{}", REPORTED_PREFIX, id)
}

pub fn identity_key(id: &str) -> String {
    format!("{}{}", IDENTITY_PREFIX, id)
}

/// Strip `prefix` from a full store key
pub fn id_from_key<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}
