//! Reserved markers, cache key derivation and the id wire codec.
//!
//! Ids travel through the store as their JSON encoding. JSON escapes every control character, therefore neither
//! [`VOID`] nor [`SEPARATOR`] can ever be produced by encoding an id or a serde_json-serialized entity.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;
use crate::error::Result;

/// "Evaluated, nothing there."
pub const VOID: &str = "\u{0}void\u{0}";
/// Delimits per-item groups in a flattened script argument list or reply.
pub const SEPARATOR: &str = "\u{0}sep\u{0}";
/// Follows the model prefix in default reverse hash names. Ids starting with it are refused.
pub const REVERSE_HASH_INFIX: &str = "__rh:";

#[inline]
pub fn is_void(value: &str) -> bool {
    value == VOID
}

#[inline]
pub fn is_reserved(value: &str) -> bool {
    value == VOID || value == SEPARATOR
}

/// Entity keys share the model prefix with reverse hashes; an id that would land in their namespace is an error.
pub fn entity_key<I: std::fmt::Display>(prefix: &str, id: &I) -> Result<String> {
    let id = id.to_string();
    if id.starts_with(REVERSE_HASH_INFIX) {
        return Err(CacheError::ReservedId(id));
    }
    Ok(format!("{prefix}{id}"))
}

/// Default name of the reverse hash for a query registered under `alias`.
pub fn reverse_hash_key(prefix: &str, alias: &str) -> String {
    format!("{prefix}{REVERSE_HASH_INFIX}{alias}")
}

pub fn encode_id<I: Serialize>(id: &I) -> Result<String> {
    Ok(serde_json::to_string(id)?)
}

/// Decodes an id found under `key`. Anything undecodable means the cache has been tampered with or written by a
/// different model.
pub fn decode_id<I: DeserializeOwned>(key: &str, raw: &str) -> Result<I> {
    serde_json::from_str(raw).map_err(|_| CacheError::QueryCorrupted {
        key:   key.to_string(),
        value: raw.to_string(),
    })
}

/// Guards against a custom entity codec producing a value indistinguishable from a marker.
pub fn check_not_reserved(key: &str, value: &str) -> Result<()> {
    if is_reserved(value) {
        Err(CacheError::ReservedValue(key.to_string()))
    }
    else {
        Ok(())
    }
}
