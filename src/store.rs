//! The key-value engine the cache lives in.

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;
use crate::script::Script;

/// Minimal command set of the primary layer: strings, sets, hashes and atomic program execution.
///
/// Implementations must execute a program atomically: no other command may observe or touch the store while it runs.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Sets only if the key doesn't exist. Returns `true` if the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError>;

    async fn mset(&self, pairs: &[(String, String)]) -> Result<(), StoreError>;

    /// Returns the number of keys actually removed.
    async fn del(&self, keys: &[String]) -> Result<usize, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError>;

    async fn srem(&self, key: &str, members: &[String]) -> Result<usize, StoreError>;

    async fn scard(&self, key: &str) -> Result<usize, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Registers the script without running it and returns its hash.
    async fn script_load(&self, script: &Script) -> Result<String, StoreError>;

    /// Runs a previously registered script. Fails with [`StoreError::NoScript`] if the store doesn't hold it.
    async fn eval_hash(&self, hash: &str, keys: &[String], args: &[String]) -> Result<Vec<String>, StoreError>;

    /// Ships the full script, registering it for later [`eval_hash`](Store::eval_hash) calls, and runs it.
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Vec<String>, StoreError>;
}
