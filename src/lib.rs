//! # wt-cache
//!
//! Read-through, write-through coherence layer between a fast key-value store (the _primary layer_) and an
//! authoritative data source (the _secondary layer_).
//!
//! # The Basics
//!
//! Entities are cached by id. Besides that, named _queries_ (lookups resolving parameters to one id or to a list of
//! ids) get their results cached too. The hard part is keeping both consistent: when an entity changes, every cached
//! query result it belongs to, or used to belong to, must change with it, without re-running any query.
//!
//! The crate achieves this with three structures kept in the primary layer:
//!
//! - entity entries under `prefix + id`, holding the serialized entity or a _void marker_ meaning "known not to
//!   exist";
//! - query entries under keys the query derives from its parameters: a scalar id for single-result queries, a set of
//!   ids for multiple-result ones, the void marker for "evaluated, no match";
//! - a _reverse hash_ per query, mapping every cached id to the query entry currently holding it.
//!
//! Every write ([`update`](ModelManager::update), [`delete`](ModelManager::delete) and their batch forms) is one atomic
//! transaction program executed by the store. It consults the reverse hashes to evict the entity from the entries it
//! used to belong to, files it under the entries its new field values map to, and writes the entity entry itself.
//!
//! # Components
//!
//! - [`ModelManager`] is the per-model entry point and the parent of the query managers.
//! - [`EntityManager`](entity_manager::EntityManager) serves entity reads with fall-through to the secondary layer.
//! - [`SingleQueryManager`] and [`MultiQueryManager`] serve query reads with fall-through to the query function.
//! - [`ScriptCache`](script_cache::ScriptCache) compiles transaction programs once per shape and runs them by hash,
//!   resending the full program if the store has lost it.
//! - [`Store`](store::Store) is the primary layer protocol; [`MemoryStore`](store::memory::MemoryStore) implements it
//!   in process.
//!
//! # Reads
//!
//! A read returns [`Lookup`]: `Found`, `NotFound` when the entity is known not to exist, and `Unknown` when nobody
//! could tell because the cache had nothing and there was no secondary layer to ask. Per-call behavior is controlled
//! by [`PersistencyOptions`]; [`CacheSettings`](settings::CacheSettings) provides process-wide defaults.
//!
//! # Limitations
//!
//! Entity ids must be totally ordered primitives (integers or strings). Batch reads with negative caching diff the
//! secondary layer's ascending-ordered reply against the sorted request positionally.

pub mod entity_manager;
pub mod error;
pub mod keys;
pub mod model;
pub mod model_manager;
pub mod query_manager;
pub mod script;
pub mod script_cache;
pub mod script_gen;
pub mod settings;
pub mod store;
pub mod test;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use model_manager::ModelManager;
#[doc(inline)]
pub use query_manager::MultiQueryManager;
#[doc(inline)]
pub use query_manager::SingleQueryManager;
#[doc(inline)]
pub use types::Lookup;
#[doc(inline)]
pub use types::PersistencyOptions;

pub mod prelude {
    pub use crate::error::BoxError;
    pub use crate::error::CacheError;
    pub use crate::model::JsonModel;
    pub use crate::model_manager::ModelManager;
    pub use crate::query_manager::MultiQueryManager;
    pub use crate::query_manager::SingleQueryManager;
    pub use crate::settings::CacheSettings;
    pub use crate::store::memory::MemoryStore;
    pub use crate::store::Store;
    pub use crate::traits::*;
    pub use crate::types::*;
}
