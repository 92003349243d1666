use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;

use crate::error::BoxError;
use crate::error::Result;
use crate::keys;
use crate::types::QueryKind;

/// Entity identifier. Ids must be totally ordered primitives: the negative-cache diff of a bulk secondary fetch
/// relies on comparing them positionally.
pub trait EntityId:
    Debug + Display + Clone + Ord + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> EntityId for T where T: Debug + Display + Clone + Ord + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Static descriptor of an entity type: where its entries live and how they're converted to and from the wire form.
pub trait Model: Send + Sync + 'static {
    type Entity: Debug + Clone + Send + Sync + 'static;
    type Id: EntityId;

    /// Model name, used for diagnostics and to tell models apart when queries are registered.
    fn name(&self) -> &str;

    /// Prefix of entity keys. Default reverse hash names start with it too, followed by
    /// [`REVERSE_HASH_INFIX`](keys::REVERSE_HASH_INFIX).
    fn key_prefix(&self) -> &str;

    fn id_field(&self) -> &str {
        "id"
    }

    fn id_of(&self, entity: &Self::Entity) -> Self::Id;

    fn encode(&self, entity: &Self::Entity) -> Result<String>;

    fn decode(&self, raw: &str) -> Result<Self::Entity>;

    fn entity_key(&self, id: &Self::Id) -> Result<String> {
        keys::entity_key(self.key_prefix(), id)
    }
}

/// The authoritative data store behind the cache.
#[async_trait]
pub trait SecondaryLayer<M>: Send + Sync + 'static
where
    M: Model,
{
    async fn get_by_id(&self, id: &M::Id) -> Result<Option<M::Entity>, BoxError>;

    /// No ordering guarantee.
    async fn get_by_ids(&self, ids: &[M::Id]) -> Result<Vec<M::Entity>, BoxError>;

    /// Must return entities sorted by id in ascending order.
    async fn get_by_ids_ordered_asc(&self, ids: &[M::Id]) -> Result<Vec<M::Entity>, BoxError>;
}

/// A lookup resolving its parameters to at most one entity id.
#[async_trait]
pub trait SingleQuery<M>: Send + Sync + 'static
where
    M: Model,
{
    type Params: Debug + Send + Sync + 'static;

    /// Cache key of the result for the given parameters.
    fn query_key(&self, params: &Self::Params) -> String;

    /// The cache key an entity resolves to; i.e. the key under which this query would find it. `None` if the entity
    /// can't match the query at all.
    fn entity_key(&self, entity: &M::Entity) -> Option<String>;

    /// Custom reverse hash name. The default is derived from the model prefix and the query alias.
    fn reverse_hash_key(&self) -> Option<String> {
        None
    }

    async fn query(&self, params: &Self::Params) -> Result<Option<M::Id>, BoxError>;

    /// One result per parameter set, in the same order.
    async fn m_query(&self, params: &[&Self::Params]) -> Result<Vec<Option<M::Id>>, BoxError> {
        let mut results = Vec::with_capacity(params.len());
        for p in params {
            results.push(self.query(p).await?);
        }
        Ok(results)
    }
}

/// A lookup resolving its parameters to a list of entity ids.
#[async_trait]
pub trait MultiQuery<M>: Send + Sync + 'static
where
    M: Model,
{
    type Params: Debug + Send + Sync + 'static;

    fn query_key(&self, params: &Self::Params) -> String;

    fn entity_key(&self, entity: &M::Entity) -> Option<String>;

    fn reverse_hash_key(&self) -> Option<String> {
        None
    }

    async fn query(&self, params: &Self::Params) -> Result<Vec<M::Id>, BoxError>;

    async fn m_query(&self, params: &[&Self::Params]) -> Result<Vec<Vec<M::Id>>, BoxError> {
        let mut results = Vec::with_capacity(params.len());
        for p in params {
            results.push(self.query(p).await?);
        }
        Ok(results)
    }
}

/// What the write path needs to know about a registered query, with the parameter type erased.
pub trait QueryDescriptor<M>: Send + Sync + 'static
where
    M: Model,
{
    fn alias(&self) -> &str;

    fn model_name(&self) -> &str;

    fn kind(&self) -> QueryKind;

    fn reverse_hash_key(&self) -> &str;

    fn entity_query_key(&self, entity: &M::Entity) -> Option<String>;
}
