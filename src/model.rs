use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

use crate::error::Result;
use crate::traits::EntityId;
use crate::traits::Model;

/// A [`Model`] storing entities as their serde_json encoding.
///
/// ```ignore
/// let users = JsonModel::new("user", "user:", |u: &User| u.id);
/// ```
pub struct JsonModel<E, I> {
    name:       String,
    key_prefix: String,
    id_field:   String,
    id_of:      fn(&E) -> I,
    _types:     PhantomData<fn() -> (E, I)>,
}

impl<E, I> JsonModel<E, I>
where
    E: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static,
    I: EntityId,
{
    pub fn new<S: ToString, P: ToString>(name: S, key_prefix: P, id_of: fn(&E) -> I) -> Self {
        Self {
            name: name.to_string(),
            key_prefix: key_prefix.to_string(),
            id_field: "id".to_string(),
            id_of,
            _types: PhantomData,
        }
    }

    pub fn with_id_field<S: ToString>(mut self, id_field: S) -> Self {
        self.id_field = id_field.to_string();
        self
    }
}

impl<E, I> Model for JsonModel<E, I>
where
    E: Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static,
    I: EntityId,
{
    type Entity = E;
    type Id = I;

    fn name(&self) -> &str {
        &self.name
    }

    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn id_of(&self, entity: &E) -> I {
        (self.id_of)(entity)
    }

    fn encode(&self, entity: &E) -> Result<String> {
        Ok(serde_json::to_string(entity)?)
    }

    fn decode(&self, raw: &str) -> Result<E> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl<E, I> Debug for JsonModel<E, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonModel")
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .field("id_field", &self.id_field)
            .finish()
    }
}
