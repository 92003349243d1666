use fieldx_plus::child_build;
use fieldx_plus::fx_plus;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;

use crate::entity_manager::EntityManager;
use crate::error::CacheError;
use crate::error::Result;
use crate::keys;
use crate::query_manager::MultiQueryManager;
use crate::query_manager::SingleQueryManager;
use crate::script::ScriptShape;
use crate::script_cache::ScriptCache;
use crate::store::Store;
use crate::traits::Model;
use crate::traits::MultiQuery;
use crate::traits::QueryDescriptor;
use crate::traits::SecondaryLayer;
use crate::traits::SingleQuery;
use crate::types::Lookup;
use crate::types::PersistencyOptions;

/// Per-model entry point of the cache.
///
/// Reads are served by the [`EntityManager`] and, for queries, by the query managers registered with
/// [`add_single_query`](Self::add_single_query) and [`add_multi_query`](Self::add_multi_query). Every write is a single
/// atomic transaction updating the entity cache entries together with the cached entries and reverse hashes of every
/// registered query.
///
/// ```ignore
/// let users = ModelManager::builder()
///     .model(JsonModel::new("user", "user:", |u: &User| u.id))
///     .store(store)
///     .secondary(backend)
///     .negative_cache(true)
///     .build()?;
///
/// let by_email = users.add_single_query("by_email", UsersByEmail)?;
///
/// users.update(&user, &PersistencyOptions::overwrite()).await?;
/// let found = by_email.get(&"ann@example.com".to_string(), &PersistencyOptions::overwrite()).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        vis(pub),
        doc("Builder object of [`ModelManager`].", "", "See [`ModelManager::builder()`] method."),
        method_doc("Implement builder pattern for [`ModelManager`]."),
    )
)]
pub struct ModelManager<M>
where
    M: Model,
{
    #[fieldx(builder(vis(pub), required, into), get(clone))]
    model: Arc<M>,

    /// The primary layer.
    #[fieldx(builder(vis(pub), required), get(clone))]
    store: Arc<dyn Store>,

    /// Without a secondary layer reads never fall through: a miss is [`Lookup::Unknown`].
    #[fieldx(optional, get(off))]
    secondary: Arc<dyn SecondaryLayer<M>>,

    /// Whether "not found" is cached unless a call's options say otherwise.
    #[fieldx(get(copy), default(false))]
    negative_cache: bool,

    #[fieldx(lazy, get(clone), builder(off))]
    scripts: Arc<ScriptCache>,

    #[fieldx(lazy, get(clone), builder(off))]
    entity_manager: Arc<EntityManager<M>>,

    #[fieldx(inner_mut, private, get, get_mut, builder(off), default(Vec::new()))]
    queries: Vec<Arc<dyn QueryDescriptor<M>>>,
}

impl<M> ModelManager<M>
where
    M: Model,
{
    fn build_scripts(&self) -> Arc<ScriptCache> {
        Arc::new(ScriptCache::new())
    }

    fn build_entity_manager(&self) -> Arc<EntityManager<M>> {
        Arc::new(EntityManager::new(
            self.model(),
            self.store(),
            self.secondary.clone(),
            self.scripts(),
            self.negative_cache(),
        ))
    }

    #[inline]
    pub fn name(&self) -> String {
        self.model.name().to_string()
    }

    #[inline]
    pub async fn get(&self, id: &M::Id, options: &PersistencyOptions) -> Result<Lookup<M::Entity>> {
        self.entity_manager().get(id, options).await
    }

    #[inline]
    pub async fn m_get(&self, ids: &[M::Id], options: &PersistencyOptions) -> Result<Vec<M::Entity>> {
        self.entity_manager().m_get(ids, options).await
    }

    #[inline]
    pub async fn cache_miss(&self, id: &M::Id, entity: Option<&M::Entity>, options: &PersistencyOptions) -> Result<()> {
        self.entity_manager().cache_miss(id, entity, options).await
    }

    #[inline]
    pub async fn cache_misses(&self, entries: &[(M::Id, Option<M::Entity>)], options: &PersistencyOptions) -> Result<()> {
        self.entity_manager().cache_misses(entries, options).await
    }

    /// Snapshot of the registered query descriptors, in registration order.
    pub fn get_queries(&self) -> Vec<Arc<dyn QueryDescriptor<M>>> {
        self.queries().iter().cloned().collect()
    }

    pub fn query(&self, alias: &str) -> Option<Arc<dyn QueryDescriptor<M>>> {
        self.queries().iter().find(|q| q.alias() == alias).cloned()
    }

    /// Registers a query so that subsequent writes keep its cached entries in sync.
    pub fn add_query(&self, descriptor: Arc<dyn QueryDescriptor<M>>) -> Result<()> {
        if descriptor.model_name() != self.model.name() {
            return Err(CacheError::ForeignQuery {
                alias:    descriptor.alias().to_string(),
                expected: self.model.name().to_string(),
                got:      descriptor.model_name().to_string(),
            });
        }

        let mut queries = self.queries_mut();
        if queries.iter().any(|q| q.alias() == descriptor.alias()) {
            return Err(CacheError::DuplicateQuery {
                model: self.model.name().to_string(),
                alias: descriptor.alias().to_string(),
            });
        }

        debug!(
            "[{}] registering {:?} query '{}' with reverse hash '{}'",
            self.model.name(),
            descriptor.kind(),
            descriptor.alias(),
            descriptor.reverse_hash_key()
        );
        queries.push(descriptor);
        Ok(())
    }

    fn reverse_hash_key_for(&self, alias: &str, custom: Option<String>) -> String {
        custom.unwrap_or_else(|| keys::reverse_hash_key(self.model.key_prefix(), alias))
    }

    pub fn add_single_query<Q>(&self, alias: &str, query: Q) -> Result<Arc<SingleQueryManager<M, Q>>>
    where
        Q: SingleQuery<M>,
    {
        let reverse_hash_key = self.reverse_hash_key_for(alias, query.reverse_hash_key());
        let manager = Arc::new(
            child_build!(
                self,
                SingleQueryManager<M, Q> {
                    alias: alias,
                    model_name: self.model.name(),
                    reverse_hash_key: reverse_hash_key,
                    query: query,
                }
            )
            .map_err(CacheError::config)?,
        );
        self.add_query(manager.clone())?;
        Ok(manager)
    }

    pub fn add_multi_query<Q>(&self, alias: &str, query: Q) -> Result<Arc<MultiQueryManager<M, Q>>>
    where
        Q: MultiQuery<M>,
    {
        let reverse_hash_key = self.reverse_hash_key_for(alias, query.reverse_hash_key());
        let manager = Arc::new(
            child_build!(
                self,
                MultiQueryManager<M, Q> {
                    alias: alias,
                    model_name: self.model.name(),
                    reverse_hash_key: reverse_hash_key,
                    query: query,
                }
            )
            .map_err(CacheError::config)?,
        );
        self.add_query(manager.clone())?;
        Ok(manager)
    }

    fn shared_write_args(&self, shape: &ScriptShape, options: &PersistencyOptions) -> Vec<String> {
        match options.store_ttl() {
            Some(ttl) if shape.has_ttl() => vec![ttl.as_millis().to_string()],
            _ => Vec::new(),
        }
    }

    async fn write(&self, entities: &[M::Entity], options: &PersistencyOptions, batch: bool) -> Result<()> {
        let queries = self.get_queries();
        let shape = ScriptShape::update(
            queries.iter().map(|q| q.kind()).collect(),
            options.cache_mode(),
            options.ttl().is_some(),
            batch,
        );
        let entity_manager = self.entity_manager();

        let mut keys = queries
            .iter()
            .map(|q| q.reverse_hash_key().to_string())
            .collect::<Vec<_>>();
        let mut args = self.shared_write_args(&shape, options);

        for entity in entities {
            let id = self.model.id_of(entity);
            let key = self.model.entity_key(&id)?;
            args.push(keys::encode_id(&id)?);
            args.push(entity_manager.encode(&key, entity)?);
            for query in &queries {
                args.push(
                    query
                        .entity_query_key(entity)
                        .unwrap_or_else(|| keys::VOID.to_string()),
                );
            }
            keys.push(key);
        }

        self.scripts().eval(self.store().as_ref(), &shape, &keys, &args).await?;
        Ok(())
    }

    async fn remove(&self, ids: &[M::Id], options: &PersistencyOptions, batch: bool) -> Result<()> {
        let queries = self.get_queries();
        let shape = ScriptShape::delete(
            queries.iter().map(|q| q.kind()).collect(),
            options.effective_negative_cache(self.negative_cache()),
            options.ttl().is_some(),
            batch,
        );

        let mut keys = queries
            .iter()
            .map(|q| q.reverse_hash_key().to_string())
            .collect::<Vec<_>>();
        let mut args = self.shared_write_args(&shape, options);

        for id in ids {
            keys.push(self.model.entity_key(id)?);
            args.push(keys::encode_id(id)?);
        }

        self.scripts().eval(self.store().as_ref(), &shape, &keys, &args).await?;
        Ok(())
    }

    /// Writes the entity to the cache according to the options' cache mode and moves it into the query entries its
    /// current field values belong to.
    #[instrument(level = "trace", skip_all, fields(model = self.model.name()))]
    pub async fn update(&self, entity: &M::Entity, options: &PersistencyOptions) -> Result<()> {
        self.write(std::slice::from_ref(entity), options, false).await
    }

    #[instrument(level = "trace", skip_all, fields(model = self.model.name(), count = entities.len()))]
    pub async fn m_update(&self, entities: &[M::Entity], options: &PersistencyOptions) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.write(entities, options, true).await
    }

    /// Removes the entity from every cached query entry holding it, then removes its cache entry or, with negative
    /// caching in effect, marks it as non-existent.
    #[instrument(level = "trace", skip(self, options), fields(model = self.model.name()))]
    pub async fn delete(&self, id: &M::Id, options: &PersistencyOptions) -> Result<()> {
        self.remove(std::slice::from_ref(id), options, false).await
    }

    #[instrument(level = "trace", skip_all, fields(model = self.model.name(), count = ids.len()))]
    pub async fn m_delete(&self, ids: &[M::Id], options: &PersistencyOptions) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.remove(ids, options, true).await
    }
}
