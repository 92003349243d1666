use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::error::CacheError;
use crate::error::Result;
use crate::keys;
use crate::script::ScriptShape;
use crate::script_cache::ScriptCache;
use crate::store::Store;
use crate::traits::Model;
use crate::traits::SecondaryLayer;
use crate::types::CacheMode;
use crate::types::Lookup;
use crate::types::PersistencyOptions;

/// Owner of a model's entity cache entries.
pub struct EntityManager<M>
where
    M: Model,
{
    model:          Arc<M>,
    store:          Arc<dyn Store>,
    secondary:      Option<Arc<dyn SecondaryLayer<M>>>,
    scripts:        Arc<ScriptCache>,
    negative_cache: bool,
}

impl<M> EntityManager<M>
where
    M: Model,
{
    pub(crate) fn new(
        model: Arc<M>,
        store: Arc<dyn Store>,
        secondary: Option<Arc<dyn SecondaryLayer<M>>>,
        scripts: Arc<ScriptCache>,
        negative_cache: bool,
    ) -> Self {
        Self {
            model,
            store,
            secondary,
            scripts,
            negative_cache,
        }
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn negative_cache(&self) -> bool {
        self.negative_cache
    }

    fn decode(&self, key: &str, raw: &str) -> Result<M::Entity> {
        self.model.decode(raw).map_err(|_| CacheError::QueryCorrupted {
            key:   key.to_string(),
            value: raw.to_string(),
        })
    }

    // The secondary layer to fall through to, if this call may use one.
    fn secondary_for(&self, options: &PersistencyOptions) -> Option<&Arc<dyn SecondaryLayer<M>>> {
        if options.ignore_secondary_layer() {
            None
        }
        else {
            self.secondary.as_ref()
        }
    }

    #[instrument(level = "trace", skip(self, options), fields(model = self.model.name()))]
    pub async fn get(&self, id: &M::Id, options: &PersistencyOptions) -> Result<Lookup<M::Entity>> {
        let key = self.model.entity_key(id)?;

        if !options.ignore_primary_layer() {
            match self.store.get(&key).await? {
                Some(raw) if keys::is_void(&raw) => {
                    trace!("negative hit on '{key}'");
                    return Ok(Lookup::NotFound);
                }
                Some(raw) => {
                    trace!("hit on '{key}'");
                    return Ok(Lookup::Found(self.decode(&key, &raw)?));
                }
                None => (),
            }
        }

        let Some(secondary) = self.secondary_for(options)
        else {
            return Ok(Lookup::Unknown);
        };

        debug!("miss on '{key}', consulting secondary layer");
        let entity = secondary.get_by_id(id).await.map_err(CacheError::Secondary)?;
        self.cache_miss(id, entity.as_ref(), options).await?;

        Ok(entity.into())
    }

    /// Order of the returned entities is not related to the order of `ids`. Ids known not to exist, and ids nobody
    /// knows about, are skipped.
    #[instrument(level = "trace", skip(self, options), fields(model = self.model.name()))]
    pub async fn m_get(&self, ids: &[M::Id], options: &PersistencyOptions) -> Result<Vec<M::Entity>> {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids = ids.iter().filter(|id| seen.insert(*id)).cloned().collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();

        if options.ignore_primary_layer() {
            misses = ids;
        }
        else {
            let keys = ids
                .iter()
                .map(|id| self.model.entity_key(id))
                .collect::<Result<Vec<_>>>()?;
            let raws = self.store.mget(&keys).await?;
            for ((id, key), raw) in ids.into_iter().zip(keys.iter()).zip(raws) {
                match raw {
                    Some(raw) if keys::is_void(&raw) => (),
                    Some(raw) => found.push(self.decode(key, &raw)?),
                    None => misses.push(id),
                }
            }
        }

        let Some(secondary) = self.secondary_for(options)
        else {
            return Ok(found);
        };
        if misses.is_empty() {
            return Ok(found);
        }

        debug!("{} misses of {} ids, consulting secondary layer", misses.len(), misses.len() + found.len());

        let fetched = if options.effective_negative_cache(self.negative_cache) {
            misses.sort();
            let entities = secondary
                .get_by_ids_ordered_asc(&misses)
                .await
                .map_err(CacheError::Secondary)?;
            diff_sorted(misses, entities, |e| self.model.id_of(e))
        }
        else {
            secondary
                .get_by_ids(&misses)
                .await
                .map_err(CacheError::Secondary)?
                .into_iter()
                .map(|e| (self.model.id_of(&e), Some(e)))
                .collect()
        };

        self.cache_misses(&fetched, options).await?;
        found.extend(fetched.into_iter().filter_map(|(_, e)| e));

        Ok(found)
    }

    /// Populates the entity cache entry of `id` after it was fetched elsewhere. `None` means the entity doesn't
    /// exist.
    #[instrument(level = "trace", skip(self, entity, options))]
    pub async fn cache_miss(&self, id: &M::Id, entity: Option<&M::Entity>, options: &PersistencyOptions) -> Result<()> {
        let only_if_absent = match options.cache_mode() {
            CacheMode::NoCache => return Ok(()),
            CacheMode::CacheIfNotExist => true,
            CacheMode::CacheAndOverwrite => false,
        };

        let key = self.model.entity_key(id)?;
        let value = match entity {
            Some(entity) => self.encode(&key, entity)?,
            None if options.effective_negative_cache(self.negative_cache) => keys::VOID.to_string(),
            None => {
                self.store.del(&[key]).await?;
                return Ok(());
            }
        };

        if only_if_absent {
            self.store.set_nx(&key, &value, options.store_ttl()).await?;
        }
        else {
            self.store.set(&key, &value, options.store_ttl()).await?;
        }
        Ok(())
    }

    /// Batch form of [`cache_miss`](Self::cache_miss): all writes go in one transaction.
    #[instrument(level = "trace", skip_all, fields(count = entries.len()))]
    pub async fn cache_misses(&self, entries: &[(M::Id, Option<M::Entity>)], options: &PersistencyOptions) -> Result<()> {
        let cache_mode = options.cache_mode();
        if cache_mode == CacheMode::NoCache || entries.is_empty() {
            return Ok(());
        }

        let negative = options.effective_negative_cache(self.negative_cache);
        let mut keys = Vec::with_capacity(entries.len());
        let mut args = Vec::with_capacity(entries.len() + 1);
        let mut removals = Vec::new();

        if let Some(ttl) = options.store_ttl() {
            args.push(ttl.as_millis().to_string());
        }

        for (id, entity) in entries {
            let key = self.model.entity_key(id)?;
            match entity {
                Some(entity) => {
                    args.push(self.encode(&key, entity)?);
                    keys.push(key);
                }
                None if negative => {
                    args.push(keys::VOID.to_string());
                    keys.push(key);
                }
                None => removals.push(key),
            }
        }

        if !keys.is_empty() {
            let shape = ScriptShape::populate(cache_mode, options.ttl().is_some());
            self.scripts.eval(self.store.as_ref(), &shape, &keys, &args).await?;
        }
        if !removals.is_empty() {
            self.store.del(&removals).await?;
        }
        Ok(())
    }

    pub(crate) fn encode(&self, key: &str, entity: &M::Entity) -> Result<String> {
        let value = self.model.encode(entity)?;
        keys::check_not_reserved(key, &value)?;
        Ok(value)
    }
}

/// Pairs every requested id with the entity the secondary layer returned for it, walking both lists in ascending id
/// order. Ids with no counterpart are known not to exist. Returned entities that weren't requested are dropped.
pub(crate) fn diff_sorted<I, E, F>(requested: Vec<I>, fetched: Vec<E>, id_of: F) -> Vec<(I, Option<E>)>
where
    I: Ord,
    F: Fn(&E) -> I,
{
    let mut fetched = fetched.into_iter().peekable();
    let mut outcome = Vec::with_capacity(requested.len());

    for id in requested {
        while fetched.next_if(|e| id_of(e) < id).is_some() {}
        let entity = fetched.next_if(|e| id_of(e) == id);
        outcome.push((id, entity));
    }

    outcome
}
