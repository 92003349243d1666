//! Query-result caches.
//!
//! A query manager owns the cached results of one registered query. Entries live under the keys the query derives from
//! its parameters; a reverse hash maps every cached id back to the entry holding it so that the model manager's write
//! transactions can repair the entry without re-running the query.
//!
//! Query managers are children of their [`ModelManager`]. They don't keep it alive: once the model manager is dropped
//! every operation fails with [`CacheError::NotConfigured`].

use fieldx_plus::fx_plus;
use std::collections::HashMap;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::error::CacheError;
use crate::error::Result;
use crate::keys;
use crate::model_manager::ModelManager;
use crate::script::ScriptShape;
use crate::store::Store;
use crate::traits::Model;
use crate::traits::MultiQuery;
use crate::traits::QueryDescriptor;
use crate::traits::SingleQuery;
use crate::types::CacheMode;
use crate::types::Lookup;
use crate::types::PersistencyOptions;
use crate::types::QueryKind;

// Flattens `(query_key, ids)` results into `query_key, value..., SEPARATOR` groups. An empty result is a lone void.
fn result_groups<I>(results: &[(String, Vec<I>)]) -> Result<Vec<String>>
where
    I: serde::Serialize,
{
    let mut args = Vec::new();
    for (query_key, ids) in results {
        args.push(query_key.clone());
        if ids.is_empty() {
            args.push(keys::VOID.to_string());
        }
        else {
            for id in ids {
                args.push(keys::encode_id(id)?);
            }
        }
        args.push(keys::SEPARATOR.to_string());
    }
    Ok(args)
}

async fn store_results<M>(
    manager: &ModelManager<M>,
    reverse_hash_key: &str,
    kind: QueryKind,
    results: &[(String, Vec<M::Id>)],
    options: &PersistencyOptions,
) -> Result<()>
where
    M: Model,
{
    if results.is_empty() || options.cache_mode() == CacheMode::NoCache {
        return Ok(());
    }
    let args = result_groups(results)?;
    manager
        .scripts()
        .eval(
            manager.store().as_ref(),
            &ScriptShape::store_query_results(kind),
            &[reverse_hash_key.to_string()],
            &args,
        )
        .await?;
    Ok(())
}

async fn forget_results<M>(
    manager: &ModelManager<M>,
    reverse_hash_key: &str,
    kind: QueryKind,
    query_keys: Vec<String>,
) -> Result<()>
where
    M: Model,
{
    if query_keys.is_empty() {
        return Ok(());
    }
    manager
        .scripts()
        .eval(
            manager.store().as_ref(),
            &ScriptShape::forget_query_results(kind),
            &[reverse_hash_key.to_string()],
            &query_keys,
        )
        .await?;
    Ok(())
}

// Resolves ids to entities with a single entity-manager batch, keyed back by id.
async fn resolve_ids<M>(
    manager: &ModelManager<M>,
    ids: Vec<M::Id>,
    options: &PersistencyOptions,
) -> Result<HashMap<M::Id, M::Entity>>
where
    M: Model,
{
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let model = manager.model();
    Ok(manager
        .entity_manager()
        .m_get(&ids, options)
        .await?
        .into_iter()
        .map(|e| (model.id_of(&e), e))
        .collect())
}

/// Cache of a query resolving to at most one entity.
#[fx_plus(
    child(ModelManager<M>, unwrap(or_else(CacheError, model_manager_gone))),
    sync,
    get(off),
    default(off)
)]
pub struct SingleQueryManager<M, Q>
where
    M: Model,
    Q: SingleQuery<M>,
{
    #[fieldx(builder(into))]
    alias:            String,
    #[fieldx(builder(into))]
    model_name:       String,
    #[fieldx(builder(into))]
    reverse_hash_key: String,
    query:            Q,
}

impl<M, Q> SingleQueryManager<M, Q>
where
    M: Model,
    Q: SingleQuery<M>,
{
    fn model_manager_gone(&self) -> CacheError {
        CacheError::NotConfigured(format!("query '{}' outlived its model manager", self.alias))
    }

    /// The query implementation this manager caches.
    pub fn inner(&self) -> &Q {
        &self.query
    }

    /// `Lookup::NotFound` means the query is known to have no match, or that its match no longer exists.
    #[instrument(level = "trace", skip(self, options), fields(query = %self.alias))]
    pub async fn get(&self, params: &Q::Params, options: &PersistencyOptions) -> Result<Lookup<M::Entity>> {
        let manager = self.parent()?;
        let key = self.query.query_key(params);

        if !options.ignore_primary_layer() {
            if let Some(raw) = manager.store().get(&key).await? {
                if keys::is_void(&raw) {
                    trace!("negative hit on '{key}'");
                    return Ok(Lookup::NotFound);
                }
                trace!("hit on '{key}'");
                let id = keys::decode_id::<M::Id>(&key, &raw)?;
                return manager.entity_manager().get(&id, options).await;
            }
        }

        if options.ignore_secondary_layer() {
            return Ok(Lookup::Unknown);
        }

        debug!("miss on '{key}', running query");
        let id = self
            .query
            .query(params)
            .await
            .map_err(|e| CacheError::query(&self.alias, e))?;

        store_results(
            &manager,
            &self.reverse_hash_key,
            QueryKind::Single,
            &[(key, id.iter().cloned().collect())],
            options,
        )
        .await?;

        match id {
            Some(id) => manager.entity_manager().get(&id, options).await,
            None => Ok(Lookup::NotFound),
        }
    }

    /// One element per parameter set, in the same order. `None` stands for no match as well as for results left
    /// unresolved because the secondary layer is ignored.
    #[instrument(level = "trace", skip_all, fields(query = %self.alias, count = params.len()))]
    pub async fn m_get(&self, params: &[Q::Params], options: &PersistencyOptions) -> Result<Vec<Option<M::Entity>>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let manager = self.parent()?;
        let query_keys = params.iter().map(|p| self.query.query_key(p)).collect::<Vec<_>>();
        let mut ids: Vec<Option<M::Id>> = vec![None; params.len()];
        let mut misses = Vec::new();

        if options.ignore_primary_layer() {
            misses.extend(0..params.len());
        }
        else {
            let raws = manager.store().mget(&query_keys).await?;
            for (i, raw) in raws.into_iter().enumerate() {
                match raw {
                    Some(raw) if keys::is_void(&raw) => (),
                    Some(raw) => ids[i] = Some(keys::decode_id(&query_keys[i], &raw)?),
                    None => misses.push(i),
                }
            }
        }

        if !misses.is_empty() && !options.ignore_secondary_layer() {
            debug!("{} of {} results missing, running query", misses.len(), params.len());

            let miss_params = misses.iter().map(|&i| &params[i]).collect::<Vec<_>>();
            let fresh = self
                .query
                .m_query(&miss_params)
                .await
                .map_err(|e| CacheError::query(&self.alias, e))?;
            if fresh.len() != misses.len() {
                return Err(CacheError::QueryContract {
                    alias:    self.alias.clone(),
                    expected: misses.len(),
                    got:      fresh.len(),
                });
            }

            let mut results = Vec::with_capacity(misses.len());
            for (&i, id) in misses.iter().zip(fresh) {
                results.push((query_keys[i].clone(), id.iter().cloned().collect()));
                ids[i] = id;
            }
            store_results(&manager, &self.reverse_hash_key, QueryKind::Single, &results, options).await?;
        }

        let entities = resolve_ids(&manager, ids.iter().flatten().cloned().collect(), options).await?;
        Ok(ids
            .into_iter()
            .map(|id| id.and_then(|id| entities.get(&id).cloned()))
            .collect())
    }

    /// Drops the cached result for `params`; the next read runs the query again.
    #[instrument(level = "trace", skip(self), fields(query = %self.alias))]
    pub async fn invalidate(&self, params: &Q::Params) -> Result<()> {
        let manager = self.parent()?;
        forget_results(
            &manager,
            &self.reverse_hash_key,
            QueryKind::Single,
            vec![self.query.query_key(params)],
        )
        .await
    }
}

impl<M, Q> QueryDescriptor<M> for SingleQueryManager<M, Q>
where
    M: Model,
    Q: SingleQuery<M>,
{
    fn alias(&self) -> &str {
        &self.alias
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn kind(&self) -> QueryKind {
        QueryKind::Single
    }

    fn reverse_hash_key(&self) -> &str {
        &self.reverse_hash_key
    }

    fn entity_query_key(&self, entity: &M::Entity) -> Option<String> {
        self.query.entity_key(entity)
    }
}

/// Cache of a query resolving to a list of entities.
#[fx_plus(
    child(ModelManager<M>, unwrap(or_else(CacheError, model_manager_gone))),
    sync,
    get(off),
    default(off)
)]
pub struct MultiQueryManager<M, Q>
where
    M: Model,
    Q: MultiQuery<M>,
{
    #[fieldx(builder(into))]
    alias:            String,
    #[fieldx(builder(into))]
    model_name:       String,
    #[fieldx(builder(into))]
    reverse_hash_key: String,
    query:            Q,
}

impl<M, Q> MultiQueryManager<M, Q>
where
    M: Model,
    Q: MultiQuery<M>,
{
    fn model_manager_gone(&self) -> CacheError {
        CacheError::NotConfigured(format!("query '{}' outlived its model manager", self.alias))
    }

    pub fn inner(&self) -> &Q {
        &self.query
    }

    // Cached members of a set: `None` if the set is unknown, an empty list for the void-only set.
    fn cached_ids(&self, key: &str, members: Vec<String>) -> Result<Option<Vec<M::Id>>> {
        if members.is_empty() {
            return Ok(None);
        }
        members
            .iter()
            .filter(|m| !keys::is_void(m))
            .map(|m| keys::decode_id(key, m))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Never returns `Lookup::NotFound`: a query without matches is `Lookup::Found` with an empty list. Members are
    /// resolved through the entity manager; those that turn out not to exist are skipped.
    #[instrument(level = "trace", skip(self, options), fields(query = %self.alias))]
    pub async fn get(&self, params: &Q::Params, options: &PersistencyOptions) -> Result<Lookup<Vec<M::Entity>>> {
        let manager = self.parent()?;
        let key = self.query.query_key(params);

        let cached = if options.ignore_primary_layer() {
            None
        }
        else {
            let members = manager.store().smembers(&key).await?;
            self.cached_ids(&key, members)?
        };

        let ids = match cached {
            Some(ids) => {
                trace!("hit on '{key}', {} members", ids.len());
                ids
            }
            None if options.ignore_secondary_layer() => return Ok(Lookup::Unknown),
            None => {
                debug!("miss on '{key}', running query");
                let ids = self
                    .query
                    .query(params)
                    .await
                    .map_err(|e| CacheError::query(&self.alias, e))?;
                store_results(
                    &manager,
                    &self.reverse_hash_key,
                    QueryKind::Multiple,
                    &[(key, ids.clone())],
                    options,
                )
                .await?;
                ids
            }
        };

        if ids.is_empty() {
            return Ok(Lookup::Found(Vec::new()));
        }
        let mut entities = resolve_ids(&manager, ids.clone(), options).await?;
        Ok(Lookup::Found(ids.iter().filter_map(|id| entities.remove(id)).collect()))
    }

    /// One entity list per parameter set, in the same order. Results left unresolved because the secondary layer is
    /// ignored come back empty.
    #[instrument(level = "trace", skip_all, fields(query = %self.alias, count = params.len()))]
    pub async fn m_get(&self, params: &[Q::Params], options: &PersistencyOptions) -> Result<Vec<Vec<M::Entity>>> {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let manager = self.parent()?;
        let query_keys = params.iter().map(|p| self.query.query_key(p)).collect::<Vec<_>>();
        let mut ids: Vec<Vec<M::Id>> = vec![Vec::new(); params.len()];
        let mut misses = Vec::new();

        if options.ignore_primary_layer() {
            misses.extend(0..params.len());
        }
        else {
            let reply = manager
                .scripts()
                .eval(manager.store().as_ref(), &ScriptShape::read_query_sets(), &query_keys, &[])
                .await?;
            let sets = reply.split(|v| v == keys::SEPARATOR).take(params.len()).collect::<Vec<_>>();
            if sets.len() != params.len() {
                return Err(CacheError::QueryCorrupted {
                    key:   query_keys.join(","),
                    value: format!("{} result groups for {} keys", sets.len(), params.len()),
                });
            }
            for (i, members) in sets.into_iter().enumerate() {
                match self.cached_ids(&query_keys[i], members.to_vec())? {
                    Some(cached) => ids[i] = cached,
                    None => misses.push(i),
                }
            }
        }

        if !misses.is_empty() && !options.ignore_secondary_layer() {
            debug!("{} of {} results missing, running query", misses.len(), params.len());

            let miss_params = misses.iter().map(|&i| &params[i]).collect::<Vec<_>>();
            let fresh = self
                .query
                .m_query(&miss_params)
                .await
                .map_err(|e| CacheError::query(&self.alias, e))?;
            if fresh.len() != misses.len() {
                return Err(CacheError::QueryContract {
                    alias:    self.alias.clone(),
                    expected: misses.len(),
                    got:      fresh.len(),
                });
            }

            let mut results = Vec::with_capacity(misses.len());
            for (&i, result) in misses.iter().zip(fresh) {
                results.push((query_keys[i].clone(), result.clone()));
                ids[i] = result;
            }
            store_results(&manager, &self.reverse_hash_key, QueryKind::Multiple, &results, options).await?;
        }

        let entities = resolve_ids(&manager, ids.iter().flatten().cloned().collect(), options).await?;
        Ok(ids
            .into_iter()
            .map(|group| group.iter().filter_map(|id| entities.get(id).cloned()).collect())
            .collect())
    }

    #[instrument(level = "trace", skip(self), fields(query = %self.alias))]
    pub async fn invalidate(&self, params: &Q::Params) -> Result<()> {
        let manager = self.parent()?;
        forget_results(
            &manager,
            &self.reverse_hash_key,
            QueryKind::Multiple,
            vec![self.query.query_key(params)],
        )
        .await
    }
}

impl<M, Q> QueryDescriptor<M> for MultiQueryManager<M, Q>
where
    M: Model,
    Q: MultiQuery<M>,
{
    fn alias(&self) -> &str {
        &self.alias
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn kind(&self) -> QueryKind {
        QueryKind::Multiple
    }

    fn reverse_hash_key(&self) -> &str {
        &self.reverse_hash_key
    }

    fn entity_query_key(&self, entity: &M::Entity) -> Option<String> {
        self.query.entity_key(entity)
    }
}
