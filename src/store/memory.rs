//! In-process [`Store`] with string, set and hash values, per-key expiry and atomic program execution.
//!
//! Expiry runs on the tokio clock so that paused-time tests can drive it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::error::StoreError;
use crate::keys::is_void;
use crate::keys::SEPARATOR;
use crate::keys::VOID;
use crate::script::ArgRef;
use crate::script::KeyRef;
use crate::script::Layout;
use crate::script::Program;
use crate::script::Script;
use crate::script::Step;
use crate::store::Store;
use crate::types::QueryKind;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value:      Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Slot>,
    scripts: HashMap<String, Arc<Program>>,
}

/// Counters of script executions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub hash_evals: usize,
    pub full_evals: usize,
    pub no_script:  usize,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace:   Mutex<Keyspace>,
    hash_evals: AtomicUsize,
    full_evals: AtomicUsize,
    no_script:  AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every registered script, like the store's script cache being flushed behind our back.
    pub fn flush_scripts(&self) {
        self.keyspace.lock().scripts.clear();
    }

    pub fn flush_all(&self) {
        self.keyspace.lock().entries.clear();
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|s| s.expires_at.is_none_or(|at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, `None` if the key is missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut ks = self.keyspace.lock();
        ks.slot(key)
            .and_then(|s| s.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            hash_evals: self.hash_evals.load(Ordering::Relaxed),
            full_evals: self.full_evals.load(Ordering::Relaxed),
            no_script:  self.no_script.load(Ordering::Relaxed),
        }
    }
}

impl Keyspace {
    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|s| s.expires_at.is_some_and(|at| at <= Instant::now()));
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.slot(key).is_some()
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s), ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_str(&mut self, key: &str, value: &str, ttl: Option<Duration>, only_if_absent: bool) -> bool {
        if only_if_absent && self.exists(key) {
            return false;
        }
        self.entries.insert(
            key.to_string(),
            Slot {
                value:      Value::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        true
    }

    fn del(&mut self, key: &str) -> bool {
        let existed = self.exists(key);
        self.entries.remove(key);
        existed
    }

    fn set_ref(&mut self, key: &str) -> Result<Option<&mut BTreeSet<String>>, StoreError> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Set(set), ..
            }) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sadd<'a, I>(&mut self, key: &str, members: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.set_ref(key)?.is_none() {
            self.entries.insert(
                key.to_string(),
                Slot {
                    value:      Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        let set = self
            .set_ref(key)?
            .ok_or_else(|| StoreError::Backend(format!("set '{key}' vanished")))?;
        let added = members.into_iter().filter(|m| set.insert(m.to_string())).count();
        Ok(added)
    }

    fn srem<'a, I>(&mut self, key: &str, members: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let Some(set) = self.set_ref(key)?
        else {
            return Ok(0);
        };
        let removed = members.into_iter().filter(|m| set.remove(*m)).count();
        // Empty sets don't exist.
        if set.is_empty() {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn smembers(&mut self, key: &str) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self.set_ref(key)?.map(|s| s.iter().cloned().collect()))
    }

    fn hash_ref(&mut self, key: &str) -> Result<Option<&mut BTreeMap<String, String>>, StoreError> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Hash(h), ..
            }) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.hash_ref(key)?.and_then(|h| h.get(field).cloned()))
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        if let Some(h) = self.hash_ref(key)? {
            h.insert(field.to_string(), value.to_string());
            return Ok(());
        }
        self.entries.insert(
            key.to_string(),
            Slot {
                value:      Value::Hash(BTreeMap::from([(field.to_string(), value.to_string())])),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn hdel(&mut self, key: &str, field: &str) -> Result<bool, StoreError> {
        let Some(h) = self.hash_ref(key)?
        else {
            return Ok(false);
        };
        let removed = h.remove(field).is_some();
        if h.is_empty() {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    // ---- Program execution ----

    fn run(&mut self, program: &Program, keys: &[String], args: &[String]) -> Result<Vec<String>, StoreError> {
        let layout = program.layout();
        let records = layout.records(keys.len(), args.len())?;
        let mut reply = Vec::new();

        for record in 0..records {
            let frame = Frame {
                layout,
                keys,
                args,
                record,
            };
            for step in program.steps() {
                self.run_step(step, &frame, &mut reply)?;
            }
        }

        Ok(reply)
    }

    fn run_step(&mut self, step: &Step, frame: &Frame<'_>, reply: &mut Vec<String>) -> Result<(), StoreError> {
        match *step {
            Step::EvictFromQuery { reverse, id, kind } => {
                self.evict(frame.key(reverse)?, frame.arg(id)?, kind, None)?;
            }
            Step::FileIntoQuery {
                reverse,
                id,
                query_key,
                kind,
            } => {
                let query_key = frame.arg(query_key)?;
                if !is_void(query_key) {
                    self.file(frame.key(reverse)?, frame.arg(id)?, query_key, kind)?;
                }
            }
            Step::WriteEntity {
                key,
                value,
                only_if_absent,
                ttl,
            } => {
                let ttl = frame.ttl(ttl)?;
                self.set_str(frame.key(key)?, frame.arg(value)?, ttl, only_if_absent);
            }
            Step::RemoveEntity { key, void, ttl } => {
                let key = frame.key(key)?;
                if void {
                    let ttl = frame.ttl(ttl)?;
                    self.set_str(key, VOID, ttl, false);
                }
                else {
                    self.del(key);
                }
            }
            Step::StoreQueryResults { reverse, kind } => {
                let reverse = frame.key(reverse)?;
                for (query_key, values) in groups(frame.args)? {
                    self.store_result(reverse, query_key, &values, kind)?;
                }
            }
            Step::ForgetQueryResults { reverse, kind } => {
                let reverse = frame.key(reverse)?;
                for query_key in frame.args {
                    self.forget(reverse, query_key, kind)?;
                }
            }
            Step::ReadQuerySets => {
                for key in frame.keys {
                    if let Some(members) = self.smembers(key)? {
                        reply.extend(members);
                    }
                    reply.push(SEPARATOR.to_string());
                }
            }
        }
        Ok(())
    }

    // Removes the id from the query entry it is currently filed under, unless that entry is `keep`.
    fn evict(&mut self, reverse: &str, id: &str, kind: QueryKind, keep: Option<&str>) -> Result<(), StoreError> {
        let Some(query_key) = self.hget(reverse, id)?
        else {
            return Ok(());
        };
        if keep == Some(query_key.as_str()) {
            return Ok(());
        }

        match kind {
            QueryKind::Multiple => {
                // Only a set that actually lost its last member becomes "evaluated, empty". A vanished set stays
                // unknown.
                if self.srem(&query_key, [id])? > 0 && !self.exists(&query_key) {
                    self.sadd(&query_key, [VOID])?;
                }
            }
            QueryKind::Single => {
                if self.get_str(&query_key)?.as_deref() == Some(id) {
                    self.set_str(&query_key, VOID, None, false);
                }
            }
        }
        self.hdel(reverse, id)?;
        Ok(())
    }

    fn file(&mut self, reverse: &str, id: &str, query_key: &str, kind: QueryKind) -> Result<(), StoreError> {
        match kind {
            QueryKind::Single => {
                self.drop_occupant(reverse, query_key, id)?;
                self.set_str(query_key, id, None, false);
            }
            QueryKind::Multiple => {
                if self.set_ref(query_key)?.is_none() {
                    trace!("query set '{query_key}' is unknown, not filing {id}");
                    return Ok(());
                }
                self.srem(query_key, [VOID])?;
                self.sadd(query_key, [id])?;
            }
        }
        self.hset(reverse, id, query_key)
    }

    fn filed_elsewhere(
        &mut self,
        reverse: &str,
        id: &str,
        query_key: &str,
        kind: QueryKind,
    ) -> Result<bool, StoreError> {
        let Some(filed_under) = self.hget(reverse, id)?
        else {
            return Ok(false);
        };
        if filed_under == query_key {
            return Ok(false);
        }
        Ok(match kind {
            QueryKind::Single => self.get_str(&filed_under)?.as_deref() == Some(id),
            QueryKind::Multiple => self.set_ref(&filed_under)?.is_some_and(|set| set.contains(id)),
        })
    }

    // A single-result entry is about to change hands: its former id must not point at it anymore.
    fn drop_occupant(&mut self, reverse: &str, query_key: &str, new_id: &str) -> Result<(), StoreError> {
        if let Some(prev) = self.get_str(query_key)? {
            if prev != new_id && !is_void(&prev) && self.hget(reverse, &prev)?.as_deref() == Some(query_key) {
                self.hdel(reverse, &prev)?;
            }
        }
        Ok(())
    }

    fn forget(&mut self, reverse: &str, query_key: &str, kind: QueryKind) -> Result<(), StoreError> {
        let ids = match kind {
            QueryKind::Single => self.get_str(query_key)?.into_iter().collect::<Vec<_>>(),
            QueryKind::Multiple => self.smembers(query_key)?.unwrap_or_default(),
        };
        for id in ids.iter().filter(|id| !is_void(id)) {
            if self.hget(reverse, id)?.as_deref() == Some(query_key) {
                self.hdel(reverse, id)?;
            }
        }
        self.del(query_key);
        Ok(())
    }

    fn store_result(
        &mut self,
        reverse: &str,
        query_key: &str,
        values: &[&str],
        kind: QueryKind,
    ) -> Result<(), StoreError> {
        let ids = values.iter().copied().filter(|v| !is_void(v)).collect::<Vec<_>>();

        if kind == QueryKind::Single && ids.len() > 1 {
            return Err(StoreError::Script(format!(
                "single-result query key '{query_key}' given {} ids",
                ids.len()
            )));
        }

        // A write that landed while the query ran has already filed the id elsewhere. That membership is newer than
        // this result, so the entry is left unknown instead.
        for id in &ids {
            if self.filed_elsewhere(reverse, id, query_key, kind)? {
                trace!("{id} is filed elsewhere, leaving '{query_key}' unknown");
                return self.forget(reverse, query_key, kind);
            }
        }

        match kind {
            QueryKind::Single => {
                self.drop_occupant(reverse, query_key, ids.first().copied().unwrap_or(VOID))?;
                match ids.first() {
                    Some(id) => {
                        self.evict(reverse, id, kind, Some(query_key))?;
                        self.set_str(query_key, id, None, false);
                        self.hset(reverse, id, query_key)?;
                    }
                    None => {
                        self.set_str(query_key, VOID, None, false);
                    }
                }
            }
            QueryKind::Multiple => {
                if let Some(former) = self.smembers(query_key)? {
                    for member in former.iter().filter(|m| !is_void(m) && !ids.contains(&m.as_str())) {
                        if self.hget(reverse, member)?.as_deref() == Some(query_key) {
                            self.hdel(reverse, member)?;
                        }
                    }
                }
                self.del(query_key);

                if ids.is_empty() {
                    self.sadd(query_key, [VOID])?;
                }
                else {
                    for id in &ids {
                        self.evict(reverse, id, kind, Some(query_key))?;
                    }
                    self.sadd(query_key, ids.iter().copied())?;
                    for id in &ids {
                        self.hset(reverse, id, query_key)?;
                    }
                }
            }
        }
        Ok(())
    }
}

struct Frame<'a> {
    layout: Layout,
    keys:   &'a [String],
    args:   &'a [String],
    record: usize,
}

impl<'a> Frame<'a> {
    fn key(&self, slot: KeyRef) -> Result<&'a str, StoreError> {
        let idx = match (self.layout, slot) {
            (Layout::Variadic, KeyRef::Shared(i)) => i,
            (Layout::Fixed { shared_keys, .. }, KeyRef::Shared(i)) if i < shared_keys => i,
            (
                Layout::Fixed {
                    shared_keys,
                    local_keys,
                    ..
                },
                KeyRef::Local(i),
            ) if i < local_keys => shared_keys + self.record * local_keys + i,
            _ => return Err(StoreError::Script(format!("key slot {slot:?} out of layout"))),
        };
        self.keys
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Script(format!("missing key #{idx}")))
    }

    fn arg(&self, slot: ArgRef) -> Result<&'a str, StoreError> {
        let idx = match (self.layout, slot) {
            (Layout::Variadic, ArgRef::Shared(i)) => i,
            (Layout::Fixed { shared_args, .. }, ArgRef::Shared(i)) if i < shared_args => i,
            (
                Layout::Fixed {
                    shared_args,
                    local_args,
                    ..
                },
                ArgRef::Local(i),
            ) if i < local_args => shared_args + self.record * local_args + i,
            _ => return Err(StoreError::Script(format!("argument slot {slot:?} out of layout"))),
        };
        self.args
            .get(idx)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Script(format!("missing argument #{idx}")))
    }

    fn ttl(&self, slot: Option<ArgRef>) -> Result<Option<Duration>, StoreError> {
        let Some(slot) = slot
        else {
            return Ok(None);
        };
        let raw = self.arg(slot)?;
        raw.parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| StoreError::Script(format!("invalid ttl argument {raw:?}")))
    }
}

// Splits `query_key, value..., SEPARATOR` groups.
fn groups(args: &[String]) -> Result<Vec<(&str, Vec<&str>)>, StoreError> {
    let mut groups = Vec::new();
    let mut rest = args;
    while let Some(end) = rest.iter().position(|a| a == SEPARATOR) {
        let (group, tail) = rest.split_at(end);
        let Some((query_key, values)) = group.split_first()
        else {
            return Err(StoreError::Script("empty result group".to_string()));
        };
        groups.push((query_key.as_str(), values.iter().map(String::as_str).collect()));
        rest = &tail[1..];
    }
    if !rest.is_empty() {
        return Err(StoreError::Script("result group not terminated by separator".to_string()));
    }
    Ok(groups)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.keyspace.lock().get_str(key)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let mut ks = self.keyspace.lock();
        Ok(keys.iter().map(|k| ks.get_str(k).ok().flatten()).collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.keyspace.lock().set_str(key, value, ttl, false);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError> {
        Ok(self.keyspace.lock().set_str(key, value, ttl, true))
    }

    async fn mset(&self, pairs: &[(String, String)]) -> Result<(), StoreError> {
        let mut ks = self.keyspace.lock();
        for (k, v) in pairs {
            ks.set_str(k, v, None, false);
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut ks = self.keyspace.lock();
        Ok(keys.iter().filter(|k| ks.del(k)).count())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.keyspace.lock().exists(key))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        self.keyspace.lock().sadd(key, members.iter().map(String::as_str))
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        self.keyspace.lock().srem(key, members.iter().map(String::as_str))
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.keyspace.lock().set_ref(key)?.map_or(0, |s| s.len()))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.keyspace.lock().smembers(key)?.unwrap_or_default())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.keyspace.lock().hget(key, field)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.keyspace.lock().hset(key, field, value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.keyspace.lock().hdel(key, field)
    }

    async fn script_load(&self, script: &Script) -> Result<String, StoreError> {
        self.keyspace
            .lock()
            .scripts
            .insert(script.hash().to_string(), Arc::new(script.program().clone()));
        Ok(script.hash().to_string())
    }

    async fn eval_hash(&self, hash: &str, keys: &[String], args: &[String]) -> Result<Vec<String>, StoreError> {
        let mut ks = self.keyspace.lock();
        let Some(program) = ks.scripts.get(hash).cloned()
        else {
            self.no_script.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::NoScript(hash.to_string()));
        };
        self.hash_evals.fetch_add(1, Ordering::Relaxed);
        ks.run(&program, keys, args)
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Vec<String>, StoreError> {
        let mut ks = self.keyspace.lock();
        let program = Arc::new(script.program().clone());
        ks.scripts.insert(script.hash().to_string(), Arc::clone(&program));
        self.full_evals.fetch_add(1, Ordering::Relaxed);
        ks.run(&program, keys, args)
    }
}
