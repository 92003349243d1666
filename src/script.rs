//! Atomic transaction programs.
//!
//! A [`Program`] is a short list of [`Step`]s addressing the keys and arguments of a single invocation through
//! [`KeyRef`]/[`ArgRef`] slots. The program text (its canonical listing) is what gets hashed and shipped to the store;
//! only the keys and arguments vary between calls of the same shape.
//!
//! With [`Layout::Fixed`] the key and argument lists are split into a shared head followed by fixed-size records. A
//! program with `repeat` set runs its steps once per record; otherwise exactly one record is expected. With
//! [`Layout::Variadic`] the steps consume the whole key/argument lists themselves.

use sha2::Digest;
use sha2::Sha256;
use std::fmt::Display;
use std::fmt::Write;

use crate::error::StoreError;
use crate::types::CacheMode;
use crate::types::QueryKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRef {
    Shared(usize),
    Local(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgRef {
    Shared(usize),
    Local(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Looks up `reverse[id]`. When present, removes the id from that query entry (a multiple-result set receives the
    /// void marker if it becomes empty; a single-result scalar is voided if it still holds the id) and drops the
    /// reverse-hash field.
    EvictFromQuery {
        reverse: KeyRef,
        id:      ArgRef,
        kind:    QueryKind,
    },
    /// Files the id under `query_key` unless the argument is the void marker. A single-result entry is overwritten,
    /// its former occupant losing its reverse-hash field. A multiple-result set is only extended if it already exists;
    /// the void marker is cleared first. On success `reverse[id] = query_key`.
    FileIntoQuery {
        reverse:   KeyRef,
        id:        ArgRef,
        query_key: ArgRef,
        kind:      QueryKind,
    },
    /// `SET key value [PX ttl] [NX]`.
    WriteEntity {
        key:            KeyRef,
        value:          ArgRef,
        only_if_absent: bool,
        ttl:            Option<ArgRef>,
    },
    /// Removes the entry or, with `void` set, replaces it with the void marker.
    RemoveEntity {
        key:  KeyRef,
        void: bool,
        ttl:  Option<ArgRef>,
    },
    /// Variadic. Arguments are groups of `query_key, value..., SEPARATOR`; a lone void value records an empty result.
    /// Each group replaces the cached membership of its key and keeps `reverse` in sync.
    StoreQueryResults { reverse: KeyRef, kind: QueryKind },
    /// Variadic. Arguments are query keys; each entry is dropped along with the reverse-hash fields of its ids.
    ForgetQueryResults { reverse: KeyRef, kind: QueryKind },
    /// Variadic. Replies with the members of every key followed by a separator.
    ReadQuerySets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Fixed {
        shared_keys: usize,
        shared_args: usize,
        local_keys:  usize,
        local_args:  usize,
        repeat:      bool,
    },
    Variadic,
}

impl Layout {
    /// Number of records an invocation with the given lists carries.
    pub fn records(&self, keys: usize, args: usize) -> Result<usize, StoreError> {
        let Layout::Fixed {
            shared_keys,
            shared_args,
            local_keys,
            local_args,
            repeat,
        } = *self
        else {
            return Ok(1);
        };

        if keys < shared_keys || args < shared_args {
            return Err(StoreError::Script(format!(
                "expected at least {shared_keys} keys and {shared_args} arguments, got {keys} and {args}"
            )));
        }

        let (keys, args) = (keys - shared_keys, args - shared_args);
        let by_keys = if local_keys > 0 { Some((keys / local_keys, keys % local_keys)) } else { None };
        let by_args = if local_args > 0 { Some((args / local_args, args % local_args)) } else { None };

        let count = match (by_keys, by_args) {
            (Some((k, 0)), Some((a, 0))) if k == a => k,
            (Some((k, 0)), None) if args == 0 => k,
            (None, Some((a, 0))) if keys == 0 => a,
            (None, None) if keys == 0 && args == 0 => 1,
            _ => {
                return Err(StoreError::Script(format!(
                    "{keys} keys and {args} arguments don't split into records of {local_keys} keys and {local_args} \
                     arguments"
                )))
            }
        };

        if !repeat && count != 1 {
            return Err(StoreError::Script(format!("single-record program invoked with {count} records")));
        }

        Ok(count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    layout: Layout,
    steps:  Vec<Step>,
}

impl Program {
    pub fn new(layout: Layout, steps: Vec<Step>) -> Self {
        Self { layout, steps }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

struct Slot<T>(T);

impl Display for Slot<KeyRef> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            KeyRef::Shared(i) => write!(f, "K{i}"),
            KeyRef::Local(i) => write!(f, "k{i}"),
        }
    }
}

impl Display for Slot<ArgRef> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            ArgRef::Shared(i) => write!(f, "A{i}"),
            ArgRef::Local(i) => write!(f, "a{i}"),
        }
    }
}

fn kind_name(kind: QueryKind) -> &'static str {
    match kind {
        QueryKind::Single => "single",
        QueryKind::Multiple => "multiple",
    }
}

fn opt_slot(slot: Option<ArgRef>) -> String {
    slot.map_or_else(|| "-".to_string(), |s| Slot(s).to_string())
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Step::EvictFromQuery { reverse, id, kind } => {
                write!(f, "evict reverse={} id={} kind={}", Slot(reverse), Slot(id), kind_name(kind))
            }
            Step::FileIntoQuery {
                reverse,
                id,
                query_key,
                kind,
            } => write!(
                f,
                "file reverse={} id={} query_key={} kind={}",
                Slot(reverse),
                Slot(id),
                Slot(query_key),
                kind_name(kind)
            ),
            Step::WriteEntity {
                key,
                value,
                only_if_absent,
                ttl,
            } => write!(
                f,
                "write key={} value={} nx={only_if_absent} ttl={}",
                Slot(key),
                Slot(value),
                opt_slot(ttl)
            ),
            Step::RemoveEntity { key, void, ttl } => {
                write!(f, "remove key={} void={void} ttl={}", Slot(key), opt_slot(ttl))
            }
            Step::StoreQueryResults { reverse, kind } => {
                write!(f, "store_results reverse={} kind={}", Slot(reverse), kind_name(kind))
            }
            Step::ForgetQueryResults { reverse, kind } => {
                write!(f, "forget_results reverse={} kind={}", Slot(reverse), kind_name(kind))
            }
            Step::ReadQuerySets => f.write_str("read_sets"),
        }
    }
}

impl Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.layout {
            Layout::Fixed {
                shared_keys,
                shared_args,
                local_keys,
                local_args,
                repeat,
            } => writeln!(
                f,
                "layout fixed shared_keys={shared_keys} shared_args={shared_args} local_keys={local_keys} \
                 local_args={local_args} repeat={repeat}"
            )?,
            Layout::Variadic => writeln!(f, "layout variadic")?,
        }
        for step in &self.steps {
            writeln!(f, "{step}")?;
        }
        Ok(())
    }
}

/// A compiled program: its canonical source and the hash the store knows it by.
#[derive(Debug, Clone)]
pub struct Script {
    program: Program,
    source:  String,
    hash:    String,
}

impl Script {
    pub fn new(program: Program) -> Self {
        let source = program.to_string();
        let hash = script_hash(&source);
        Self { program, source, hash }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

pub fn script_hash(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptOp {
    Update,
    Delete,
    Populate,
    StoreQueryResults,
    ForgetQueryResults,
    ReadQuerySets,
}

/// Everything a generated program depends on. Two calls with equal shapes run the same compiled script.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptShape {
    op:         ScriptOp,
    batch:      bool,
    queries:    Vec<QueryKind>,
    cache_mode: CacheMode,
    ttl:        bool,
    negative:   bool,
}

impl ScriptShape {
    pub fn update(queries: Vec<QueryKind>, cache_mode: CacheMode, ttl: bool, batch: bool) -> Self {
        Self {
            op: ScriptOp::Update,
            batch,
            queries,
            cache_mode,
            // NoCache never writes the entity, ttl is meaningless then.
            ttl: ttl && cache_mode != CacheMode::NoCache,
            negative: false,
        }
    }

    pub fn delete(queries: Vec<QueryKind>, negative: bool, ttl: bool, batch: bool) -> Self {
        Self {
            op: ScriptOp::Delete,
            batch,
            queries,
            cache_mode: CacheMode::CacheAndOverwrite,
            ttl: ttl && negative,
            negative,
        }
    }

    /// Batched entity-cache population. `NoCache` never reaches the store.
    pub fn populate(cache_mode: CacheMode, ttl: bool) -> Self {
        Self {
            op: ScriptOp::Populate,
            batch: true,
            queries: Vec::new(),
            cache_mode,
            ttl,
            negative: false,
        }
    }

    pub fn store_query_results(kind: QueryKind) -> Self {
        Self {
            op:         ScriptOp::StoreQueryResults,
            batch:      true,
            queries:    vec![kind],
            cache_mode: CacheMode::CacheAndOverwrite,
            ttl:        false,
            negative:   false,
        }
    }

    pub fn forget_query_results(kind: QueryKind) -> Self {
        Self {
            op:         ScriptOp::ForgetQueryResults,
            batch:      true,
            queries:    vec![kind],
            cache_mode: CacheMode::CacheAndOverwrite,
            ttl:        false,
            negative:   false,
        }
    }

    pub fn read_query_sets() -> Self {
        Self {
            op:         ScriptOp::ReadQuerySets,
            batch:      true,
            queries:    vec![QueryKind::Multiple],
            cache_mode: CacheMode::CacheAndOverwrite,
            ttl:        false,
            negative:   false,
        }
    }

    pub fn op(&self) -> ScriptOp {
        self.op
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }

    pub fn queries(&self) -> &[QueryKind] {
        &self.queries
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn has_ttl(&self) -> bool {
        self.ttl
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Short label for logging.
    pub fn label(&self) -> String {
        let mut label = format!("{:?}", self.op).to_lowercase();
        let _ = write!(
            label,
            "[q={} mode={} ttl={} neg={} batch={}]",
            self.queries.len(),
            self.cache_mode.code(),
            self.ttl,
            self.negative,
            self.batch
        );
        label
    }
}
