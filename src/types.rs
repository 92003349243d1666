use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use fieldx::fxstruct;
use serde::Deserialize;

use crate::error::CacheError;

const MIN_TTL: Duration = Duration::from_millis(1);

/// Outcome of a cache-layer lookup.
///
/// `NotFound` means the entity is known not to exist; `Unknown` means nobody could tell: the cache had nothing and
/// there was no secondary layer to ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Unknown,
}

impl<T> Lookup<T> {
    #[inline]
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Lookup::Unknown)
    }

    /// Collapses both `NotFound` and `Unknown` into `None`.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound | Lookup::Unknown => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Lookup<U> {
        match self {
            Lookup::Found(v) => Lookup::Found(f(v)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Unknown => Lookup::Unknown,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Lookup::NotFound, Lookup::Found)
    }
}

/// How a cache write treats an already existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum CacheMode {
    NoCache,
    CacheIfNotExist,
    CacheAndOverwrite,
}

impl CacheMode {
    pub fn code(&self) -> u8 {
        match self {
            CacheMode::NoCache => 0,
            CacheMode::CacheIfNotExist => 1,
            CacheMode::CacheAndOverwrite => 2,
        }
    }
}

impl Display for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CacheMode::NoCache => "NoCache",
            CacheMode::CacheIfNotExist => "CacheIfNotExist",
            CacheMode::CacheAndOverwrite => "CacheAndOverwrite",
        })
    }
}

impl FromStr for CacheMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "NoCache" | "no_cache" | "0" => Ok(CacheMode::NoCache),
            "CacheIfNotExist" | "cache_if_not_exist" | "1" => Ok(CacheMode::CacheIfNotExist),
            "CacheAndOverwrite" | "cache_and_overwrite" | "2" => Ok(CacheMode::CacheAndOverwrite),
            other => Err(CacheError::UnsupportedCacheMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for CacheMode {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<u8> for CacheMode {
    type Error = CacheError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CacheMode::NoCache),
            1 => Ok(CacheMode::CacheIfNotExist),
            2 => Ok(CacheMode::CacheAndOverwrite),
            other => Err(CacheError::UnsupportedCacheMode(other.to_string())),
        }
    }
}

/// Shape of a query's cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// The cache entry is a scalar holding one id.
    Single,
    /// The cache entry is a set of ids.
    Multiple,
}

impl QueryKind {
    #[inline]
    pub fn is_multiple(&self) -> bool {
        matches!(self, QueryKind::Multiple)
    }
}

/// Per-call persistence policy.
///
/// `negative_cache` left as `None` falls back to the model manager's setting.
#[derive(Clone, Debug, PartialEq, Eq)]
#[fxstruct(no_new, builder, get(copy))]
pub struct PersistencyOptions {
    #[fieldx(default(CacheMode::CacheAndOverwrite))]
    cache_mode:             CacheMode,
    #[fieldx(default(None))]
    ttl:                    Option<Duration>,
    #[fieldx(default(false))]
    ignore_primary_layer:   bool,
    #[fieldx(default(false))]
    ignore_secondary_layer: bool,
    #[fieldx(default(None))]
    negative_cache:         Option<bool>,
}

impl PersistencyOptions {
    pub fn new(cache_mode: CacheMode) -> Self {
        Self {
            cache_mode,
            ttl: None,
            ignore_primary_layer: false,
            ignore_secondary_layer: false,
            negative_cache: None,
        }
    }

    pub fn overwrite() -> Self {
        Self::new(CacheMode::CacheAndOverwrite)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_negative_cache(mut self, negative_cache: bool) -> Self {
        self.negative_cache = Some(negative_cache);
        self
    }

    pub fn with_ignore_primary_layer(mut self, ignore: bool) -> Self {
        self.ignore_primary_layer = ignore;
        self
    }

    pub fn with_ignore_secondary_layer(mut self, ignore: bool) -> Self {
        self.ignore_secondary_layer = ignore;
        self
    }

    /// TTL as handed to the store, which counts in whole milliseconds and can't take a zero.
    #[inline]
    pub(crate) fn store_ttl(&self) -> Option<Duration> {
        self.ttl.map(|ttl| ttl.max(MIN_TTL))
    }

    #[inline]
    pub(crate) fn effective_negative_cache(&self, model_default: bool) -> bool {
        self.negative_cache.unwrap_or(model_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_mode_parsing() {
        assert_eq!("CacheIfNotExist".parse::<CacheMode>().unwrap(), CacheMode::CacheIfNotExist);
        assert_eq!("no_cache".parse::<CacheMode>().unwrap(), CacheMode::NoCache);
        assert_eq!(CacheMode::try_from(2u8).unwrap(), CacheMode::CacheAndOverwrite);

        let err = "CacheSometimes".parse::<CacheMode>().unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedCacheMode(ref m) if m == "CacheSometimes"));
        assert!(matches!(CacheMode::try_from(7u8), Err(CacheError::UnsupportedCacheMode(_))));
    }

    #[test]
    fn cache_mode_code_round_trips() {
        for mode in [CacheMode::NoCache, CacheMode::CacheIfNotExist, CacheMode::CacheAndOverwrite] {
            assert_eq!(CacheMode::try_from(mode.code()).unwrap(), mode);
            assert_eq!(mode.to_string().parse::<CacheMode>().unwrap(), mode);
        }
    }

    #[test]
    fn options_builder() {
        let opts = PersistencyOptions::builder()
            .cache_mode(CacheMode::CacheIfNotExist)
            .ttl(Some(Duration::from_secs(5)))
            .build()
            .unwrap();
        assert_eq!(opts.cache_mode(), CacheMode::CacheIfNotExist);
        assert_eq!(opts.ttl(), Some(Duration::from_secs(5)));
        assert!(!opts.ignore_primary_layer());
        assert!(opts.effective_negative_cache(true));
        assert!(!opts.with_negative_cache(false).effective_negative_cache(true));
    }

    #[test]
    fn store_ttl_is_at_least_a_millisecond() {
        let opts = PersistencyOptions::overwrite();
        assert_eq!(opts.store_ttl(), None);
        for tiny in [Duration::ZERO, Duration::from_micros(300)] {
            assert_eq!(opts.clone().with_ttl(tiny).store_ttl(), Some(Duration::from_millis(1)));
        }
        assert_eq!(
            opts.with_ttl(Duration::from_millis(250)).store_ttl(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn lookup_conversions() {
        assert_eq!(Lookup::from(Some(1)), Lookup::Found(1));
        assert_eq!(Lookup::<u32>::from(None), Lookup::NotFound);
        assert_eq!(Lookup::<u32>::Unknown.found(), None);
        assert_eq!(Lookup::Found(2).map(|v| v * 2), Lookup::Found(4));
    }
}
