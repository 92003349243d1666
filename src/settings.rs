//! Process-wide default persistency options.
//!
//! [`CacheSettings`] is meant to be embedded in an application's configuration (it deserializes with serde, every
//! field optional) or loaded from `WTCACHE_*` environment variables.

use serde::Deserialize;
use std::time::Duration;

use crate::error::CacheError;
use crate::error::Result;
use crate::types::CacheMode;
use crate::types::PersistencyOptions;

pub const ENV_CACHE_MODE: &str = "WTCACHE_CACHE_MODE";
pub const ENV_TTL_MS: &str = "WTCACHE_TTL_MS";
pub const ENV_NEGATIVE_CACHE: &str = "WTCACHE_NEGATIVE_CACHE";
pub const ENV_IGNORE_PRIMARY: &str = "WTCACHE_IGNORE_PRIMARY";
pub const ENV_IGNORE_SECONDARY: &str = "WTCACHE_IGNORE_SECONDARY";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub cache_mode:             CacheMode,
    /// Entity entry time to live, milliseconds. Entries don't expire if not set.
    pub ttl_ms:                 Option<u64>,
    /// Overrides the model managers' negative caching flag when set.
    pub negative_cache:         Option<bool>,
    pub ignore_primary_layer:   bool,
    pub ignore_secondary_layer: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_mode:             CacheMode::CacheAndOverwrite,
            ttl_ms:                 None,
            negative_cache:         None,
            ignore_primary_layer:   false,
            ignore_secondary_layer: false,
        }
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CacheError::config(format!("{var}: expected a boolean, got '{value}'"))),
    }
}

impl CacheSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Like [`from_env`](Self::from_env), reading from the given name/value pairs. Unset variables keep their
    /// defaults; unrelated ones are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();

        for (name, value) in vars {
            let (name, value) = (name.as_ref(), value.as_ref());
            match name {
                ENV_CACHE_MODE => settings.cache_mode = value.trim().parse()?,
                ENV_TTL_MS => {
                    settings.ttl_ms = Some(value.trim().parse().map_err(|_| {
                        CacheError::config(format!("{name}: expected milliseconds, got '{value}'"))
                    })?)
                }
                ENV_NEGATIVE_CACHE => settings.negative_cache = Some(parse_bool(name, value)?),
                ENV_IGNORE_PRIMARY => settings.ignore_primary_layer = parse_bool(name, value)?,
                ENV_IGNORE_SECONDARY => settings.ignore_secondary_layer = parse_bool(name, value)?,
                _ => (),
            }
        }

        Ok(settings)
    }

    #[inline]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    pub fn options(&self) -> PersistencyOptions {
        let mut options = PersistencyOptions::new(self.cache_mode)
            .with_ignore_primary_layer(self.ignore_primary_layer)
            .with_ignore_secondary_layer(self.ignore_secondary_layer);
        if let Some(ttl) = self.ttl() {
            options = options.with_ttl(ttl);
        }
        if let Some(negative_cache) = self.negative_cache {
            options = options.with_negative_cache(negative_cache);
        }
        options
    }
}

impl From<&CacheSettings> for PersistencyOptions {
    fn from(settings: &CacheSettings) -> Self {
        settings.options()
    }
}
