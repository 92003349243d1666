use thiserror::Error;

/// Boxed error produced by the collaborators this crate doesn't own: secondary layers and query functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Failures reported by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store doesn't hold a program under this hash. Recoverable by sending the full script.
    #[error("NOSCRIPT no script registered under hash {0}")]
    NoScript(String),

    #[error("WRONGTYPE operation against key '{0}' holding the wrong kind of value")]
    WrongType(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[inline]
    pub fn is_no_script(&self) -> bool {
        matches!(self, StoreError::NoScript(_))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("unsupported cache mode: '{0}'")]
    UnsupportedCacheMode(String),

    #[error("query '{alias}' is already registered with model '{model}'")]
    DuplicateQuery { model: String, alias: String },

    #[error("query '{alias}' belongs to model '{got}', not '{expected}'")]
    ForeignQuery {
        alias:    String,
        expected: String,
        got:      String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A cached value decodes neither as an id nor as a reserved marker.
    #[error("query corrupted: key '{key}' holds undecodable value {value:?}")]
    QueryCorrupted { key: String, value: String },

    #[error("value for key '{0}' collides with a reserved cache marker")]
    ReservedValue(String),

    #[error("id '{0}' falls into the reverse hash namespace")]
    ReservedId(String),

    #[error("secondary layer failure: {0}")]
    Secondary(#[source] BoxError),

    #[error("query '{alias}' failed: {source}")]
    Query {
        alias:  String,
        #[source]
        source: BoxError,
    },

    #[error("query '{alias}' returned {got} results for {expected} parameter sets")]
    QueryContract { alias: String, expected: usize, got: usize },
}

impl CacheError {
    pub fn secondary<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        CacheError::Secondary(err.into())
    }

    pub fn query<E>(alias: &str, err: E) -> Self
    where
        E: Into<BoxError>,
    {
        CacheError::Query {
            alias:  alias.to_string(),
            source: err.into(),
        }
    }

    pub fn config<S: ToString>(msg: S) -> Self {
        CacheError::Config(msg.to_string())
    }
}
