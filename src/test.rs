#![cfg(any(test, feature = "test"))]
//! Fixtures shared by unit and integration tests: a user model, an in-memory secondary layer counting its calls, and
//! two queries over it.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::BoxError;
use crate::model::JsonModel;
use crate::model_manager::ModelManager;
use crate::store::memory::MemoryStore;
use crate::traits::MultiQuery;
use crate::traits::SecondaryLayer;
use crate::traits::SingleQuery;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id:    u64,
    pub email: String,
    pub group: String,
}

impl User {
    pub fn new(id: u64, email: &str, group: &str) -> Self {
        Self {
            id,
            email: email.to_string(),
            group: group.to_string(),
        }
    }
}

pub type UserModel = JsonModel<User, u64>;

pub fn user_model() -> UserModel {
    JsonModel::new("user", "user:", |u: &User| u.id)
}

/// Calls received by a [`MemoryBackend`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendCalls {
    pub get_by_id:              usize,
    pub get_by_ids:             usize,
    pub get_by_ids_ordered_asc: usize,
    pub queries:                usize,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    users:                  RwLock<BTreeMap<u64, User>>,
    get_by_id:              AtomicUsize,
    get_by_ids:             AtomicUsize,
    get_by_ids_ordered_asc: AtomicUsize,
    queries:                AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_users<I: IntoIterator<Item = User>>(users: I) -> Arc<Self> {
        let backend = Self::new();
        for user in users {
            backend.put(user);
        }
        backend
    }

    pub fn put(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    pub fn remove(&self, id: u64) -> Option<User> {
        self.users.write().remove(&id)
    }

    pub fn calls(&self) -> BackendCalls {
        BackendCalls {
            get_by_id:              self.get_by_id.load(Ordering::Relaxed),
            get_by_ids:             self.get_by_ids.load(Ordering::Relaxed),
            get_by_ids_ordered_asc: self.get_by_ids_ordered_asc.load(Ordering::Relaxed),
            queries:                self.queries.load(Ordering::Relaxed),
        }
    }

    /// Runs a query over the stored users. Counted in [`BackendCalls::queries`].
    pub fn select<F: Fn(&User) -> bool>(&self, predicate: F) -> Vec<User> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.users.read().values().filter(|u| predicate(u)).cloned().collect()
    }
}

#[async_trait]
impl SecondaryLayer<UserModel> for MemoryBackend {
    async fn get_by_id(&self, id: &u64) -> Result<Option<User>, BoxError> {
        self.get_by_id.fetch_add(1, Ordering::Relaxed);
        Ok(self.users.read().get(id).cloned())
    }

    async fn get_by_ids(&self, ids: &[u64]) -> Result<Vec<User>, BoxError> {
        self.get_by_ids.fetch_add(1, Ordering::Relaxed);
        let users = self.users.read();
        // Reverse order on purpose: callers must not rely on it.
        Ok(ids.iter().rev().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn get_by_ids_ordered_asc(&self, ids: &[u64]) -> Result<Vec<User>, BoxError> {
        self.get_by_ids_ordered_asc.fetch_add(1, Ordering::Relaxed);
        let users = self.users.read();
        let mut found = ids.iter().filter_map(|id| users.get(id).cloned()).collect::<Vec<_>>();
        found.sort_by_key(|u| u.id);
        Ok(found)
    }
}

/// Single-result query: the user owning an email address.
pub struct UsersByEmail {
    backend: Arc<MemoryBackend>,
}

impl UsersByEmail {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SingleQuery<UserModel> for UsersByEmail {
    type Params = String;

    fn query_key(&self, email: &String) -> String {
        format!("user:email:{email}")
    }

    fn entity_key(&self, user: &User) -> Option<String> {
        Some(self.query_key(&user.email))
    }

    async fn query(&self, email: &String) -> Result<Option<u64>, BoxError> {
        Ok(self.backend.select(|u| &u.email == email).first().map(|u| u.id))
    }
}

/// Multiple-result query: members of a group. Users with an empty group belong to none.
pub struct UsersByGroup {
    backend: Arc<MemoryBackend>,
}

impl UsersByGroup {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl MultiQuery<UserModel> for UsersByGroup {
    type Params = String;

    fn query_key(&self, group: &String) -> String {
        format!("user:group:{group}")
    }

    fn entity_key(&self, user: &User) -> Option<String> {
        (!user.group.is_empty()).then(|| self.query_key(&user.group))
    }

    async fn query(&self, group: &String) -> Result<Vec<u64>, BoxError> {
        Ok(self.backend.select(|u| &u.group == group).into_iter().map(|u| u.id).collect())
    }
}

/// A user model manager over the given store and backend.
pub fn user_manager(
    store: Arc<MemoryStore>,
    backend: Arc<MemoryBackend>,
    negative_cache: bool,
) -> Arc<ModelManager<UserModel>> {
    match ModelManager::builder()
        .model(user_model())
        .store(store)
        .secondary(backend)
        .negative_cache(negative_cache)
        .build()
    {
        Ok(manager) => manager,
        Err(err) => panic!("user model manager: {err}"),
    }
}
