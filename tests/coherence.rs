use async_trait::async_trait;
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use tracing_subscriber::EnvFilter;
use wt_cache::prelude::*;
use wt_cache::test::user_manager;
use wt_cache::test::MemoryBackend;
use wt_cache::test::User;
use wt_cache::test::UserModel;
use wt_cache::test::UsersByEmail;
use wt_cache::test::UsersByGroup;

type TestResult = Result<(), Box<dyn Error>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Email lookup that, on its first run, sees the user under the old email and then lets a concurrent write move them
// to a new one before the result gets back to the cache.
struct MovedMidQuery {
    backend: Arc<MemoryBackend>,
    users:   Weak<ModelManager<UserModel>>,
    moved:   AtomicBool,
}

#[async_trait]
impl SingleQuery<UserModel> for MovedMidQuery {
    type Params = String;

    fn query_key(&self, email: &String) -> String {
        format!("user:email:{email}")
    }

    fn entity_key(&self, user: &User) -> Option<String> {
        Some(self.query_key(&user.email))
    }

    async fn query(&self, email: &String) -> Result<Option<u64>, BoxError> {
        let found = self.backend.select(|u| &u.email == email).first().map(|u| u.id);
        if !self.moved.swap(true, Ordering::SeqCst) {
            let users = self.users.upgrade().ok_or("model manager dropped")?;
            let moved = User::new(1, "b", "g");
            self.backend.put(moved.clone());
            users.update(&moved, &PersistencyOptions::overwrite()).await?;
        }
        Ok(found)
    }
}

fn ids(users: &[User]) -> Vec<u64> {
    let mut ids = users.iter().map(|u| u.id).collect::<Vec<_>>();
    ids.sort();
    ids
}

#[tokio::test]
async fn update_moves_single_result_membership() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::new();
    let users = user_manager(store.clone(), backend.clone(), false);
    let by_email = users.add_single_query("by_email", UsersByEmail::new(backend.clone()))?;
    let options = PersistencyOptions::overwrite();

    let first = User::new(1, "a", "staff");
    backend.put(first.clone());
    users.update(&first, &options).await?;
    assert_eq!(users.get(&1, &options).await?, Lookup::Found(first.clone()));

    let second = User::new(1, "b", "staff");
    backend.put(second.clone());
    users.update(&second, &options).await?;

    assert_eq!(by_email.get(&"a".to_string(), &options).await?, Lookup::NotFound);
    assert_eq!(by_email.get(&"b".to_string(), &options).await?, Lookup::Found(second));
    // Both answers came from the cache maintained by the writes.
    assert_eq!(backend.calls().queries, 0);

    Ok(())
}

#[tokio::test]
async fn write_during_query_keeps_newer_membership() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::with_users([User::new(1, "a", "g")]);
    let users = user_manager(store.clone(), backend.clone(), false);
    let by_email = users.add_single_query(
        "by_email",
        MovedMidQuery {
            backend: backend.clone(),
            users:   Arc::downgrade(&users),
            moved:   AtomicBool::new(false),
        },
    )?;
    let options = PersistencyOptions::overwrite();

    // The read itself still answers with what the query saw.
    assert!(by_email.get(&"a".to_string(), &options).await?.is_found());

    let moved = User::new(1, "b", "g");
    assert_eq!(store.get("user:email:b").await?.as_deref(), Some("1"));
    assert!(!store.exists("user:email:a").await?, "outdated result was cached");
    assert_eq!(by_email.get(&"b".to_string(), &options).await?, Lookup::Found(moved));
    assert_eq!(by_email.get(&"a".to_string(), &options).await?, Lookup::NotFound);

    Ok(())
}

#[tokio::test]
async fn delete_cleans_up_multi_result_sets() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::with_users([
        User::new(1, "one", "g1"),
        User::new(2, "two", "g1"),
        User::new(3, "three", "g2"),
    ]);
    let users = user_manager(store.clone(), backend.clone(), false);
    let by_group = users.add_multi_query("by_group", UsersByGroup::new(backend.clone()))?;
    let options = PersistencyOptions::overwrite();
    let g1 = "g1".to_string();

    let members = by_group.get(&g1, &options).await?.found().unwrap_or_default();
    assert_eq!(ids(&members), vec![1, 2]);
    assert_eq!(backend.calls().queries, 1);

    backend.remove(1);
    users.delete(&1, &options).await?;
    let members = by_group.get(&g1, &options).await?.found().unwrap_or_default();
    assert_eq!(ids(&members), vec![2]);

    backend.remove(2);
    users.delete(&2, &options).await?;
    assert_eq!(by_group.get(&g1, &options).await?, Lookup::Found(vec![]));
    assert_eq!(store.smembers("user:group:g1").await?, vec![wt_cache::keys::VOID.to_string()]);
    assert_eq!(
        store.hget(by_group.reverse_hash_key(), "2").await?,
        None,
        "reverse hash field survived the delete"
    );

    // Moving a user into an evaluated, empty group fills it without re-running the query.
    let moved = User::new(3, "three", "g1");
    backend.put(moved.clone());
    users.update(&moved, &options).await?;
    assert_eq!(by_group.get(&g1, &options).await?, Lookup::Found(vec![moved]));
    assert_eq!(backend.calls().queries, 1);

    // g2 was never evaluated; now it is, and it's empty.
    assert_eq!(by_group.get(&"g2".to_string(), &options).await?, Lookup::Found(vec![]));
    assert_eq!(backend.calls().queries, 2);

    Ok(())
}

#[tokio::test]
async fn unknown_sets_stay_unknown() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::with_users([User::new(1, "one", "g1")]);
    let users = user_manager(store.clone(), backend.clone(), false);
    let by_group = users.add_multi_query("by_group", UsersByGroup::new(backend.clone()))?;
    let options = PersistencyOptions::overwrite();

    let newcomer = User::new(2, "two", "g1");
    backend.put(newcomer.clone());
    users.update(&newcomer, &options).await?;
    assert!(!store.exists("user:group:g1").await?);

    // A partial set would have hidden user 1.
    let members = by_group.get(&"g1".to_string(), &options).await?.found().unwrap_or_default();
    assert_eq!(ids(&members), vec![1, 2]);

    Ok(())
}

#[tokio::test]
async fn batch_and_single_reads_agree() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::with_users((1..=5).map(|id| User::new(id, &format!("u{id}"), "all")));
    let users = user_manager(store.clone(), backend.clone(), false);
    let options = PersistencyOptions::overwrite();
    let requested = [5, 1, 3, 42, 1];

    // Some entries cached, some not.
    users.get(&3, &options).await?;

    let batch = users.m_get(&requested, &options).await?;

    let mut single = Vec::new();
    for id in &requested[..4] {
        if let Lookup::Found(user) = users.get(id, &options).await? {
            single.push(user);
        }
    }

    assert_eq!(ids(&batch), vec![1, 3, 5]);
    assert_eq!(ids(&batch), ids(&single));
    assert_eq!(backend.calls().get_by_ids, 1);

    Ok(())
}

#[tokio::test]
async fn round_trip_per_cache_mode() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::new();
    let users = user_manager(store.clone(), backend.clone(), false);
    let cache_only = PersistencyOptions::overwrite().with_ignore_secondary_layer(true);

    let user = User::new(1, "a", "g");
    users.update(&user, &PersistencyOptions::new(CacheMode::CacheAndOverwrite)).await?;
    assert_eq!(users.get(&1, &cache_only).await?, Lookup::Found(user.clone()));

    // Doesn't overwrite an existing entry.
    let renamed = User::new(1, "b", "g");
    users.update(&renamed, &PersistencyOptions::new(CacheMode::CacheIfNotExist)).await?;
    assert_eq!(users.get(&1, &cache_only).await?, Lookup::Found(user.clone()));

    let other = User::new(2, "c", "g");
    users.update(&other, &PersistencyOptions::new(CacheMode::CacheIfNotExist)).await?;
    assert_eq!(users.get(&2, &cache_only).await?, Lookup::Found(other));

    users.update(&renamed, &PersistencyOptions::new(CacheMode::NoCache)).await?;
    assert_eq!(users.get(&1, &cache_only).await?, Lookup::Unknown);

    Ok(())
}

#[tokio::test]
async fn batch_writes() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::new();
    let users = user_manager(store.clone(), backend.clone(), false);
    let by_email = users.add_single_query("by_email", UsersByEmail::new(backend.clone()))?;
    let by_group = users.add_multi_query("by_group", UsersByGroup::new(backend.clone()))?;
    let options = PersistencyOptions::overwrite();
    let team = "team".to_string();

    assert_eq!(by_group.get(&team, &options).await?, Lookup::Found(vec![]));

    let batch = (1..=4).map(|id| User::new(id, &format!("u{id}"), "team")).collect::<Vec<_>>();
    for user in &batch {
        backend.put(user.clone());
    }
    users.m_update(&batch, &options).await?;

    let members = by_group.get(&team, &options).await?.found().unwrap_or_default();
    assert_eq!(ids(&members), vec![1, 2, 3, 4]);
    assert_eq!(
        by_email.get(&"u3".to_string(), &options).await?,
        Lookup::Found(batch[2].clone())
    );

    for id in [2, 4] {
        backend.remove(id);
    }
    users.m_delete(&[2, 4], &options).await?;

    let members = by_group.get(&team, &options).await?.found().unwrap_or_default();
    assert_eq!(ids(&members), vec![1, 3]);
    assert_eq!(by_email.get(&"u4".to_string(), &options).await?, Lookup::NotFound);
    assert_eq!(backend.calls().queries, 1);

    Ok(())
}

#[tokio::test]
async fn concurrent_updates_land_in_one_set() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::new();
    let users = user_manager(store.clone(), backend.clone(), false);
    let by_group = users.add_multi_query("by_group", UsersByGroup::new(backend.clone()))?;
    let options = PersistencyOptions::overwrite();
    let crowd = "crowd".to_string();

    assert_eq!(by_group.get(&crowd, &options).await?, Lookup::Found(vec![]));

    let mut tasks = Vec::new();
    for id in 1..=16 {
        let users = users.clone();
        let backend = backend.clone();
        let options = options.clone();
        tasks.push(tokio::spawn(async move {
            let user = User::new(id, &format!("u{id}"), "crowd");
            backend.put(user.clone());
            users.update(&user, &options).await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let members = by_group.get(&crowd, &options).await?.found().unwrap_or_default();
    assert_eq!(ids(&members), (1..=16).collect::<Vec<_>>());
    assert_eq!(backend.calls().queries, 1);

    Ok(())
}

// Deterministic pseudo-random sequence of writes; after each one every cached query must agree with the backend.
#[tokio::test]
async fn queries_track_arbitrary_write_sequences() -> TestResult {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let backend = MemoryBackend::new();
    let users = user_manager(store.clone(), backend.clone(), false);
    let by_email = users.add_single_query("by_email", UsersByEmail::new(backend.clone()))?;
    let by_group = users.add_multi_query("by_group", UsersByGroup::new(backend.clone()))?;
    let options = PersistencyOptions::overwrite();
    let groups = ["red", "green", "blue"];

    let mut live: BTreeMap<u64, User> = BTreeMap::new();
    let mut retired_emails = Vec::new();
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move |bound: u64| {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed % bound
    };

    for step in 0..120u64 {
        let id = next(8) + 1;
        if next(4) == 0 {
            if let Some(user) = live.remove(&id) {
                retired_emails.push(user.email);
            }
            backend.remove(id);
            users.delete(&id, &options).await?;
        }
        else {
            let group = groups[next(groups.len() as u64) as usize];
            let user = User::new(id, &format!("u{id}.{step}"), group);
            if let Some(former) = live.insert(id, user.clone()) {
                retired_emails.push(former.email);
            }
            backend.put(user.clone());
            users.update(&user, &options).await?;
        }

        for group in groups {
            let expected = live.values().filter(|u| u.group == group).map(|u| u.id).collect::<Vec<_>>();
            let cached = by_group.get(&group.to_string(), &options).await?.found().unwrap_or_default();
            assert_eq!(ids(&cached), expected, "group {group} after step {step}");
        }
        for user in live.values() {
            assert_eq!(
                by_email.get(&user.email, &options).await?,
                Lookup::Found(user.clone()),
                "email {} after step {step}",
                user.email
            );
        }
        if let Some(email) = retired_emails.last() {
            assert_eq!(by_email.get(email, &options).await?, Lookup::NotFound);
        }
    }

    Ok(())
}
