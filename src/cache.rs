/// Deduplicating asynchronous cache with change subscriptions
use crate::error::{AuthError, Result};
use crate::store::Subscription;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, warn};

type Fetcher<D, T> = Arc<dyn Fn(D) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;
type StateListener<T> = Arc<dyn Fn(&CacheState<T>) + Send + Sync>;

/// Triggers a background refresh of one cache entry
pub type RefreshTrigger = Arc<dyn Fn() + Send + Sync>;

type OnSubscribe<D> = Arc<dyn Fn(&D, RefreshTrigger) -> Subscription + Send + Sync>;

/// How [`AsyncCache::get_or_wait`] treats an existing value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Return a cached value, fetch only when there is none
    ReadWrite,
    /// Always revalidate; join a fetch that is already running
    WriteOnly,
}

/// Observable state of one cache entry
#[derive(Debug, Clone)]
pub enum CacheState<T> {
    Idle,
    Fetching,
    Ready(T),
    Error(AuthError),
}

impl<T> CacheState<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

struct EntryState<T> {
    result: Option<Result<T>>,
    pending: Option<(u64, SharedFetch<T>)>,
    /// Follow-up fetch that starts once `pending` has landed
    queued: Option<SharedFetch<T>>,
    last_applied: u64,
    next_update: u64,
    subscribers: usize,
    hook: Option<Subscription>,
}

impl<T: Clone> EntryState<T> {
    fn status(&self) -> CacheState<T> {
        match &self.result {
            Some(Ok(value)) => CacheState::Ready(value.clone()),
            _ if self.is_fetching() => CacheState::Fetching,
            Some(Err(err)) => CacheState::Error(err.clone()),
            None => CacheState::Idle,
        }
    }

    fn is_fetching(&self) -> bool {
        self.pending.is_some() || self.queued.is_some()
    }

    fn next_update_id(&mut self) -> u64 {
        self.next_update += 1;
        self.next_update
    }
}

/// One cached value and its in-flight fetch
struct Entry<T> {
    fetch: Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>,
    on_subscribe: Option<Box<dyn Fn(RefreshTrigger) -> Subscription + Send + Sync>>,
    state: Mutex<EntryState<T>>,
    listeners: Mutex<BTreeMap<u64, StateListener<T>>>,
    next_listener_id: AtomicU64,
}

enum Lookup<T> {
    Cached(T),
    Wait(SharedFetch<T>),
}

impl<T> Entry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(
        fetch: Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>,
        on_subscribe: Option<Box<dyn Fn(RefreshTrigger) -> Subscription + Send + Sync>>,
    ) -> Self {
        Self {
            fetch,
            on_subscribe,
            state: Mutex::new(EntryState {
                result: None,
                pending: None,
                queued: None,
                last_applied: 0,
                next_update: 0,
                subscribers: 0,
                hook: None,
            }),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    fn lookup(self: &Arc<Self>, mode: CacheMode) -> Lookup<T> {
        let mut state = self.state.lock();
        if mode == CacheMode::ReadWrite {
            if let Some(Ok(value)) = &state.result {
                return Lookup::Cached(value.clone());
            }
        }
        if let Some(queued) = &state.queued {
            return Lookup::Wait(queued.clone());
        }
        if let Some((_, pending)) = &state.pending {
            return Lookup::Wait(pending.clone());
        }
        Lookup::Wait(self.start_fetch(&mut state))
    }

    /// Start a fetch whose result lands in this entry; caller holds the lock
    fn start_fetch(self: &Arc<Self>, state: &mut EntryState<T>) -> SharedFetch<T> {
        let fetch = (self.fetch)();
        self.track(state, fetch)
    }

    fn track(
        self: &Arc<Self>,
        state: &mut EntryState<T>,
        fetch: BoxFuture<'static, Result<T>>,
    ) -> SharedFetch<T> {
        let id = state.next_update_id();
        let weak = Arc::downgrade(self);
        let shared = async move {
            let result = fetch.await;
            if let Some(entry) = weak.upgrade() {
                entry.land(id, result.clone());
            }
            result
        }
        .boxed()
        .shared();

        state.pending = Some((id, shared.clone()));
        shared
    }

    fn refresh_future(self: &Arc<Self>) -> SharedFetch<T> {
        let mut state = self.state.lock();
        self.schedule_fetch(&mut state)
    }

    /// Start a fetch, or queue one behind the fetch that is running
    ///
    /// At most one follow-up is queued; later callers join it.
    fn schedule_fetch(self: &Arc<Self>, state: &mut EntryState<T>) -> SharedFetch<T> {
        let Some((_, running)) = state.pending.clone() else {
            return self.start_fetch(state);
        };
        if let Some(queued) = &state.queued {
            return queued.clone();
        }

        let weak = Arc::downgrade(self);
        let queued = async move {
            let earlier = running.await;
            let Some(entry) = weak.upgrade() else {
                return earlier;
            };
            let next = {
                let mut state = entry.state.lock();
                state.queued = None;
                match state.pending.as_ref().map(|(_, pending)| pending.clone()) {
                    Some(pending) => pending,
                    None => entry.start_fetch(&mut state),
                }
            };
            next.await
        }
        .boxed()
        .shared();

        state.queued = Some(queued.clone());
        queued
    }

    /// Apply a result unless something newer already landed
    fn land(&self, id: u64, result: Result<T>) {
        let status = {
            let mut state = self.state.lock();
            if matches!(&state.pending, Some((pending, _)) if *pending == id) {
                state.pending = None;
            }
            if id <= state.last_applied {
                debug!(id, "dropping outdated cache result");
                return;
            }
            state.last_applied = id;
            state.result = Some(result);
            state.status()
        };
        self.notify(&status);
    }

    fn force_set(&self, value: T) {
        let id = self.state.lock().next_update_id();
        self.land(id, Ok(value));
    }

    fn invalidate_future(self: &Arc<Self>) -> SharedFetch<T> {
        let mut state = self.state.lock();
        state.result = None;
        // Fetches started before now must not land
        state.last_applied = state.next_update;
        self.schedule_fetch(&mut state)
    }

    fn notify(&self, status: &CacheState<T>) {
        let listeners: Vec<StateListener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(status);
        }
    }

    fn status(&self) -> CacheState<T> {
        self.state.lock().status()
    }

    fn is_unobserved(&self) -> bool {
        let state = self.state.lock();
        state.subscribers == 0 && !state.is_fetching()
    }

    fn subscribe(self: &Arc<Self>, listener: StateListener<T>) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);

        let (first, kick_off) = {
            let mut state = self.state.lock();
            state.subscribers += 1;
            let kick_off = if state.result.is_none() && !state.is_fetching() {
                Some(self.start_fetch(&mut state))
            } else {
                None
            };
            (state.subscribers == 1, kick_off)
        };

        if first {
            if let Some(on_subscribe) = &self.on_subscribe {
                let weak = Arc::downgrade(self);
                let hook = on_subscribe(Arc::new(move || {
                    if let Some(entry) = weak.upgrade() {
                        spawn_detached(entry.refresh_future());
                    }
                }));

                let mut state = self.state.lock();
                if state.subscribers == 0 {
                    drop(state);
                    hook.unsubscribe();
                } else if let Some(previous) = state.hook.replace(hook) {
                    drop(state);
                    previous.unsubscribe();
                }
            }
        }

        if let Some(fetch) = kick_off {
            spawn_detached(fetch);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            let Some(entry) = weak.upgrade() else {
                return;
            };
            entry.listeners.lock().remove(&id);
            let hook = {
                let mut state = entry.state.lock();
                state.subscribers = state.subscribers.saturating_sub(1);
                if state.subscribers == 0 {
                    state.hook.take()
                } else {
                    None
                }
            };
            if let Some(hook) = hook {
                hook.unsubscribe();
            }
        })
    }
}

fn spawn_detached<T>(fetch: SharedFetch<T>)
where
    T: Clone + Send + Sync + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = fetch.await;
            });
        }
        Err(_) => warn!("no tokio runtime available; background cache fetch skipped"),
    }
}

struct CacheInner<D, T> {
    fetcher: Fetcher<D, T>,
    on_subscribe: Option<OnSubscribe<D>>,
    entries: Mutex<HashMap<D, Arc<Entry<T>>>>,
}

/// Cache of asynchronously fetched values keyed by dependencies `D`
///
/// At most one fetch per key runs at a time and concurrent callers share it.
/// A result is applied only if no newer fetch or forced value started after
/// it. Subscribers are notified whenever a result lands.
pub struct AsyncCache<D, T> {
    inner: Arc<CacheInner<D, T>>,
}

impl<D, T> Clone for AsyncCache<D, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D, T> fmt::Debug for AsyncCache<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCache")
            .field("entries", &self.inner.entries.lock().len())
            .finish()
    }
}

impl<D, T> AsyncCache<D, T>
where
    D: Hash + Eq + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(fetcher: F) -> Self
    where
        F: Fn(D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::build(fetcher, None)
    }

    /// Create a cache whose entries run `on_subscribe` when they gain their
    /// first subscriber
    ///
    /// The hook receives a trigger that refreshes the entry in the background
    /// and returns a subscription that is cancelled when the last subscriber
    /// leaves.
    pub fn with_on_subscribe<F, Fut, H>(fetcher: F, on_subscribe: H) -> Self
    where
        F: Fn(D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        H: Fn(&D, RefreshTrigger) -> Subscription + Send + Sync + 'static,
    {
        Self::build(fetcher, Some(Arc::new(on_subscribe)))
    }

    fn build<F, Fut>(fetcher: F, on_subscribe: Option<OnSubscribe<D>>) -> Self
    where
        F: Fn(D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(CacheInner {
                fetcher: Arc::new(move |deps| fetcher(deps).boxed()),
                on_subscribe,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn entry(&self, deps: &D) -> Arc<Entry<T>> {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(deps) {
            return Arc::clone(entry);
        }

        let fetcher = Arc::clone(&self.inner.fetcher);
        let fetch_deps = deps.clone();
        let fetch = Box::new(move || fetcher(fetch_deps.clone()));

        let on_subscribe = self.inner.on_subscribe.clone().map(|hook| {
            let hook_deps = deps.clone();
            Box::new(move |trigger: RefreshTrigger| hook(&hook_deps, trigger))
                as Box<dyn Fn(RefreshTrigger) -> Subscription + Send + Sync>
        });

        let entry = Arc::new(Entry::new(fetch, on_subscribe));
        entries.insert(deps.clone(), Arc::clone(&entry));
        entry
    }

    /// Return the cached value or wait for a fetch, see [`CacheMode`]
    pub async fn get_or_wait(&self, deps: &D, mode: CacheMode) -> Result<T> {
        match self.entry(deps).lookup(mode) {
            Lookup::Cached(value) => Ok(value),
            Lookup::Wait(fetch) => fetch.await,
        }
    }

    /// Fetch again and wait for the result
    ///
    /// If a fetch is already running, one more fetch is queued behind it
    /// rather than started alongside it.
    pub async fn refresh(&self, deps: &D) -> Result<T> {
        self.entry(deps).refresh_future().await
    }

    /// Forget the cached value and fetch it again
    pub async fn invalidate(&self, deps: &D) -> Result<T> {
        self.entry(deps).invalidate_future().await
    }

    pub fn on_state_change(
        &self,
        deps: &D,
        callback: impl Fn(&CacheState<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.entry(deps).subscribe(Arc::new(callback))
    }

    pub fn force_set_cached_value(&self, deps: &D, value: T) {
        self.entry(deps).force_set(value);
    }

    /// Make `value` the pending fetch of the entry and wait for it
    ///
    /// Callers of [`get_or_wait`](Self::get_or_wait) join it like any fetch.
    pub async fn force_set_cached_value_async(
        &self,
        deps: &D,
        value: impl Future<Output = Result<T>> + Send + 'static,
    ) -> Result<()> {
        let entry = self.entry(deps);
        let fetch = {
            let mut state = entry.state.lock();
            entry.track(&mut state, value.boxed())
        };
        fetch.await.map(|_| ())
    }

    pub fn get_if_cached(&self, deps: &D) -> Option<T> {
        self.state(deps).value().cloned()
    }

    pub fn state(&self, deps: &D) -> CacheState<T> {
        match self.inner.entries.lock().get(deps) {
            Some(entry) => entry.status(),
            None => CacheState::Idle,
        }
    }

    pub fn is_cache_available(&self, deps: &D) -> bool {
        self.state(deps).is_ready()
    }

    /// Refresh every entry whose dependencies match
    ///
    /// All refreshes run concurrently; the first failure is returned.
    pub async fn refresh_where(&self, predicate: impl Fn(&D) -> bool) -> Result<()> {
        let fetches: Vec<SharedFetch<T>> = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .filter(|(deps, _)| predicate(deps))
                .map(|(_, entry)| Arc::clone(entry))
                .collect::<Vec<_>>()
        }
        .into_iter()
        .map(|entry| entry.refresh_future())
        .collect();

        join_all(fetches)
            .await
            .into_iter()
            .find_map(|result| result.err())
            .map_or(Ok(()), Err)
    }

    /// Drop matching entries that have no subscribers and no fetch in flight
    pub fn evict_where(&self, predicate: impl Fn(&D) -> bool) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|deps, entry| !(predicate(deps) && entry.is_unobserved()));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::MockAuthServer;
    use crate::session::Session;
    use crate::token_store::TokenPair;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn counting_cache(calls: Arc<AtomicUsize>) -> AsyncCache<String, String> {
        AsyncCache::new(move |key: String| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(format!("{}#{}", key, n))
            }
        })
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone());
        let key = "user".to_string();

        let results = join_all((0..10).map(|_| cache.get_or_wait(&key, CacheMode::ReadWrite))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), "user#1");
        }

        // Cached now
        assert_eq!(cache.get_or_wait(&key, CacheMode::ReadWrite).await.unwrap(), "user#1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_cache_available(&key));
    }

    #[tokio::test]
    async fn test_write_only_revalidates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone());
        let key = "k".to_string();

        cache.get_or_wait(&key, CacheMode::ReadWrite).await.unwrap();
        let value = cache.get_or_wait(&key, CacheMode::WriteOnly).await.unwrap();

        assert_eq!(value, "k#2");
        assert_eq!(cache.get_if_cached(&key), Some("k#2".to_string()));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache: AsyncCache<u8, u8> = AsyncCache::new(move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(AuthError::Network("offline".into()))
                } else {
                    Ok(7)
                }
            }
        });

        assert!(cache.get_or_wait(&1, CacheMode::ReadWrite).await.is_err());
        assert!(matches!(cache.state(&1), CacheState::Error(_)));
        assert_eq!(cache.get_or_wait(&1, CacheMode::ReadWrite).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_during_fetch_queues_one_follow_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let cache: AsyncCache<u8, usize> = {
            let (calls, in_flight, max_in_flight) =
                (calls.clone(), in_flight.clone(), max_in_flight.clone());
            AsyncCache::new(move |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
        };

        let (first, second, third, read) = tokio::join!(
            cache.refresh(&0),
            cache.refresh(&0),
            cache.refresh(&0),
            cache.get_or_wait(&0, CacheMode::ReadWrite)
        );

        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 2);
        assert_eq!(third.unwrap(), 2);
        assert_eq!(read.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_if_cached(&0), Some(2));
    }

    #[tokio::test]
    async fn test_forced_value_beats_older_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone());
        let key = "k".to_string();

        let (fetched, ()) = tokio::join!(cache.get_or_wait(&key, CacheMode::ReadWrite), async {
            cache.force_set_cached_value(&key, "forced".to_string());
        });

        // The waiter gets its own fetch, the entry keeps the newer value
        assert_eq!(fetched.unwrap(), "k#1");
        assert_eq!(cache.get_if_cached(&key), Some("forced".to_string()));
    }

    #[tokio::test]
    async fn test_invalidate_discards_results_of_earlier_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        // The first fetch is slow, later ones fast
        let cache: AsyncCache<u8, usize> = AsyncCache::new(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                let delay = if n == 1 { 50 } else { 5 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(n)
            }
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            cache.on_state_change(&0, move |state| seen.lock().push(state.value().copied()))
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.invalidate(&0).await.unwrap(), 2);
        assert_eq!(*seen.lock(), vec![Some(2)]);
        assert_eq!(cache.get_if_cached(&0), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_force_set_and_async_force_set() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone());
        let key = "k".to_string();

        cache.force_set_cached_value(&key, "forced".to_string());
        assert_eq!(cache.get_or_wait(&key, CacheMode::ReadWrite).await.unwrap(), "forced");

        cache
            .force_set_cached_value_async(&key, async { Ok("later".to_string()) })
            .await
            .unwrap();
        assert_eq!(cache.get_if_cached(&key), Some("later".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribing_to_idle_entry_fetches_and_notifies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = cache.on_state_change(&"k".to_string(), move |state| {
            let _ = tx.send(state.value().cloned());
        });

        assert_eq!(rx.recv().await.unwrap(), Some("k#1".to_string()));
        sub.unsubscribe();

        assert_eq!(cache.evict_where(|key| key == "k"), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_session_invalidation_refreshes_entry_once() {
        let server = Arc::new(MockAuthServer::new());
        let session = Session::new(
            server,
            &TokenPair::new(Some("a1".to_string()), Some("r1".to_string())),
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache: AsyncCache<Session, Option<String>> = AsyncCache::with_on_subscribe(
            move |session: Session| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if session.is_known_to_be_invalid() {
                        Ok(None)
                    } else {
                        Ok(Some("u1".to_string()))
                    }
                }
            },
            |session: &Session, refresh| session.on_invalidate(move || refresh()),
        );

        cache.force_set_cached_value(&session, Some("u1".to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = cache.on_state_change(&session, move |state| {
            let _ = tx.send(state.value().cloned());
        });

        session.invalidate();

        assert_eq!(rx.recv().await.unwrap(), Some(None));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_if_cached(&session), Some(None));
    }

    #[tokio::test]
    async fn test_refresh_where_and_eviction_skips_observed_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone());
        let a = "a".to_string();
        let b = "b".to_string();

        cache.get_or_wait(&a, CacheMode::ReadWrite).await.unwrap();
        cache.get_or_wait(&b, CacheMode::ReadWrite).await.unwrap();
        cache.refresh_where(|key| key == "a").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.get_if_cached(&a), Some("a#3".to_string()));
        assert_eq!(cache.get_if_cached(&b), Some("b#2".to_string()));

        let _sub = cache.on_state_change(&a, |_| {});
        assert_eq!(cache.evict_where(|_| true), 1);
        assert_eq!(cache.len(), 1);
    }
}
