//! Query client
//!
//! The main handle for managing query state. Composes the cache with the
//! focus and online sources, broadcasts invalidation/cancellation events to
//! observers, tracks how many observers are fetching, hands out
//! per-scope mutation locks, and hosts per-type default query functions.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::{CacheEntry, QueryCache};
use crate::cancel::CancelToken;
use crate::key::QueryKey;
use crate::retry::{QueryError, RetryPolicy};
use crate::sources::{FocusSource, OnlineSource};
use crate::types::{
    CancelOptions, FetchStatus, NetworkMode, QueryFilters, QueryKind, QueryMeta, QueryObserverId,
};

/// Context handed to every query function invocation.
#[derive(Clone)]
pub struct QueryContext {
    pub key: QueryKey,
    pub signal: CancelToken,
    pub meta: QueryMeta,
    pub client: QueryClient,
}

/// A consumer-supplied fetcher.
pub type QueryFn<T> =
    Arc<dyn Fn(QueryContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Client-wide defaults.
#[derive(Clone, Debug)]
pub struct QueryClientConfig {
    pub default_stale_time: Duration,
    pub default_network_mode: NetworkMode,
    pub default_retry: RetryPolicy,
    /// Broadcast buffer for client events
    pub event_capacity: usize,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::ZERO,
            default_network_mode: NetworkMode::Online,
            default_retry: RetryPolicy::default(),
            event_capacity: 64,
        }
    }
}

/// Events fanned out to observers.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// The listed entries were marked stale; active observers refetch
    QueriesInvalidated(Vec<QueryKey>),
    /// Observers on the listed keys cancel their in-flight fetches
    QueriesCancelled {
        keys: Vec<QueryKey>,
        options: CancelOptions,
    },
    /// The global count of fetching observers crossed 0 in either direction
    FetchingChanged(usize),
}

/// Fetch-status slot shared between an observer and the client registry, so
/// filters can read each attached observer's status without locking it.
#[derive(Clone, Debug, Default)]
pub(crate) struct FetchStatusCell(Arc<AtomicUsize>);

impl FetchStatusCell {
    pub(crate) fn get(&self) -> FetchStatus {
        match self.0.load(Ordering::Acquire) {
            1 => FetchStatus::Fetching,
            2 => FetchStatus::Paused,
            _ => FetchStatus::Idle,
        }
    }

    pub(crate) fn set(&self, status: FetchStatus) {
        let raw = match status {
            FetchStatus::Idle => 0,
            FetchStatus::Fetching => 1,
            FetchStatus::Paused => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

pub(crate) struct RegisteredObserver {
    pub(crate) id: QueryObserverId,
    pub(crate) fetch_status: FetchStatusCell,
    pub(crate) stale_time: Duration,
}

/// Cache snapshot counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub stale_entries: usize,
    pub in_flight: usize,
}

struct ClientInner {
    cache: QueryCache,
    config: QueryClientConfig,
    online: OnlineSource,
    focus: FocusSource,
    events: broadcast::Sender<ClientEvent>,
    fetching: AtomicUsize,
    scopes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    default_query_fns: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    observers: RwLock<HashMap<QueryKey, Vec<RegisteredObserver>>>,
}

/// The main query client. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(config: QueryClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ClientInner {
                cache: QueryCache::new(),
                config,
                online: OnlineSource::default(),
                focus: FocusSource::default(),
                events,
                fetching: AtomicUsize::new(0),
                scopes: Mutex::new(HashMap::new()),
                default_query_fns: RwLock::new(HashMap::new()),
                observers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &QueryClientConfig {
        &self.inner.config
    }

    pub fn online_source(&self) -> &OnlineSource {
        &self.inner.online
    }

    pub fn focus_source(&self) -> &FocusSource {
        &self.inner.focus
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.is_online()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    // --- cache access -----------------------------------------------------

    /// Typed data snapshot for a key.
    pub fn get_query_data<T: DeserializeOwned + 'static>(&self, key: &QueryKey) -> Option<T> {
        self.inner.cache.get(key)
    }

    /// Write data for a key: clears the error, stamps the entry fresh.
    pub fn set_query_data<T: Serialize + 'static>(
        &self,
        key: &QueryKey,
        value: &T,
    ) -> Result<(), QueryError> {
        self.inner.cache.set(key, value)
    }

    /// Raw state snapshot for a key.
    pub fn get_query_state(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner.cache.entry(key)
    }

    /// Drop every cache entry.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        let keys = self.inner.cache.keys();
        let mut stale_entries = 0;
        let mut in_flight = 0;
        for key in &keys {
            if let Some(entry) = self.inner.cache.entry(key) {
                if entry.is_stale(self.observed_stale_time(key)) {
                    stale_entries += 1;
                }
                if entry.is_fetching() {
                    in_flight += 1;
                }
            }
        }
        CacheStats {
            total_entries: keys.len(),
            stale_entries,
            in_flight,
        }
    }

    // --- filter operations ------------------------------------------------

    /// Keys of cached entries the filters select.
    pub fn matching_keys(&self, filters: &QueryFilters) -> Vec<QueryKey> {
        let observers = self.inner.observers.read();
        self.inner
            .cache
            .keys()
            .into_iter()
            .filter(|key| {
                if !filters.matches_key(key) {
                    return false;
                }
                let attached = observers.get(key).map(Vec::as_slice).unwrap_or(&[]);
                match filters.kind {
                    QueryKind::All => {}
                    QueryKind::Active if attached.is_empty() => return false,
                    QueryKind::Inactive if !attached.is_empty() => return false,
                    _ => {}
                }
                let entry = match self.inner.cache.entry(key) {
                    Some(entry) => entry,
                    None => return false,
                };
                if let Some(wanted_stale) = filters.stale {
                    let stale_time = attached
                        .iter()
                        .map(|o| o.stale_time)
                        .min()
                        .unwrap_or(self.inner.config.default_stale_time);
                    if entry.is_stale(stale_time) != wanted_stale {
                        return false;
                    }
                }
                if let Some(wanted_status) = filters.fetch_status {
                    let matches_status = if attached.is_empty() {
                        let derived = if entry.is_fetching() {
                            FetchStatus::Fetching
                        } else {
                            FetchStatus::Idle
                        };
                        derived == wanted_status
                    } else {
                        attached.iter().any(|o| o.fetch_status.get() == wanted_status)
                    };
                    if !matches_status {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    /// Mark matching entries stale and notify observers; active ones refetch.
    pub fn invalidate_queries(&self, filters: &QueryFilters) {
        let keys = self.matching_keys(filters);
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.inner.cache.mark_invalidated(key);
        }
        debug!(count = keys.len(), "queries invalidated");
        let _ = self.inner.events.send(ClientEvent::QueriesInvalidated(keys));
    }

    /// Ask observers on matching keys to cancel their in-flight fetches.
    pub fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) {
        let keys = self.matching_keys(filters);
        if keys.is_empty() {
            return;
        }
        debug!(count = keys.len(), "queries cancelled");
        let _ = self
            .inner
            .events
            .send(ClientEvent::QueriesCancelled { keys, options });
    }

    /// Force matching queries to refetch.
    pub fn refetch_queries(&self, filters: &QueryFilters) {
        self.invalidate_queries(filters);
    }

    /// Cancel matching queries silently and drop their entries.
    pub fn reset_queries(&self, filters: &QueryFilters) {
        self.cancel_queries(
            filters,
            CancelOptions {
                silent: true,
                revert: false,
            },
        );
        for key in self.matching_keys(filters) {
            self.inner.cache.remove(&key);
        }
    }

    /// Drop matching entries from the cache.
    pub fn remove_queries(&self, filters: &QueryFilters) {
        for key in self.matching_keys(filters) {
            self.inner.cache.remove(&key);
        }
    }

    // --- prefetch ---------------------------------------------------------

    /// Run a coalesced fetch without attaching an observer.
    pub async fn prefetch<T>(&self, options: PrefetchOptions<T>) -> Result<T, QueryError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let query_fn = options
            .query_fn
            .or_else(|| self.default_query_fn::<T>())
            .ok_or_else(|| {
                QueryError::configuration(
                    "prefetch requires a query_fn or a registered type default",
                )
            })?;
        let stale_time = options
            .stale_time
            .unwrap_or(self.inner.config.default_stale_time);
        let context = QueryContext {
            key: options.query_key.clone(),
            signal: CancelToken::never(),
            meta: options.meta,
            client: self.clone(),
        };
        self.inner
            .cache
            .fetch_coalesced(
                &options.query_key,
                move |signal| {
                    let context = QueryContext { signal, ..context };
                    query_fn(context)
                },
                stale_time,
                CancelToken::never(),
            )
            .await
    }

    // --- type-default fetchers --------------------------------------------

    /// Register the fetcher consulted when observer options omit `query_fn`
    /// for data of type `T`.
    pub fn set_default_query_fn<T, F>(&self, query_fn: F)
    where
        T: 'static,
        F: Fn(QueryContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        let stored: QueryFn<T> = Arc::new(query_fn);
        self.inner
            .default_query_fns
            .write()
            .insert(TypeId::of::<T>(), Arc::new(stored));
    }

    pub fn default_query_fn<T: 'static>(&self) -> Option<QueryFn<T>> {
        self.inner
            .default_query_fns
            .read()
            .get(&TypeId::of::<T>())
            .and_then(|any| any.clone().downcast::<QueryFn<T>>().ok())
            .map(|arc| (*arc).clone())
    }

    // --- mutation scopes --------------------------------------------------

    /// Size-1 lock serializing every mutation that shares `scope_id`.
    pub fn scope_lock(&self, scope_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .scopes
            .lock()
            .entry(scope_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // --- fetching counter -------------------------------------------------

    pub(crate) fn fetch_started(&self) {
        let previous = self.inner.fetching.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            let _ = self.inner.events.send(ClientEvent::FetchingChanged(1));
        }
    }

    pub(crate) fn fetch_finished(&self) {
        let previous = self.inner.fetching.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            let _ = self.inner.events.send(ClientEvent::FetchingChanged(0));
        }
    }

    /// Number of observers currently fetching.
    pub fn active_fetches(&self) -> usize {
        self.inner.fetching.load(Ordering::Acquire)
    }

    // --- observer registry ------------------------------------------------

    pub(crate) fn register_observer(&self, key: &QueryKey, observer: RegisteredObserver) {
        self.inner
            .observers
            .write()
            .entry(key.clone())
            .or_default()
            .push(observer);
    }

    pub(crate) fn unregister_observer(&self, key: &QueryKey, id: QueryObserverId) {
        let mut observers = self.inner.observers.write();
        if let Some(list) = observers.get_mut(key) {
            list.retain(|o| o.id != id);
            if list.is_empty() {
                observers.remove(key);
            }
        }
    }

    pub fn has_observers(&self, key: &QueryKey) -> bool {
        self.inner
            .observers
            .read()
            .get(key)
            .is_some_and(|list| !list.is_empty())
    }

    fn observed_stale_time(&self, key: &QueryKey) -> Duration {
        self.inner
            .observers
            .read()
            .get(key)
            .and_then(|list| list.iter().map(|o| o.stale_time).min())
            .unwrap_or(self.inner.config.default_stale_time)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(QueryClientConfig::default())
    }
}

/// Options for [`QueryClient::prefetch`].
#[derive(Clone)]
pub struct PrefetchOptions<T> {
    pub query_key: QueryKey,
    pub query_fn: Option<QueryFn<T>>,
    pub stale_time: Option<Duration>,
    pub meta: QueryMeta,
}

impl<T> PrefetchOptions<T> {
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: query_key.into(),
            query_fn: None,
            stale_time: None,
            meta: QueryMeta::default(),
        }
    }

    pub fn with_query_fn<F>(mut self, query_fn: F) -> Self
    where
        F: Fn(QueryContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        self.query_fn = Some(Arc::new(query_fn));
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }
}
