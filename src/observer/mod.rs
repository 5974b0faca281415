//! Query observer
//!
//! A [`QueryObserver`] is one live observation of a cached query. It drives
//! the fetch for its key through the client's coalescing cache, retries with
//! backoff, pauses while offline and resumes without restarting the attempt
//! sequence, refreshes on staleness, interval ticks, window focus and
//! reconnect, and publishes every observable state change on a watch channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cache::SerializedData;
use crate::cancel::{CancelSource, CancelToken};
use crate::client::{
    ClientEvent, FetchStatusCell, QueryClient, QueryContext, QueryFn, RegisteredObserver,
};
use crate::key::QueryKey;
use crate::retry::{QueryError, RetryPolicy};
use crate::types::{
    CancelOptions, FetchStatus, NetworkMode, QueryMeta, QueryObserverId, QueryStatus,
};

/// Configuration for one observed query.
#[derive(Clone)]
pub struct QueryOptions<T> {
    pub query_key: QueryKey,
    pub query_fn: Option<QueryFn<T>>,
    pub stale_time: Duration,
    /// `None` falls back to the client default
    pub network_mode: Option<NetworkMode>,
    pub refetch_on_reconnect: bool,
    pub refetch_on_window_focus: bool,
    pub refetch_interval: Option<Duration>,
    pub retry: RetryPolicy,
    pub enabled: bool,
    pub meta: QueryMeta,
    pub initial_data: Option<T>,
    pub initial_data_fn: Option<Arc<dyn Fn() -> Option<T> + Send + Sync>>,
    pub initial_data_updated_at: Option<Instant>,
    pub placeholder_data: Option<T>,
    pub placeholder_data_fn: Option<Arc<dyn Fn(Option<&T>) -> Option<T> + Send + Sync>>,
}

impl<T> QueryOptions<T> {
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: query_key.into(),
            query_fn: None,
            stale_time: Duration::ZERO,
            network_mode: None,
            refetch_on_reconnect: true,
            refetch_on_window_focus: true,
            refetch_interval: None,
            retry: RetryPolicy::default(),
            enabled: true,
            meta: QueryMeta::default(),
            initial_data: None,
            initial_data_fn: None,
            initial_data_updated_at: None,
            placeholder_data: None,
            placeholder_data_fn: None,
        }
    }

    pub fn with_query_fn<F>(mut self, query_fn: F) -> Self
    where
        F: Fn(QueryContext) -> futures::future::BoxFuture<'static, Result<T, QueryError>>
            + Send
            + Sync
            + 'static,
    {
        self.query_fn = Some(Arc::new(query_fn));
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    pub fn with_refetch_on_reconnect(mut self, refetch: bool) -> Self {
        self.refetch_on_reconnect = refetch;
        self
    }

    pub fn with_refetch_on_window_focus(mut self, refetch: bool) -> Self {
        self.refetch_on_window_focus = refetch;
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_meta(mut self, meta: QueryMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn with_initial_data_updated_at(mut self, updated_at: Instant) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    pub fn with_placeholder_data(mut self, data: T) -> Self {
        self.placeholder_data = Some(data);
        self
    }
}

/// Observable state of one query, published on every change.
#[derive(Clone, PartialEq)]
pub struct QuerySnapshot<T> {
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub failure_count: u32,
    /// Last failure observed during retries; survives a later success
    pub failure_reason: Option<QueryError>,
    pub fetch_status: FetchStatus,
    pub is_placeholder: bool,
    pub is_fetching_background: bool,
    pub is_refetch_error: bool,
}

impl<T> QuerySnapshot<T> {
    fn empty() -> Self {
        Self {
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            fetch_status: FetchStatus::Idle,
            is_placeholder: false,
            is_fetching_background: false,
            is_refetch_error: false,
        }
    }

    /// Error wins over Success, Success over Pending.
    pub fn status(&self) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Error
        } else if self.data.is_some() {
            QueryStatus::Success
        } else {
            QueryStatus::Pending
        }
    }

    /// Pending with an active or suspended fetch.
    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Pending
            && matches!(self.fetch_status, FetchStatus::Fetching | FetchStatus::Paused)
    }
}

enum LoopExit {
    Settled,
    Paused,
}

struct ObserverInner<T> {
    client: QueryClient,
    id: QueryObserverId,
    key: QueryKey,
    query_fn: QueryFn<T>,
    stale_time: Duration,
    network_mode: NetworkMode,
    refetch_on_reconnect: bool,
    refetch_on_window_focus: bool,
    retry: RetryPolicy,
    meta: QueryMeta,
    enabled: AtomicBool,
    refetch_interval: Mutex<Option<Duration>>,
    snapshot: watch::Sender<QuerySnapshot<T>>,
    fetch_lock: tokio::sync::Mutex<()>,
    current_fetch: Mutex<Option<CancelSource>>,
    /// Pre-fetch data snapshot held while a fetch is in flight, for revert
    revert_data: Mutex<Option<Option<SerializedData>>>,
    stale_timer: Mutex<Option<JoinHandle<()>>>,
    interval_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    pause: Semaphore,
    pause_waiters: AtomicUsize,
    fetch_status_cell: FetchStatusCell,
    disposed: AtomicBool,
}

/// One live observation of a query key.
pub struct QueryObserver<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    inner: Arc<ObserverInner<T>>,
}

impl<T> QueryObserver<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build the observer, compute its initial state, and subscribe it to the
    /// client's focus, online and invalidation/cancellation events.
    ///
    /// Fails with [`QueryError::Configuration`] when neither `query_fn` nor a
    /// registered type default is available.
    pub fn new(client: QueryClient, options: QueryOptions<T>) -> Result<Self, QueryError> {
        let query_fn = options
            .query_fn
            .clone()
            .or_else(|| client.default_query_fn::<T>())
            .ok_or_else(|| {
                QueryError::configuration(
                    "query observer requires a query_fn or a registered type default",
                )
            })?;

        let network_mode = options
            .network_mode
            .unwrap_or(client.config().default_network_mode);
        // Always-mode queries never wait for the network, so reconnect
        // refreshes are meaningless for them.
        let refetch_on_reconnect =
            options.refetch_on_reconnect && network_mode != NetworkMode::Always;

        let key = options.query_key.clone();
        let mut snapshot = QuerySnapshot::empty();

        let initial_data = options
            .initial_data
            .clone()
            .or_else(|| options.initial_data_fn.as_ref().and_then(|f| f()));

        if let Some(value) = initial_data {
            let entry = client.cache().entry(&key);
            let has_fresh_entry = entry
                .as_ref()
                .map(|e| e.data.is_some() && !e.is_stale(options.stale_time))
                .unwrap_or(false);
            if has_fresh_entry {
                snapshot.data = entry.and_then(|e| e.data_as::<T>());
            } else {
                let updated_at = options.initial_data_updated_at.unwrap_or_else(Instant::now);
                client
                    .cache()
                    .set_with_updated_at(&key, &value, updated_at)?;
                snapshot.data = Some(value);
            }
        } else {
            if let Some(entry) = client.cache().entry(&key) {
                snapshot.data = entry.data_as::<T>();
            }
            if snapshot.data.is_none() {
                let placeholder = options.placeholder_data.clone().or_else(|| {
                    options
                        .placeholder_data_fn
                        .as_ref()
                        .and_then(|f| f(None))
                });
                if let Some(value) = placeholder {
                    snapshot.data = Some(value);
                    snapshot.is_placeholder = true;
                }
            }
        }

        let (snapshot_tx, _) = watch::channel(snapshot);
        let fetch_status_cell = FetchStatusCell::default();
        let id = QueryObserverId::new();

        let inner = Arc::new(ObserverInner {
            client: client.clone(),
            id,
            key: key.clone(),
            query_fn,
            stale_time: options.stale_time,
            network_mode,
            refetch_on_reconnect,
            refetch_on_window_focus: options.refetch_on_window_focus,
            retry: options.retry,
            meta: options.meta,
            enabled: AtomicBool::new(options.enabled),
            refetch_interval: Mutex::new(options.refetch_interval),
            snapshot: snapshot_tx,
            fetch_lock: tokio::sync::Mutex::new(()),
            current_fetch: Mutex::new(None),
            revert_data: Mutex::new(None),
            stale_timer: Mutex::new(None),
            interval_task: Mutex::new(None),
            event_task: Mutex::new(None),
            pause: Semaphore::new(0),
            pause_waiters: AtomicUsize::new(0),
            fetch_status_cell: fetch_status_cell.clone(),
            disposed: AtomicBool::new(false),
        });

        client.register_observer(
            &key,
            RegisteredObserver {
                id,
                fetch_status: fetch_status_cell,
                stale_time: options.stale_time,
            },
        );

        ObserverInner::spawn_event_loop(&inner);
        if options.enabled {
            ObserverInner::start_interval(&inner);
        }

        debug!(key = %inner.key, observer = %id, "observer created");
        Ok(Self { inner })
    }

    pub fn id(&self) -> QueryObserverId {
        self.inner.id
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// Current full state.
    pub fn snapshot(&self) -> QuerySnapshot<T> {
        self.inner.snapshot.borrow().clone()
    }

    /// Change notifications; the receiver sees every observable transition.
    pub fn subscribe(&self) -> watch::Receiver<QuerySnapshot<T>> {
        self.inner.snapshot.subscribe()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.snapshot.borrow().data.clone()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.inner.snapshot.borrow().error.clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.inner.snapshot.borrow().status()
    }

    pub fn fetch_status(&self) -> FetchStatus {
        self.inner.snapshot.borrow().fetch_status
    }

    pub fn is_loading(&self) -> bool {
        self.inner.snapshot.borrow().is_loading()
    }

    pub fn is_fetching_background(&self) -> bool {
        self.inner.snapshot.borrow().is_fetching_background
    }

    pub fn is_placeholder(&self) -> bool {
        self.inner.snapshot.borrow().is_placeholder
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.snapshot.borrow().failure_count
    }

    pub fn failure_reason(&self) -> Option<QueryError> {
        self.inner.snapshot.borrow().failure_reason.clone()
    }

    pub fn is_refetch_error(&self) -> bool {
        self.inner.snapshot.borrow().is_refetch_error
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    /// Fetch if the entry is stale. No-op while disabled; never returns an
    /// error — failures land in the snapshot.
    pub async fn execute(&self, signal: Option<CancelToken>) {
        ObserverInner::execute(&self.inner, signal, false, false).await;
    }

    /// Invalidate the entry, then fetch. Bypasses `enabled`.
    pub async fn refetch(&self, signal: Option<CancelToken>) {
        self.inner.client.cache().mark_invalidated(&self.inner.key);
        ObserverInner::execute(&self.inner, signal, true, true).await;
    }

    /// React to connectivity loss: cancels the in-flight fetch so it can
    /// transition to `Paused`. Called automatically on online-source edges.
    pub fn handle_offline(&self) {
        self.inner.handle_offline();
    }

    /// Runtime toggle. Disabling stops the interval poll; enabling restarts
    /// it when configured.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.inner.enabled.swap(enabled, Ordering::AcqRel);
        if was == enabled {
            return;
        }
        if enabled {
            ObserverInner::start_interval(&self.inner);
        } else {
            self.inner.stop_interval();
        }
    }

    /// Runtime interval change; `None` stops polling.
    pub fn set_refetch_interval(&self, interval: Option<Duration>) {
        *self.inner.refetch_interval.lock() = interval;
        self.inner.stop_interval();
        if interval.is_some() && self.inner.is_enabled() {
            ObserverInner::start_interval(&self.inner);
        }
    }

    /// Tear down: unsubscribe from events, cancel the in-flight fetch and
    /// timers, release paused waiters, detach from the client. Idempotent;
    /// every operation after this is a no-op.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<T> Drop for QueryObserver<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<T> ObserverInner<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Apply a state change, notifying subscribers only when an observable
    /// field actually differs.
    fn update(&self, apply: impl FnOnce(&mut QuerySnapshot<T>)) {
        self.snapshot.send_if_modified(|snap| {
            let before = snap.clone();
            apply(snap);
            *snap != before
        });
    }

    fn set_fetch_status(&self, status: FetchStatus) {
        self.fetch_status_cell.set(status);
        self.update(|s| s.fetch_status = status);
    }

    fn entry_is_stale(&self) -> bool {
        match self.client.cache().entry(&self.key) {
            None => true,
            Some(entry) => entry.data.is_none() || entry.is_stale(self.stale_time),
        }
    }

    /// Install a fresh cancellation source for the next attempt, linking in
    /// the consumer-supplied signal when present.
    fn fresh_token(&self, consumer: &Option<CancelToken>) -> CancelToken {
        let source = CancelSource::new();
        let mut token = source.token();
        if let Some(signal) = consumer {
            token = token.link(signal.clone());
        }
        *self.current_fetch.lock() = Some(source);
        token
    }

    async fn execute(
        this: &Arc<Self>,
        signal: Option<CancelToken>,
        is_refetch: bool,
        bypass_enabled: bool,
    ) {
        if this.is_disposed() || (!bypass_enabled && !this.is_enabled()) {
            return;
        }

        // Cancel any in-flight fetch before queueing on the lock, so the
        // previous execute can wind down and release it. A paused execute is
        // left alone; it resumes on reconnect and releases the lock then.
        if this.fetch_status_cell.get() == FetchStatus::Fetching {
            if let Some(previous) = this.current_fetch.lock().take() {
                previous.cancel();
            }
        }

        let _guard = this.fetch_lock.lock().await;
        if this.is_disposed() {
            return;
        }

        this.cancel_stale_timer();

        if let Some(previous) = this.current_fetch.lock().take() {
            previous.cancel();
        }
        let mut token = this.fresh_token(&signal);

        let entry = this.client.cache().entry(&this.key);
        *this.revert_data.lock() = Some(entry.as_ref().and_then(|e| e.data.clone()));

        // Mirror cached data optimistically.
        if let Some(value) = entry.as_ref().and_then(|e| e.data_as::<T>()) {
            this.update(|s| {
                s.data = Some(value);
                s.is_placeholder = false;
            });
        }

        let is_stale = match &entry {
            None => true,
            Some(e) => e.data.is_none() || e.is_stale(this.stale_time),
        };

        let online = this.client.is_online();
        if this.network_mode != NetworkMode::Always && !online {
            // OfflineFirst still makes its very first try.
            let attempt_anyway = this.network_mode == NetworkMode::OfflineFirst && entry.is_none();
            if !attempt_anyway {
                this.set_fetch_status(FetchStatus::Paused);
                this.clear_fetch_state();
                return;
            }
        }

        if !is_stale {
            this.clear_fetch_state();
            return;
        }

        let has_data = entry.as_ref().map(|e| e.data.is_some()).unwrap_or(false);
        if has_data {
            this.update(|s| s.is_fetching_background = true);
        }

        this.set_fetch_status(FetchStatus::Fetching);
        let mut failure_count = if is_refetch {
            this.snapshot.borrow().failure_count
        } else {
            this.update(|s| {
                s.failure_count = 0;
                s.failure_reason = None;
                s.is_refetch_error = false;
            });
            0
        };

        this.client.fetch_started();
        trace!(key = %this.key, is_refetch, "fetch loop started");

        let exit = loop {
            let attempt = this.run_attempt(&token).await;
            match attempt {
                Ok(value) => {
                    this.update(|s| {
                        s.data = Some(value);
                        s.error = None;
                        s.is_placeholder = false;
                    });
                    if !is_refetch {
                        Self::start_stale_timer(this);
                    }
                    break LoopExit::Settled;
                }
                Err(err) if err.is_cancelled() => {
                    if this.network_mode != NetworkMode::Always && !this.client.is_online() {
                        debug!(key = %this.key, "fetch paused while offline");
                        this.set_fetch_status(FetchStatus::Paused);
                        break LoopExit::Paused;
                    }
                    // Online cancellation ends the fetch quietly; any error
                    // surfacing is decided by the cancellation event handler.
                    break LoopExit::Settled;
                }
                Err(err) => {
                    failure_count += 1;
                    let attempt_index = failure_count - 1;
                    this.update(|s| {
                        s.failure_count = failure_count;
                        s.failure_reason = Some(err.clone());
                    });

                    if !this.retry.should_retry(attempt_index, &err) {
                        debug!(key = %this.key, failures = failure_count, error = %err, "fetch failed terminally");
                        this.update(|s| {
                            s.error = Some(err);
                            s.is_refetch_error = is_refetch;
                        });
                        break LoopExit::Settled;
                    }

                    if this.network_mode != NetworkMode::Always && !this.client.is_online() {
                        if !this.wait_for_resume(&signal).await {
                            break LoopExit::Paused;
                        }
                        token = this.fresh_token(&signal);
                        continue;
                    }

                    let delay = this.retry.delay_for(attempt_index);
                    trace!(key = %this.key, ?delay, attempt_index, "retry scheduled");
                    let interrupted = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = token.cancelled() => true,
                    };
                    if interrupted {
                        if this.network_mode != NetworkMode::Always && !this.client.is_online() {
                            // The offline edge cancelled the token mid-delay;
                            // park and continue the same attempt on resume.
                            if !this.wait_for_resume(&signal).await {
                                break LoopExit::Paused;
                            }
                            token = this.fresh_token(&signal);
                            continue;
                        }
                        break LoopExit::Settled;
                    }
                }
            }
        };

        this.update(|s| s.is_fetching_background = false);
        if !matches!(exit, LoopExit::Paused) {
            this.set_fetch_status(FetchStatus::Idle);
        }
        this.clear_fetch_state();
        this.client.fetch_finished();
    }

    async fn run_attempt(&self, token: &CancelToken) -> Result<T, QueryError> {
        let context = QueryContext {
            key: self.key.clone(),
            signal: token.clone(),
            meta: self.meta.clone(),
            client: self.client.clone(),
        };
        let query_fn = self.query_fn.clone();
        self.client
            .cache()
            .fetch_coalesced::<T, _>(
                &self.key,
                move |signal| query_fn(QueryContext { signal, ..context }),
                self.stale_time,
                token.clone(),
            )
            .await
    }

    /// Park on the pause semaphore until the online edge releases it.
    /// Returns false when the observer should stay paused (consumer
    /// cancellation, disposal, or the network dropped again before resuming).
    async fn wait_for_resume(&self, consumer: &Option<CancelToken>) -> bool {
        self.set_fetch_status(FetchStatus::Paused);
        debug!(key = %self.key, "retry paused; waiting for reconnect");

        self.pause_waiters.fetch_add(1, Ordering::AcqRel);
        let resumed = tokio::select! {
            permit = self.pause.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
                true
            }
            _ = async {
                match consumer {
                    Some(token) => token.cancelled().await,
                    None => futures::future::pending().await,
                }
            } => false,
        };
        self.pause_waiters.fetch_sub(1, Ordering::AcqRel);

        if !resumed || self.is_disposed() || !self.client.is_online() {
            return false;
        }
        if let Some(token) = consumer {
            if token.is_cancelled() {
                return false;
            }
        }
        self.set_fetch_status(FetchStatus::Fetching);
        debug!(key = %self.key, "retry resumed");
        true
    }

    fn clear_fetch_state(&self) {
        *self.current_fetch.lock() = None;
        *self.revert_data.lock() = None;
    }

    fn spawn_execute(this: &Arc<Self>, is_refetch: bool) {
        let inner = this.clone();
        tokio::spawn(async move {
            ObserverInner::execute(&inner, None, is_refetch, false).await;
        });
    }

    // --- event handling ---------------------------------------------------

    fn spawn_event_loop(this: &Arc<Self>) {
        let inner = this.clone();
        let mut online_rx = this.client.online_source().subscribe();
        let mut focus_rx = this.client.focus_source().subscribe();
        let mut events = this.client.subscribe_events();

        let task = tokio::spawn(async move {
            let mut was_online = *online_rx.borrow();
            let mut was_focused = *focus_rx.borrow();
            loop {
                tokio::select! {
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow();
                        if online && !was_online {
                            Self::handle_online(&inner);
                        } else if !online && was_online {
                            inner.handle_offline();
                        }
                        was_online = online;
                    }
                    changed = focus_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let focused = *focus_rx.borrow();
                        if focused && !was_focused {
                            Self::handle_focus(&inner);
                        }
                        was_focused = focused;
                    }
                    event = events.recv() => match event {
                        Ok(ClientEvent::QueriesInvalidated(keys)) => {
                            if keys.contains(&inner.key) {
                                Self::handle_invalidated(&inner);
                            }
                        }
                        Ok(ClientEvent::QueriesCancelled { keys, options }) => {
                            if keys.contains(&inner.key) {
                                inner.handle_cancel_request(options);
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        *this.event_task.lock() = Some(task);
    }

    /// Offline→online edge: resuming a parked retry takes precedence over
    /// starting a new reconnect fetch.
    fn handle_online(this: &Arc<Self>) {
        if this.is_disposed() {
            return;
        }
        if this.pause_waiters.load(Ordering::Acquire) > 0 {
            this.pause.add_permits(1);
            return;
        }
        if this.refetch_on_reconnect && this.is_enabled() && this.entry_is_stale() {
            debug!(key = %this.key, "refetching on reconnect");
            Self::spawn_execute(this, false);
        }
    }

    fn handle_offline(&self) {
        if self.is_disposed() || self.network_mode == NetworkMode::Always {
            return;
        }
        if self.fetch_status_cell.get() == FetchStatus::Fetching {
            if let Some(source) = &*self.current_fetch.lock() {
                source.cancel();
            }
        }
    }

    fn handle_focus(this: &Arc<Self>) {
        if this.is_disposed() {
            return;
        }
        if this.refetch_on_window_focus && this.is_enabled() && this.entry_is_stale() {
            debug!(key = %this.key, "refetching on window focus");
            Self::spawn_execute(this, false);
        }
    }

    fn handle_invalidated(this: &Arc<Self>) {
        if this.is_disposed() || !this.is_enabled() {
            return;
        }
        debug!(key = %this.key, "refetching after invalidation");
        Self::spawn_execute(this, false);
    }

    fn handle_cancel_request(&self, options: CancelOptions) {
        if self.is_disposed() {
            return;
        }
        let had_fetch = {
            let guard = self.current_fetch.lock();
            match &*guard {
                Some(source) => {
                    source.cancel();
                    true
                }
                None => false,
            }
        };
        if !had_fetch {
            return;
        }

        let pre_fetch = self.revert_data.lock().take().flatten();
        if options.revert {
            if let Some(data) = pre_fetch {
                if let Ok(value) = data.decode::<T>() {
                    self.update(|s| {
                        s.data = Some(value);
                        s.is_fetching_background = false;
                    });
                    return;
                }
            }
        }
        if !options.silent {
            self.update(|s| s.error = Some(QueryError::Cancelled));
        }
    }

    // --- timers -----------------------------------------------------------

    /// One-shot refresh when the entry turns stale after a successful fetch.
    fn start_stale_timer(this: &Arc<Self>) {
        if this.stale_time.is_zero() {
            return;
        }
        let inner = this.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(inner.stale_time).await;
            if inner.is_disposed() || !inner.is_enabled() {
                return;
            }
            if inner.client.is_online() && inner.fetch_status_cell.get() == FetchStatus::Idle {
                trace!(key = %inner.key, "stale timer fired");
                ObserverInner::execute(&inner, None, false, false).await;
            }
        });
        if let Some(previous) = this.stale_timer.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel_stale_timer(&self) {
        if let Some(task) = self.stale_timer.lock().take() {
            task.abort();
        }
    }

    fn start_interval(this: &Arc<Self>) {
        let interval = match *this.refetch_interval.lock() {
            Some(interval) => interval,
            None => return,
        };
        let inner = this.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if inner.is_disposed() || !inner.is_enabled() {
                    break;
                }
                if inner.client.is_online() && inner.fetch_status_cell.get() == FetchStatus::Idle {
                    trace!(key = %inner.key, "interval tick");
                    ObserverInner::execute(&inner, None, false, false).await;
                }
            }
        });
        if let Some(previous) = this.interval_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn stop_interval(&self) {
        if let Some(task) = self.interval_task.lock().take() {
            task.abort();
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.cancel_stale_timer();
        self.stop_interval();
        if let Some(source) = self.current_fetch.lock().take() {
            source.cancel();
        }
        // Release anyone parked on the pause semaphore; they observe the
        // disposed flag and stay down.
        self.pause.add_permits(1);
        self.client.unregister_observer(&self.key, self.id);
        debug!(key = %self.key, observer = %self.id, "observer disposed");
    }
}
