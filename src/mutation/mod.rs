//! Mutation observer
//!
//! Runs consumer-supplied mutations with lifecycle callbacks, optional retry,
//! and per-scope serialization. The optimistic-update recipe mirrors the
//! query side: snapshot the cache in `on_mutate`, write the optimistic value,
//! return a rollback token, and restore the snapshot in `on_error`:
//!
//! ```ignore
//! let options = MutationOptions::new(|vars: Todo| { /* send */ })
//!     .with_on_mutate(|vars, ctx| {
//!         let previous = ctx.client.get_query_data::<Vec<Todo>>(&key);
//!         ctx.client.set_query_data(&key, &optimistic(vars))?;
//!         Ok(previous)
//!     })
//!     .with_on_error(|_err, _vars, previous, ctx| {
//!         if let Some(previous) = previous {
//!             let _ = ctx.client.set_query_data(&key, previous);
//!         }
//!     });
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::client::QueryClient;
use crate::key::QueryKey;
use crate::retry::{QueryError, RetryPolicy};
use crate::types::{MutationStatus, NetworkMode, QueryMeta};

/// Monotonic across every mutation in the process; per-call callbacks fire
/// only when their id is still the newest the observer has issued.
static NEXT_MUTATION_ID: AtomicU64 = AtomicU64::new(0);

fn next_mutation_id() -> u64 {
    NEXT_MUTATION_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Context handed to mutation callbacks.
#[derive(Clone)]
pub struct MutationContext {
    pub client: QueryClient,
    pub mutation_key: Option<QueryKey>,
    pub meta: QueryMeta,
}

pub type MutationFn<TData, TVars> =
    Arc<dyn Fn(TVars) -> BoxFuture<'static, Result<TData, QueryError>> + Send + Sync>;

pub type OnMutate<TVars, TContext> = Arc<
    dyn Fn(&TVars, &MutationContext) -> Result<Option<TContext>, QueryError> + Send + Sync,
>;
pub type OnSuccess<TData, TVars, TContext> =
    Arc<dyn Fn(&TData, &TVars, Option<&TContext>, &MutationContext) + Send + Sync>;
pub type OnError<TVars, TContext> =
    Arc<dyn Fn(&QueryError, &TVars, Option<&TContext>, &MutationContext) + Send + Sync>;
pub type OnSettled<TData, TVars, TContext> = Arc<
    dyn Fn(Option<&TData>, Option<&QueryError>, &TVars, Option<&TContext>, &MutationContext)
        + Send
        + Sync,
>;

/// Options for a mutation observer.
#[derive(Clone)]
pub struct MutationOptions<TData, TVars, TContext = ()> {
    pub mutation_fn: MutationFn<TData, TVars>,
    pub mutation_key: Option<QueryKey>,
    pub retry: RetryPolicy,
    /// `None` falls back to the client default
    pub network_mode: Option<NetworkMode>,
    pub meta: QueryMeta,
    /// Mutations sharing a scope id run serially
    pub scope_id: Option<String>,
    pub on_mutate: Option<OnMutate<TVars, TContext>>,
    pub on_success: Option<OnSuccess<TData, TVars, TContext>>,
    pub on_error: Option<OnError<TVars, TContext>>,
    pub on_settled: Option<OnSettled<TData, TVars, TContext>>,
}

impl<TData, TVars, TContext> MutationOptions<TData, TVars, TContext> {
    pub fn new<F>(mutation_fn: F) -> Self
    where
        F: Fn(TVars) -> BoxFuture<'static, Result<TData, QueryError>> + Send + Sync + 'static,
    {
        Self {
            mutation_fn: Arc::new(mutation_fn),
            mutation_key: None,
            retry: RetryPolicy::none(),
            network_mode: None,
            meta: QueryMeta::default(),
            scope_id: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn with_mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    pub fn with_retry(mut self, retries: u32) -> Self {
        self.retry = RetryPolicy::count(retries);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    pub fn with_meta(mut self, meta: QueryMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_on_mutate<F>(mut self, on_mutate: F) -> Self
    where
        F: Fn(&TVars, &MutationContext) -> Result<Option<TContext>, QueryError>
            + Send
            + Sync
            + 'static,
    {
        self.on_mutate = Some(Arc::new(on_mutate));
        self
    }

    pub fn with_on_success<F>(mut self, on_success: F) -> Self
    where
        F: Fn(&TData, &TVars, Option<&TContext>, &MutationContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(on_success));
        self
    }

    pub fn with_on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&QueryError, &TVars, Option<&TContext>, &MutationContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn with_on_settled<F>(mut self, on_settled: F) -> Self
    where
        F: Fn(Option<&TData>, Option<&QueryError>, &TVars, Option<&TContext>, &MutationContext)
            + Send
            + Sync
            + 'static,
    {
        self.on_settled = Some(Arc::new(on_settled));
        self
    }
}

/// Per-call callbacks passed to `mutate`/`mutate_async`; they fire only when
/// the call is still the observer's latest.
#[derive(Clone, Default)]
pub struct MutationCallbacks<TData, TVars, TContext = ()> {
    pub on_success: Option<OnSuccess<TData, TVars, TContext>>,
    pub on_error: Option<OnError<TVars, TContext>>,
    pub on_settled: Option<OnSettled<TData, TVars, TContext>>,
}

impl<TData, TVars, TContext> MutationCallbacks<TData, TVars, TContext> {
    pub fn new() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn with_on_success<F>(mut self, on_success: F) -> Self
    where
        F: Fn(&TData, &TVars, Option<&TContext>, &MutationContext) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(on_success));
        self
    }

    pub fn with_on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&QueryError, &TVars, Option<&TContext>, &MutationContext) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn with_on_settled<F>(mut self, on_settled: F) -> Self
    where
        F: Fn(Option<&TData>, Option<&QueryError>, &TVars, Option<&TContext>, &MutationContext)
            + Send
            + Sync
            + 'static,
    {
        self.on_settled = Some(Arc::new(on_settled));
        self
    }
}

/// Observable state of the most recent mutation call.
#[derive(Clone, PartialEq)]
pub struct MutationSnapshot<TData, TVars> {
    pub data: Option<TData>,
    pub error: Option<QueryError>,
    pub variables: Option<TVars>,
    pub status: MutationStatus,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub submitted_at: Option<Instant>,
    pub is_paused: bool,
}

impl<TData, TVars> MutationSnapshot<TData, TVars> {
    fn idle() -> Self {
        Self {
            data: None,
            error: None,
            variables: None,
            status: MutationStatus::Idle,
            failure_count: 0,
            failure_reason: None,
            submitted_at: None,
            is_paused: false,
        }
    }
}

struct MutationInner<TData, TVars, TContext> {
    client: QueryClient,
    options: MutationOptions<TData, TVars, TContext>,
    network_mode: NetworkMode,
    snapshot: watch::Sender<MutationSnapshot<TData, TVars>>,
    latest_mutation: AtomicU64,
}

/// Coordinates mutation execution and state for one consumer.
pub struct MutationObserver<TData, TVars, TContext = ()>
where
    TData: Clone + PartialEq + Send + Sync + 'static,
    TVars: Clone + PartialEq + Send + Sync + 'static,
    TContext: Clone + Send + Sync + 'static,
{
    inner: Arc<MutationInner<TData, TVars, TContext>>,
}

impl<TData, TVars, TContext> MutationObserver<TData, TVars, TContext>
where
    TData: Clone + PartialEq + Send + Sync + 'static,
    TVars: Clone + PartialEq + Send + Sync + 'static,
    TContext: Clone + Send + Sync + 'static,
{
    pub fn new(client: QueryClient, options: MutationOptions<TData, TVars, TContext>) -> Self {
        let network_mode = options
            .network_mode
            .unwrap_or(client.config().default_network_mode);
        let (snapshot, _) = watch::channel(MutationSnapshot::idle());
        Self {
            inner: Arc::new(MutationInner {
                client,
                options,
                network_mode,
                snapshot,
                latest_mutation: AtomicU64::new(0),
            }),
        }
    }

    pub fn snapshot(&self) -> MutationSnapshot<TData, TVars> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationSnapshot<TData, TVars>> {
        self.inner.snapshot.subscribe()
    }

    pub fn data(&self) -> Option<TData> {
        self.inner.snapshot.borrow().data.clone()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.inner.snapshot.borrow().error.clone()
    }

    pub fn variables(&self) -> Option<TVars> {
        self.inner.snapshot.borrow().variables.clone()
    }

    pub fn status(&self) -> MutationStatus {
        self.inner.snapshot.borrow().status
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.snapshot.borrow().failure_count
    }

    pub fn is_paused(&self) -> bool {
        self.inner.snapshot.borrow().is_paused
    }

    /// Fire-and-forget: the terminal result is observable through the
    /// snapshot and callbacks only.
    pub fn mutate(
        &self,
        variables: TVars,
        callbacks: Option<MutationCallbacks<TData, TVars, TContext>>,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = MutationInner::run(&inner, variables, callbacks).await;
        });
    }

    /// Awaitable variant; returns the terminal result, rethrowing the error
    /// after the retry policy is exhausted.
    pub async fn mutate_async(
        &self,
        variables: TVars,
        callbacks: Option<MutationCallbacks<TData, TVars, TContext>>,
    ) -> Result<TData, QueryError> {
        MutationInner::run(&self.inner, variables, callbacks).await
    }

    /// Return to Idle, clearing data, error and variables.
    pub fn reset(&self) {
        self.inner.snapshot.send_replace(MutationSnapshot::idle());
    }
}

impl<TData, TVars, TContext> MutationInner<TData, TVars, TContext>
where
    TData: Clone + PartialEq + Send + Sync + 'static,
    TVars: Clone + PartialEq + Send + Sync + 'static,
    TContext: Clone + Send + Sync + 'static,
{
    /// Apply a state change only while `id` is still the latest call, so the
    /// observable fields always describe the most recent mutation.
    fn update(&self, id: u64, apply: impl FnOnce(&mut MutationSnapshot<TData, TVars>)) {
        if self.latest_mutation.load(Ordering::Acquire) != id {
            return;
        }
        self.snapshot.send_if_modified(|snap| {
            let before = snap.clone();
            apply(snap);
            *snap != before
        });
    }

    fn is_latest(&self, id: u64) -> bool {
        self.latest_mutation.load(Ordering::Acquire) == id
    }

    async fn run(
        this: &Arc<Self>,
        variables: TVars,
        callbacks: Option<MutationCallbacks<TData, TVars, TContext>>,
    ) -> Result<TData, QueryError> {
        let id = next_mutation_id();
        this.latest_mutation.store(id, Ordering::Release);
        trace!(mutation = id, "mutation started");

        this.update(id, |s| {
            *s = MutationSnapshot {
                variables: Some(variables.clone()),
                status: MutationStatus::Pending,
                submitted_at: Some(Instant::now()),
                ..MutationSnapshot::idle()
            };
        });

        let context = MutationContext {
            client: this.client.clone(),
            mutation_key: this.options.mutation_key.clone(),
            meta: this.options.meta.clone(),
        };

        // Online-mode mutations pause and fail once while offline.
        if this.network_mode == NetworkMode::Online && !this.client.is_online() {
            this.update(id, |s| s.is_paused = true);
            debug!(mutation = id, "mutation paused offline; failing");
            return this
                .settle(id, &variables, &callbacks, None, Err(QueryError::Offline), &context)
                .await;
        }

        let on_mutate_result = match &this.options.on_mutate {
            Some(on_mutate) => match on_mutate(&variables, &context) {
                Ok(token) => token,
                Err(err) => {
                    return this
                        .settle(id, &variables, &callbacks, None, Err(err), &context)
                        .await;
                }
            },
            None => None,
        };

        // Serialize with every other mutation sharing the scope.
        let _scope_guard = match &this.options.scope_id {
            Some(scope_id) => Some(this.client.scope_lock(scope_id).lock_owned().await),
            None => None,
        };

        let mut failure_count = 0u32;
        let result = loop {
            match (this.options.mutation_fn)(variables.clone()).await {
                Ok(data) => break Ok(data),
                Err(err) => {
                    failure_count += 1;
                    let attempt_index = failure_count - 1;
                    this.update(id, |s| {
                        s.failure_count = failure_count;
                        s.failure_reason = Some(err.clone());
                    });
                    if !this.options.retry.should_retry(attempt_index, &err) {
                        break Err(err);
                    }
                    tokio::time::sleep(this.options.retry.delay_for(attempt_index)).await;
                }
            }
        };

        this.settle(id, &variables, &callbacks, on_mutate_result, result, &context)
            .await
    }

    /// Write the terminal state and run callbacks: option-level first, then
    /// per-call (latest id only), success/error before settled.
    async fn settle(
        &self,
        id: u64,
        variables: &TVars,
        callbacks: &Option<MutationCallbacks<TData, TVars, TContext>>,
        on_mutate_result: Option<TContext>,
        result: Result<TData, QueryError>,
        context: &MutationContext,
    ) -> Result<TData, QueryError> {
        let token = on_mutate_result.as_ref();
        match &result {
            Ok(data) => {
                debug!(mutation = id, "mutation succeeded");
                self.update(id, |s| {
                    s.data = Some(data.clone());
                    s.error = None;
                    s.status = MutationStatus::Success;
                });
                if let Some(on_success) = &self.options.on_success {
                    on_success(data, variables, token, context);
                }
                if self.is_latest(id) {
                    if let Some(on_success) = callbacks.as_ref().and_then(|c| c.on_success.as_ref())
                    {
                        on_success(data, variables, token, context);
                    }
                }
                if let Some(on_settled) = &self.options.on_settled {
                    on_settled(Some(data), None, variables, token, context);
                }
                if self.is_latest(id) {
                    if let Some(on_settled) = callbacks.as_ref().and_then(|c| c.on_settled.as_ref())
                    {
                        on_settled(Some(data), None, variables, token, context);
                    }
                }
            }
            Err(err) => {
                debug!(mutation = id, error = %err, "mutation failed");
                self.update(id, |s| {
                    s.error = Some(err.clone());
                    s.status = MutationStatus::Error;
                });
                if let Some(on_error) = &self.options.on_error {
                    on_error(err, variables, token, context);
                }
                if self.is_latest(id) {
                    if let Some(on_error) = callbacks.as_ref().and_then(|c| c.on_error.as_ref()) {
                        on_error(err, variables, token, context);
                    }
                }
                if let Some(on_settled) = &self.options.on_settled {
                    on_settled(None, Some(err), variables, token, context);
                }
                if self.is_latest(id) {
                    if let Some(on_settled) = callbacks.as_ref().and_then(|c| c.on_settled.as_ref())
                    {
                        on_settled(None, Some(err), variables, token, context);
                    }
                }
            }
        }
        result
    }
}

// Serde bounds are not needed for mutations themselves; this impl block adds
// cache-touching conveniences for data types that can live in the cache.
impl<TData, TVars, TContext> MutationObserver<TData, TVars, TContext>
where
    TData: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    TVars: Clone + PartialEq + Send + Sync + 'static,
    TContext: Clone + Send + Sync + 'static,
{
    /// Write the last successful mutation result into the cache under `key`.
    pub fn seed_query_data(&self, key: &QueryKey) -> Result<(), QueryError> {
        match self.data() {
            Some(data) => self.inner.client.set_query_data(key, &data),
            None => Err(QueryError::NotFound(key.to_string())),
        }
    }
}
