//! Infinite query observer
//!
//! Maintains an ordered chain of pages and the page params that produced
//! them. Fetching forward appends and trims the oldest pages beyond
//! `max_pages`; fetching backward prepends and trims the newest. `refetch`
//! walks the existing params in order so the chain stays consistent even
//! when cursors have since moved.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::client::QueryClient;
use crate::key::QueryKey;
use crate::retry::{QueryError, RetryPolicy};
use crate::types::{FetchDirection, FetchStatus, QueryMeta, QueryStatus};

/// Context handed to infinite query functions; carries the cursor and the
/// direction of the fetch.
#[derive(Clone)]
pub struct InfiniteQueryContext<TParam> {
    pub key: QueryKey,
    pub signal: CancelToken,
    pub meta: QueryMeta,
    pub client: QueryClient,
    pub page_param: TParam,
    pub direction: FetchDirection,
}

pub type InfiniteQueryFn<TPage, TParam> = Arc<
    dyn Fn(InfiniteQueryContext<TParam>) -> BoxFuture<'static, Result<TPage, QueryError>>
        + Send
        + Sync,
>;

/// Derives the next (or previous) cursor from the boundary page, the full
/// chain, and the boundary param. `None` means the chain ends there.
pub type GetPageParam<TPage, TParam> =
    Arc<dyn Fn(&TPage, &[TPage], &TParam) -> Option<TParam> + Send + Sync>;

/// Options for an infinite query observer.
#[derive(Clone)]
pub struct InfiniteQueryOptions<TPage, TParam> {
    pub query_key: QueryKey,
    pub query_fn: InfiniteQueryFn<TPage, TParam>,
    /// Seeds the chain before the first page resolves
    pub initial_page_param: TParam,
    pub get_next_page_param: Option<GetPageParam<TPage, TParam>>,
    pub get_previous_page_param: Option<GetPageParam<TPage, TParam>>,
    pub max_pages: Option<usize>,
    pub retry: RetryPolicy,
    pub meta: QueryMeta,
    /// Only `true` is supported: page fetches no-op while another fetch runs
    pub cancel_refetch: bool,
}

impl<TPage, TParam> InfiniteQueryOptions<TPage, TParam> {
    pub fn new<F>(
        query_key: impl Into<QueryKey>,
        initial_page_param: TParam,
        query_fn: F,
    ) -> Self
    where
        F: Fn(InfiniteQueryContext<TParam>) -> BoxFuture<'static, Result<TPage, QueryError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            query_key: query_key.into(),
            query_fn: Arc::new(query_fn),
            initial_page_param,
            get_next_page_param: None,
            get_previous_page_param: None,
            max_pages: None,
            retry: RetryPolicy::default(),
            meta: QueryMeta::default(),
            cancel_refetch: true,
        }
    }

    pub fn with_next_page_param<F>(mut self, get_next: F) -> Self
    where
        F: Fn(&TPage, &[TPage], &TParam) -> Option<TParam> + Send + Sync + 'static,
    {
        self.get_next_page_param = Some(Arc::new(get_next));
        self
    }

    pub fn with_previous_page_param<F>(mut self, get_previous: F) -> Self
    where
        F: Fn(&TPage, &[TPage], &TParam) -> Option<TParam> + Send + Sync + 'static,
    {
        self.get_previous_page_param = Some(Arc::new(get_previous));
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_meta(mut self, meta: QueryMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_cancel_refetch(mut self, cancel_refetch: bool) -> Self {
        self.cancel_refetch = cancel_refetch;
        self
    }
}

/// The page chain: `pages[i]` was produced by `page_params[i]`.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct InfiniteData<TPage, TParam> {
    pub pages: Vec<TPage>,
    pub page_params: Vec<TParam>,
}

impl<TPage, TParam> InfiniteData<TPage, TParam> {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }
}

/// Observable state of an infinite query.
#[derive(Clone, PartialEq)]
pub struct InfiniteSnapshot<TPage, TParam> {
    pub data: InfiniteData<TPage, TParam>,
    pub error: Option<QueryError>,
    pub fetch_status: FetchStatus,
    pub failure_count: u32,
}

impl<TPage, TParam> InfiniteSnapshot<TPage, TParam> {
    fn empty() -> Self {
        Self {
            data: InfiniteData {
                pages: Vec::new(),
                page_params: Vec::new(),
            },
            error: None,
            fetch_status: FetchStatus::Idle,
            failure_count: 0,
        }
    }

    pub fn status(&self) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Error
        } else if !self.data.is_empty() {
            QueryStatus::Success
        } else {
            QueryStatus::Pending
        }
    }
}

struct InfiniteInner<TPage, TParam> {
    client: QueryClient,
    options: InfiniteQueryOptions<TPage, TParam>,
    snapshot: watch::Sender<InfiniteSnapshot<TPage, TParam>>,
    /// Serializes execute/fetch_next/fetch_previous/refetch
    op_lock: tokio::sync::Mutex<()>,
}

/// Observer for a paginated chain of fetches.
pub struct InfiniteObserver<TPage, TParam>
where
    TPage: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    TParam: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<InfiniteInner<TPage, TParam>>,
}

impl<TPage, TParam> InfiniteObserver<TPage, TParam>
where
    TPage: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    TParam: Clone + PartialEq + Send + Sync + 'static,
{
    /// Validates the configuration: `get_next_page_param` is required and
    /// queueing page fetches (`cancel_refetch = false`) is rejected.
    pub fn new(
        client: QueryClient,
        options: InfiniteQueryOptions<TPage, TParam>,
    ) -> Result<Self, QueryError> {
        if !options.cancel_refetch {
            return Err(QueryError::configuration(
                "queueing concurrent page fetches (cancel_refetch = false) is not supported",
            ));
        }
        if options.get_next_page_param.is_none() {
            return Err(QueryError::configuration(
                "infinite queries require get_next_page_param",
            ));
        }
        let (snapshot, _) = watch::channel(InfiniteSnapshot::empty());
        Ok(Self {
            inner: Arc::new(InfiniteInner {
                client,
                options,
                snapshot,
                op_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn snapshot(&self) -> InfiniteSnapshot<TPage, TParam> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InfiniteSnapshot<TPage, TParam>> {
        self.inner.snapshot.subscribe()
    }

    pub fn data(&self) -> InfiniteData<TPage, TParam> {
        self.inner.snapshot.borrow().data.clone()
    }

    pub fn pages(&self) -> Vec<TPage> {
        self.inner.snapshot.borrow().data.pages.clone()
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

    /// True when the chain is non-empty and the cursor derivation yields a
    /// further page.
    pub fn has_next_page(&self) -> bool {
        let snapshot = self.inner.snapshot.borrow();
        self.inner.next_param(&snapshot.data).is_some()
    }

    pub fn has_previous_page(&self) -> bool {
        let snapshot = self.inner.snapshot.borrow();
        self.inner.previous_param(&snapshot.data).is_some()
    }

    /// Fetch page 0 only, resetting the chain to a single page.
    pub async fn execute(&self) {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.fetch_first_page().await;
    }

    /// Append the next page. No-op while another operation runs, when the
    /// chain is empty, or when the cursor derivation returns `None`.
    pub async fn fetch_next_page(&self) {
        let _guard = match self.inner.op_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                trace!(key = %self.inner.options.query_key, "fetch_next_page skipped; busy");
                return;
            }
        };
        let data = self.inner.snapshot.borrow().data.clone();
        if data.is_empty() {
            self.inner.fetch_first_page().await;
            return;
        }
        let param = match self.inner.next_param(&data) {
            Some(param) => param,
            None => return,
        };
        if let Some(page) = self.inner.fetch_page(param.clone(), FetchDirection::Forward).await {
            self.inner.update(|s| {
                s.data.pages.push(page);
                s.data.page_params.push(param);
                if let Some(max_pages) = self.inner.options.max_pages {
                    while s.data.pages.len() > max_pages {
                        s.data.pages.remove(0);
                        s.data.page_params.remove(0);
                    }
                }
            });
        }
    }

    /// Prepend the previous page; symmetric to [`Self::fetch_next_page`].
    ///
    /// Fails with [`QueryError::Configuration`] when the options carry no
    /// `get_previous_page_param`.
    pub async fn fetch_previous_page(&self) -> Result<(), QueryError> {
        if self.inner.options.get_previous_page_param.is_none() {
            return Err(QueryError::configuration(
                "fetch_previous_page requires get_previous_page_param",
            ));
        }
        let _guard = match self.inner.op_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                trace!(key = %self.inner.options.query_key, "fetch_previous_page skipped; busy");
                return Ok(());
            }
        };
        let data = self.inner.snapshot.borrow().data.clone();
        if data.is_empty() {
            self.inner.fetch_first_page().await;
            return Ok(());
        }
        let param = match self.inner.previous_param(&data) {
            Some(param) => param,
            None => return Ok(()),
        };
        if let Some(page) = self
            .inner
            .fetch_page(param.clone(), FetchDirection::Backward)
            .await
        {
            self.inner.update(|s| {
                s.data.pages.insert(0, page);
                s.data.page_params.insert(0, param);
                if let Some(max_pages) = self.inner.options.max_pages {
                    while s.data.pages.len() > max_pages {
                        s.data.pages.pop();
                        s.data.page_params.pop();
                    }
                }
            });
        }
        Ok(())
    }

    /// Re-fetch every page by walking the current params in order, ignoring
    /// cursor derivations, and replace the chain atomically. On any page
    /// failure the old chain is kept and the error surfaces in the snapshot.
    pub async fn refetch(&self) {
        let _guard = self.inner.op_lock.lock().await;
        let params = self.inner.snapshot.borrow().data.page_params.clone();
        if params.is_empty() {
            self.inner.fetch_first_page().await;
            return;
        }

        self.inner.update(|s| s.fetch_status = FetchStatus::Fetching);
        debug!(key = %self.inner.options.query_key, pages = params.len(), "refetching page chain");

        let mut pages = Vec::with_capacity(params.len());
        for param in &params {
            match self
                .inner
                .run_with_retry(param.clone(), FetchDirection::Forward)
                .await
            {
                Ok(page) => pages.push(page),
                Err(err) => {
                    self.inner.update(|s| {
                        s.error = Some(err.clone());
                        s.fetch_status = FetchStatus::Idle;
                    });
                    return;
                }
            }
        }

        self.inner.update(|s| {
            s.data = InfiniteData {
                pages,
                page_params: params,
            };
            s.error = None;
            s.fetch_status = FetchStatus::Idle;
        });
    }
}

impl<TPage, TParam> InfiniteInner<TPage, TParam>
where
    TPage: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    TParam: Clone + PartialEq + Send + Sync + 'static,
{
    fn update(&self, apply: impl FnOnce(&mut InfiniteSnapshot<TPage, TParam>)) {
        self.snapshot.send_if_modified(|snap| {
            let before = snap.clone();
            apply(snap);
            *snap != before
        });
    }

    fn next_param(&self, data: &InfiniteData<TPage, TParam>) -> Option<TParam> {
        let last_page = data.pages.last()?;
        let last_param = data.page_params.last()?;
        let get_next = self.options.get_next_page_param.as_ref()?;
        get_next(last_page, &data.pages, last_param)
    }

    fn previous_param(&self, data: &InfiniteData<TPage, TParam>) -> Option<TParam> {
        let first_page = data.pages.first()?;
        let first_param = data.page_params.first()?;
        let get_previous = self.options.get_previous_page_param.as_ref()?;
        get_previous(first_page, &data.pages, first_param)
    }

    /// Fetch the seed page and reset the chain to it.
    async fn fetch_first_page(&self) {
        let param = self.options.initial_page_param.clone();
        self.update(|s| s.fetch_status = FetchStatus::Fetching);
        match self.run_with_retry(param.clone(), FetchDirection::Forward).await {
            Ok(page) => self.update(|s| {
                s.data = InfiniteData {
                    pages: vec![page],
                    page_params: vec![param],
                };
                s.error = None;
                s.fetch_status = FetchStatus::Idle;
            }),
            Err(err) => self.update(|s| {
                s.error = Some(err);
                s.fetch_status = FetchStatus::Idle;
            }),
        }
    }

    /// Fetch one page, recording errors in the snapshot. Returns the page on
    /// success.
    async fn fetch_page(&self, param: TParam, direction: FetchDirection) -> Option<TPage> {
        self.update(|s| s.fetch_status = FetchStatus::Fetching);
        let outcome = self.run_with_retry(param, direction).await;
        match outcome {
            Ok(page) => {
                self.update(|s| {
                    s.error = None;
                    s.fetch_status = FetchStatus::Idle;
                });
                Some(page)
            }
            Err(err) => {
                self.update(|s| {
                    s.error = Some(err);
                    s.fetch_status = FetchStatus::Idle;
                });
                None
            }
        }
    }

    async fn run_with_retry(
        &self,
        param: TParam,
        direction: FetchDirection,
    ) -> Result<TPage, QueryError> {
        let mut failure_count = self.snapshot.borrow().failure_count;
        loop {
            let context = InfiniteQueryContext {
                key: self.options.query_key.clone(),
                signal: CancelToken::never(),
                meta: self.options.meta.clone(),
                client: self.client.clone(),
                page_param: param.clone(),
                direction,
            };
            match (self.options.query_fn)(context).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    failure_count += 1;
                    let attempt_index = failure_count - 1;
                    self.update(|s| s.failure_count = failure_count);
                    if !self.options.retry.should_retry(attempt_index, &err) {
                        return Err(err);
                    }
                    tokio::time::sleep(self.options.retry.delay_for(attempt_index)).await;
                }
            }
        }
    }
}
