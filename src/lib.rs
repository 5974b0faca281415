//! # query-core-rs
//!
//! A type-safe asynchronous data caching and query coordination library
//! built on Tokio. It turns ad-hoc network calls into declaratively
//! described, deduplicated, cached, retried, and background-refreshed data
//! dependencies:
//! - Per-key coalescing: concurrent fetches of one key share a single
//!   in-flight future
//! - Retry with exponential backoff, paused while offline and resumed on
//!   reconnect without restarting the attempt sequence
//! - Staleness-driven background refresh, interval polling, window-focus
//!   and reconnect refetching
//! - Mutations with lifecycle callbacks, optional retry, and per-scope
//!   serialization
//! - Infinite queries with cursor evolution and max-page trimming
//! - Filter-based invalidation and cancellation across the cache
//!
//! ## Quick Start
//!
//! ```no_run
//! use futures::FutureExt;
//! use query_core_rs::{QueryClient, QueryObserver, QueryOptions};
//!
//! # async fn example() -> Result<(), query_core_rs::QueryError> {
//! let client = QueryClient::default();
//!
//! let todos = QueryObserver::<Vec<String>>::new(
//!     client.clone(),
//!     QueryOptions::new(["todos"]).with_query_fn(|ctx| {
//!         async move {
//!             // Your fetch logic here; honor ctx.signal for cancellation.
//!             Ok(vec!["learn rust".to_string()])
//!         }
//!         .boxed()
//!     }),
//! )?;
//!
//! todos.execute(None).await;
//! assert_eq!(todos.data(), Some(vec!["learn rust".to_string()]));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancel;
pub mod client;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod observer;
pub mod queries;
pub mod retry;
pub mod sources;
pub mod types;

pub use cache::{CacheEntry, QueryCache, SerializedData};
pub use cancel::{CancelSource, CancelToken};
pub use client::{
    CacheStats, ClientEvent, PrefetchOptions, QueryClient, QueryClientConfig, QueryContext,
    QueryFn,
};
pub use infinite::{
    InfiniteData, InfiniteObserver, InfiniteQueryContext, InfiniteQueryFn, InfiniteQueryOptions,
    InfiniteSnapshot,
};
pub use key::QueryKey;
pub use mutation::{
    MutationCallbacks, MutationContext, MutationObserver, MutationOptions, MutationSnapshot,
};
pub use observer::{QueryObserver, QueryOptions, QuerySnapshot};
pub use queries::QueriesObserver;
pub use retry::{QueryError, RetryDelay, RetryLimit, RetryPolicy};
pub use sources::{FocusSource, OnlineSource};
pub use types::{
    CancelOptions, FetchDirection, FetchStatus, MutationStatus, NetworkMode, QueryFilters,
    QueryKind, QueryMeta, QueryObserverId, QueryStatus,
};
