//! Infinite query coordinator tests: cursor evolution, trimming, ordered
//! whole-chain refetch, and concurrency gating.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use query_core_rs::{
    FetchDirection, InfiniteObserver, InfiniteQueryOptions, QueryClient, QueryError, QueryStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Page {
    offset: u32,
    items: Vec<u32>,
    next_cursor: Option<u32>,
    prev_cursor: Option<u32>,
}

fn windowed_source(
    calls: Arc<AtomicU32>,
) -> impl Fn(
    query_core_rs::InfiniteQueryContext<u32>,
) -> futures::future::BoxFuture<'static, Result<Page, QueryError>>
       + Send
       + Sync
       + 'static {
    move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        let offset = ctx.page_param;
        async move {
            Ok(Page {
                offset,
                items: (offset..offset + 3).collect(),
                next_cursor: if offset < 9 { Some(offset + 3) } else { None },
                prev_cursor: offset.checked_sub(3),
            })
        }
        .boxed()
    }
}

fn observer(
    client: QueryClient,
    calls: Arc<AtomicU32>,
    max_pages: Option<usize>,
) -> InfiniteObserver<Page, u32> {
    let mut options = InfiniteQueryOptions::new(["feed"], 0u32, windowed_source(calls))
        .with_next_page_param(|last: &Page, _pages, _param| last.next_cursor)
        .with_previous_page_param(|first: &Page, _pages, _param| first.prev_cursor);
    options.max_pages = max_pages;
    InfiniteObserver::new(client, options).unwrap()
}

#[tokio::test]
async fn test_paginated_walk_matches_cursors() {
    let calls = Arc::new(AtomicU32::new(0));
    let observer = observer(QueryClient::default(), calls.clone(), None);

    observer.execute().await;
    assert_eq!(observer.data().page_params, vec![0]);

    observer.fetch_next_page().await;
    let data = observer.data();
    assert_eq!(data.page_params, vec![0, 3]);
    assert_eq!(data.pages[1].items, vec![3, 4, 5]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_refetch_iterates_existing_params_and_keeps_length() {
    let calls = Arc::new(AtomicU32::new(0));
    let observer = observer(QueryClient::default(), calls.clone(), None);

    observer.execute().await;
    observer.fetch_next_page().await;
    assert_eq!(observer.data().page_params, vec![0, 3]);

    let before_refetch = calls.load(Ordering::SeqCst);
    observer.refetch().await;

    let data = observer.data();
    assert_eq!(data.page_params, vec![0, 3]);
    assert_eq!(data.pages.len(), 2);
    // One call per existing param, in order.
    assert_eq!(calls.load(Ordering::SeqCst), before_refetch + 2);
    assert_eq!(observer.status(), QueryStatus::Success);
}

#[tokio::test]
async fn test_forward_trim_keeps_most_recent_pages() {
    let calls = Arc::new(AtomicU32::new(0));
    let observer = observer(QueryClient::default(), calls, Some(2));

    observer.execute().await;
    observer.fetch_next_page().await;
    observer.fetch_next_page().await;
    observer.fetch_next_page().await;

    let data = observer.data();
    assert_eq!(data.page_params, vec![6, 9]);
    assert!(!observer.has_next_page());
}

#[tokio::test]
async fn test_backward_fetch_prepends_and_trims_from_back() {
    let calls = Arc::new(AtomicU32::new(0));
    let client = QueryClient::default();
    let mut options = InfiniteQueryOptions::new(["feed"], 6u32, windowed_source(calls))
        .with_next_page_param(|last: &Page, _pages, _param| last.next_cursor)
        .with_previous_page_param(|first: &Page, _pages, _param| first.prev_cursor);
    options.max_pages = Some(2);
    let observer = InfiniteObserver::new(client, options).unwrap();

    observer.execute().await;
    assert_eq!(observer.data().page_params, vec![6]);
    assert!(observer.has_previous_page());

    observer.fetch_previous_page().await.unwrap();
    assert_eq!(observer.data().page_params, vec![3, 6]);

    // Trimming on backward fetch drops the newest page.
    observer.fetch_previous_page().await.unwrap();
    assert_eq!(observer.data().page_params, vec![0, 3]);
    assert!(!observer.has_previous_page());
}

#[tokio::test]
async fn test_execute_resets_chain_to_first_page() {
    let calls = Arc::new(AtomicU32::new(0));
    let observer = observer(QueryClient::default(), calls, None);

    observer.execute().await;
    observer.fetch_next_page().await;
    observer.fetch_next_page().await;
    assert_eq!(observer.data().len(), 3);

    observer.execute().await;
    let data = observer.data();
    assert_eq!(data.page_params, vec![0]);
    assert_eq!(data.pages.len(), 1);
}

#[tokio::test]
async fn test_concurrent_fetch_next_noops_while_busy() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_fn = calls.clone();
    let options = InfiniteQueryOptions::new(["slow"], 0u32, move |ctx| {
        calls_in_fn.fetch_add(1, Ordering::SeqCst);
        let offset: u32 = ctx.page_param;
        async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok(Page {
                offset,
                items: vec![offset],
                next_cursor: Some(offset + 1),
                prev_cursor: None,
            })
        }
        .boxed()
    })
    .with_next_page_param(|last: &Page, _pages, _param| last.next_cursor);
    let observer = Arc::new(InfiniteObserver::new(QueryClient::default(), options).unwrap());

    observer.execute().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Two concurrent forward fetches: the second no-ops.
    let a = {
        let observer = observer.clone();
        tokio::spawn(async move { observer.fetch_next_page().await })
    };
    let b = {
        let observer = observer.clone();
        tokio::spawn(async move { observer.fetch_next_page().await })
    };
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(observer.data().len(), 2);
}

#[tokio::test]
async fn test_direction_is_reported_to_query_fn() {
    let directions = Arc::new(std::sync::Mutex::new(Vec::new()));
    let directions_in_fn = directions.clone();
    let options = InfiniteQueryOptions::new(["dir"], 5u32, move |ctx| {
        directions_in_fn.lock().unwrap().push(ctx.direction);
        let offset: u32 = ctx.page_param;
        async move {
            Ok(Page {
                offset,
                items: vec![],
                next_cursor: Some(offset + 1),
                prev_cursor: offset.checked_sub(1),
            })
        }
        .boxed()
    })
    .with_next_page_param(|last: &Page, _pages, _param| last.next_cursor)
    .with_previous_page_param(|first: &Page, _pages, _param| first.prev_cursor);
    let observer = InfiniteObserver::new(QueryClient::default(), options).unwrap();

    observer.execute().await;
    observer.fetch_next_page().await;
    observer.fetch_previous_page().await.unwrap();

    assert_eq!(
        *directions.lock().unwrap(),
        vec![
            FetchDirection::Forward,
            FetchDirection::Forward,
            FetchDirection::Backward,
        ]
    );
}

#[tokio::test]
async fn test_fetch_previous_without_callback_is_configuration_error() {
    let options = InfiniteQueryOptions::new(["feed"], 0u32, |ctx| {
        let offset: u32 = ctx.page_param;
        async move {
            Ok(Page {
                offset,
                items: vec![],
                next_cursor: None,
                prev_cursor: None,
            })
        }
        .boxed()
    })
    .with_next_page_param(|last: &Page, _pages, _param| last.next_cursor);
    let observer = InfiniteObserver::new(QueryClient::default(), options).unwrap();

    observer.execute().await;
    let result = observer.fetch_previous_page().await;
    assert!(matches!(result, Err(QueryError::Configuration(_))));
}
