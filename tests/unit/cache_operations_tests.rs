//! Cache and client operation tests: round trips, filter-based operations,
//! coalescing, counters and events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use query_core_rs::{
    CancelOptions, CancelToken, ClientEvent, FetchStatus, PrefetchOptions, QueryClient,
    QueryError, QueryFilters, QueryKey, QueryKind, QueryObserver, QueryOptions,
};

#[test]
fn test_set_get_round_trip() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);
    client.set_query_data(&key, &vec![1, 2, 3]).unwrap();
    assert_eq!(client.get_query_data::<Vec<i32>>(&key), Some(vec![1, 2, 3]));
}

#[test]
fn test_remove_then_absent() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);
    client.set_query_data(&key, &1u8).unwrap();
    client.cache().remove(&key);
    assert!(!client.cache().contains(&key));
}

#[test]
fn test_invalidate_all_marks_every_entry_stale() {
    let client = QueryClient::default();
    for name in ["a", "b", "c"] {
        client.set_query_data(&QueryKey::from([name]), &0u8).unwrap();
    }

    client.invalidate_queries(&QueryFilters::new());

    for name in ["a", "b", "c"] {
        let entry = client.get_query_state(&QueryKey::from([name])).unwrap();
        assert!(entry.invalidated);
        assert!(entry.is_stale(Duration::from_secs(3600)));
    }
}

#[test]
fn test_set_clears_invalidation_and_error() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);
    client.set_query_data(&key, &1u8).unwrap();
    client.invalidate_queries(&QueryFilters::new().exact(["todos"]));
    assert!(client.get_query_state(&key).unwrap().invalidated);

    client.set_query_data(&key, &2u8).unwrap();
    let entry = client.get_query_state(&key).unwrap();
    assert!(!entry.invalidated);
    assert!(entry.error.is_none());
}

#[tokio::test]
async fn test_fetch_coalesced_single_network_call() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);
    let calls = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = client.cache().clone();
            let key = key.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .fetch_coalesced::<u32, _>(
                        &key,
                        move |_signal| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async move {
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Ok(7)
                            }
                            .boxed()
                        },
                        Duration::ZERO,
                        CancelToken::never(),
                    )
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 7);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prefetch_populates_cache_without_observer() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);

    let value = client
        .prefetch(
            PrefetchOptions::<String>::new(["todos"])
                .with_query_fn(|_ctx| async move { Ok(String::from("prefetched")) }.boxed()),
        )
        .await
        .unwrap();

    assert_eq!(value, "prefetched");
    assert_eq!(
        client.get_query_data::<String>(&key),
        Some(String::from("prefetched"))
    );
    assert!(!client.has_observers(&key));
}

#[tokio::test]
async fn test_default_query_fn_round_trip() {
    let client = QueryClient::default();
    client.set_default_query_fn::<u64, _>(|_ctx| async move { Ok(99) }.boxed());

    let observer = QueryObserver::<u64>::new(client.clone(), QueryOptions::new(["count"])).unwrap();
    observer.execute(None).await;
    assert_eq!(observer.data(), Some(99));
}

#[tokio::test]
async fn test_reset_queries_cancels_silently_and_removes() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);
    client.set_query_data(&key, &1u8).unwrap();

    let mut events = client.subscribe_events();
    client.reset_queries(&QueryFilters::new().exact(["todos"]));

    assert!(client.get_query_state(&key).is_none());
    match events.try_recv().unwrap() {
        ClientEvent::QueriesCancelled { keys, options } => {
            assert_eq!(keys, vec![key]);
            assert!(options.silent);
            assert!(!options.revert);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_queries_carries_options() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);
    client.set_query_data(&key, &1u8).unwrap();

    let mut events = client.subscribe_events();
    client.cancel_queries(
        &QueryFilters::new().with_key(["todos"]),
        CancelOptions {
            silent: true,
            revert: true,
        },
    );

    match events.try_recv().unwrap() {
        ClientEvent::QueriesCancelled { keys, options } => {
            assert_eq!(keys, vec![key]);
            assert!(options.silent);
            assert!(options.revert);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_cache_stats_counts() {
    let client = QueryClient::default();
    client.set_query_data(&QueryKey::from(["a"]), &1u8).unwrap();
    client.set_query_data(&QueryKey::from(["b"]), &2u8).unwrap();

    let stats = client.cache_stats();
    assert_eq!(stats.total_entries, 2);
    // Default stale time is zero, so both entries already count as stale.
    assert_eq!(stats.stale_entries, 2);
    assert_eq!(stats.in_flight, 0);

    client.clear();
    assert_eq!(client.cache_stats().total_entries, 0);
}

#[tokio::test]
async fn test_fetch_status_filter_without_observers() {
    let client = QueryClient::default();
    let key = QueryKey::from(["slow"]);

    let cache = client.cache().clone();
    let fetch_key = key.clone();
    let fetch = tokio::spawn(async move {
        cache
            .fetch_coalesced::<u8, _>(
                &fetch_key,
                |_signal| {
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1)
                    }
                    .boxed()
                },
                Duration::ZERO,
                CancelToken::never(),
            )
            .await
    });

    // Let the fetch install itself.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fetching = client.matching_keys(
        &QueryFilters::new()
            .with_kind(QueryKind::Inactive)
            .with_fetch_status(FetchStatus::Fetching),
    );
    assert_eq!(fetching, vec![key]);

    fetch.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_coalesced_error_propagates_to_all_waiters() {
    let client = QueryClient::default();
    let key = QueryKey::from(["broken"]);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let cache = client.cache().clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .fetch_coalesced::<u8, _>(
                        &key,
                        |_signal| {
                            async move {
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Err(QueryError::fetch("down"))
                            }
                            .boxed()
                        },
                        Duration::ZERO,
                        CancelToken::never(),
                    )
                    .await
            })
        })
        .collect();

    let mut failures = 0;
    for handle in handles {
        if handle.await.unwrap() == Err(QueryError::fetch("down")) {
            failures += 1;
        }
    }
    // One caller installed the fetch, the others joined it; every one of
    // them observes the same error.
    assert_eq!(failures, 3);
    assert_eq!(
        client.get_query_state(&key).unwrap().error,
        Some(QueryError::fetch("down"))
    );
}
