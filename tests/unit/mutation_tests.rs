//! Mutation coordinator tests: lifecycle callbacks, optimistic updates with
//! rollback, latest-call gating, and scope serialization.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use query_core_rs::{
    MutationCallbacks, MutationObserver, MutationOptions, MutationStatus, QueryClient, QueryError,
    QueryKey,
};

#[tokio::test]
async fn test_optimistic_update_rolls_back_on_error() {
    let client = QueryClient::default();
    let key = QueryKey::from(["todos"]);
    client
        .set_query_data(&key, &vec![String::from("existing")])
        .unwrap();

    let on_mutate_key = key.clone();
    let on_error_key = key.clone();
    let observer: MutationObserver<u32, String, Vec<String>> = MutationObserver::new(
        client.clone(),
        MutationOptions::new(|_vars: String| {
            async move { Err(QueryError::fetch("server rejected")) }.boxed()
        })
        .with_on_mutate(move |vars, ctx| {
            let previous = ctx.client.get_query_data::<Vec<String>>(&on_mutate_key);
            let mut optimistic = previous.clone().unwrap_or_default();
            optimistic.push(vars.clone());
            ctx.client.set_query_data(&on_mutate_key, &optimistic)?;
            Ok(previous)
        })
        .with_on_error(move |_err, _vars, previous, ctx| {
            if let Some(previous) = previous {
                let _ = ctx.client.set_query_data(&on_error_key, previous);
            }
        }),
    );

    let result = observer.mutate_async(String::from("new todo"), None).await;
    assert!(result.is_err());
    // Rolled back to the pre-mutation snapshot.
    assert_eq!(
        client.get_query_data::<Vec<String>>(&key),
        Some(vec![String::from("existing")])
    );
}

#[tokio::test]
async fn test_success_writes_through_to_cache() {
    let client = QueryClient::default();
    let key = QueryKey::from(["profile"]);

    let settled_key = key.clone();
    let observer: MutationObserver<String, String> = MutationObserver::new(
        client.clone(),
        MutationOptions::new(|vars: String| async move { Ok(vars.to_uppercase()) }.boxed())
            .with_on_success(move |data, _vars, _token, ctx| {
                let _ = ctx.client.set_query_data(&settled_key, data);
            }),
    );

    observer
        .mutate_async(String::from("ada"), None)
        .await
        .unwrap();
    assert_eq!(
        client.get_query_data::<String>(&key),
        Some(String::from("ADA"))
    );
}

#[tokio::test]
async fn test_per_call_callbacks_skip_superseded_calls() {
    let client = QueryClient::default();
    let release_first = Arc::new(tokio::sync::Notify::new());
    let release_in_fn = release_first.clone();
    let call_index = Arc::new(AtomicU32::new(0));
    let index_in_fn = call_index.clone();

    let observer: Arc<MutationObserver<u32, u32>> = Arc::new(MutationObserver::new(
        client,
        MutationOptions::new(move |vars: u32| {
            let release = release_in_fn.clone();
            let index = index_in_fn.fetch_add(1, Ordering::SeqCst);
            async move {
                if index == 0 {
                    // First call parks until the second finishes.
                    release.notified().await;
                }
                Ok(vars)
            }
            .boxed()
        }),
    ));

    let fired = Arc::new(Mutex::new(Vec::new()));

    let first_fired = fired.clone();
    let first = {
        let observer = observer.clone();
        let callbacks = MutationCallbacks::new().with_on_success(
            move |data: &u32, _vars, _token, _ctx| {
                first_fired.lock().unwrap().push(*data);
            },
        );
        tokio::spawn(async move { observer.mutate_async(1, Some(callbacks)).await })
    };
    // Let the first call park inside its mutation_fn.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second_fired = fired.clone();
    let callbacks = MutationCallbacks::new().with_on_success(
        move |data: &u32, _vars, _token, _ctx| {
            second_fired.lock().unwrap().push(*data);
        },
    );
    observer.mutate_async(2, Some(callbacks)).await.unwrap();

    release_first.notify_one();
    first.await.unwrap().unwrap();

    // Only the latest call's per-call callback fired.
    assert_eq!(*fired.lock().unwrap(), vec![2]);
    // Observable state reflects the most recent call.
    assert_eq!(observer.variables(), Some(2));
    assert_eq!(observer.data(), Some(2));
}

#[tokio::test]
async fn test_option_level_callbacks_fire_for_every_call() {
    let client = QueryClient::default();
    let release_first = Arc::new(tokio::sync::Notify::new());
    let release_in_fn = release_first.clone();
    let call_index = Arc::new(AtomicU32::new(0));
    let index_in_fn = call_index.clone();
    let option_fired = Arc::new(AtomicU32::new(0));
    let option_counter = option_fired.clone();

    let observer: Arc<MutationObserver<u32, u32>> = Arc::new(MutationObserver::new(
        client,
        MutationOptions::new(move |vars: u32| {
            let release = release_in_fn.clone();
            let index = index_in_fn.fetch_add(1, Ordering::SeqCst);
            async move {
                if index == 0 {
                    release.notified().await;
                }
                Ok(vars)
            }
            .boxed()
        })
        .with_on_success(move |_data, _vars, _token, _ctx| {
            option_counter.fetch_add(1, Ordering::SeqCst);
        }),
    ));

    let first = {
        let observer = observer.clone();
        tokio::spawn(async move { observer.mutate_async(1, None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    observer.mutate_async(2, None).await.unwrap();

    release_first.notify_one();
    first.await.unwrap().unwrap();

    assert_eq!(option_fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_mutate_fire_and_forget_swallows_error() {
    let client = QueryClient::default();
    let observer: Arc<MutationObserver<u32, u32>> = Arc::new(MutationObserver::new(
        client,
        MutationOptions::new(|_vars: u32| {
            async move { Err(QueryError::fetch("dropped")) }.boxed()
        }),
    ));

    observer.mutate(1, None);

    tokio::time::timeout(Duration::from_secs(2), async {
        let mut rx = observer.subscribe();
        rx.wait_for(|s| s.status == MutationStatus::Error)
            .await
            .unwrap();
    })
    .await
    .expect("error should land in the snapshot");
    assert_eq!(observer.error(), Some(QueryError::fetch("dropped")));
}

#[tokio::test(start_paused = true)]
async fn test_failure_reason_visible_during_retries() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_fn = attempts.clone();
    let observer: MutationObserver<u32, ()> = MutationObserver::new(
        QueryClient::default(),
        MutationOptions::new(move |_vars: ()| {
            let attempt = attempts_in_fn.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(QueryError::fetch("first"))
                } else {
                    Ok(5)
                }
            }
            .boxed()
        })
        .with_retry(1),
    );

    observer.mutate_async((), None).await.unwrap();
    let snapshot = observer.snapshot();
    assert_eq!(snapshot.status, MutationStatus::Success);
    assert_eq!(snapshot.failure_count, 1);
    assert_eq!(snapshot.failure_reason, Some(QueryError::fetch("first")));
}
