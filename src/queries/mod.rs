//! Multi-query observer
//!
//! Manages a dynamic, homogeneous list of [`QueryObserver`]s. Child change
//! notifications bubble up on one merged watch channel; the reducing variant
//! folds all child snapshots into a combined value, recomputed lazily on
//! read.

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::QueryClient;
use crate::observer::{QueryObserver, QueryOptions, QuerySnapshot};
use crate::retry::QueryError;

struct MultiInner<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    client: QueryClient,
    children: Mutex<Vec<Arc<QueryObserver<T>>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    changes: watch::Sender<Vec<QuerySnapshot<T>>>,
}

impl<T> MultiInner<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn publish(&self) {
        let snapshots: Vec<QuerySnapshot<T>> = self
            .children
            .lock()
            .iter()
            .map(|child| child.snapshot())
            .collect();
        self.changes.send_if_modified(|current| {
            if *current != snapshots {
                *current = snapshots;
                true
            } else {
                false
            }
        });
    }

    fn teardown(&self) {
        for task in self.forwarders.lock().drain(..) {
            task.abort();
        }
        for child in self.children.lock().drain(..) {
            child.dispose();
        }
    }
}

/// Observes a dynamic list of queries of one data type. `C` is the combined
/// value of the reducing variant.
pub struct QueriesObserver<T, C = Vec<QuerySnapshot<T>>>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    inner: Arc<MultiInner<T>>,
    reducer: Option<Arc<dyn Fn(&[QuerySnapshot<T>]) -> C + Send + Sync>>,
}

impl<T> QueriesObserver<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(client: QueryClient) -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(MultiInner {
                client,
                children: Mutex::new(Vec::new()),
                forwarders: Mutex::new(Vec::new()),
                changes,
            }),
            reducer: None,
        }
    }
}

impl<T, C> QueriesObserver<T, C>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// The reducing variant: `combined()` folds every child snapshot.
    pub fn with_reducer(
        client: QueryClient,
        reduce: impl Fn(&[QuerySnapshot<T>]) -> C + Send + Sync + 'static,
    ) -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(MultiInner {
                client,
                children: Mutex::new(Vec::new()),
                forwarders: Mutex::new(Vec::new()),
                changes,
            }),
            reducer: Some(Arc::new(reduce)),
        }
    }

    /// Replace the observed set: disposes the previous observers and builds
    /// one per options entry. Fails atomically; on error no new observer
    /// stays attached.
    pub fn set_queries(&self, options_list: Vec<QueryOptions<T>>) -> Result<(), QueryError> {
        self.inner.teardown();

        let mut children = Vec::with_capacity(options_list.len());
        for options in options_list {
            match QueryObserver::new(self.inner.client.clone(), options) {
                Ok(observer) => children.push(Arc::new(observer)),
                Err(err) => {
                    for child in children {
                        child.dispose();
                    }
                    return Err(err);
                }
            }
        }

        let mut forwarders = Vec::with_capacity(children.len());
        for child in &children {
            let mut rx = child.subscribe();
            let inner = self.inner.clone();
            forwarders.push(tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    inner.publish();
                }
            }));
        }

        debug!(count = children.len(), "observed query set replaced");
        *self.inner.children.lock() = children;
        *self.inner.forwarders.lock() = forwarders;
        self.inner.publish();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.children.lock().is_empty()
    }

    /// Snapshots of every child, in `set_queries` order.
    pub fn snapshots(&self) -> Vec<QuerySnapshot<T>> {
        self.inner
            .children
            .lock()
            .iter()
            .map(|child| child.snapshot())
            .collect()
    }

    /// Merged change channel carrying all child snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Vec<QuerySnapshot<T>>> {
        self.inner.changes.subscribe()
    }

    /// Reduced view over the child snapshots; `None` without a reducer.
    pub fn combined(&self) -> Option<C> {
        let reduce = self.reducer.as_ref()?;
        Some(reduce(&self.snapshots()))
    }

    /// Run every child's `execute` concurrently.
    pub async fn execute_all(&self) {
        let children: Vec<_> = self.inner.children.lock().clone();
        join_all(children.iter().map(|child| child.execute(None))).await;
    }

    /// Run every child's `refetch` concurrently.
    pub async fn refetch_all(&self) {
        let children: Vec<_> = self.inner.children.lock().clone();
        join_all(children.iter().map(|child| child.refetch(None))).await;
    }

    pub fn dispose(&self) {
        self.inner.teardown();
    }
}

impl<T, C> Drop for QueriesObserver<T, C>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
