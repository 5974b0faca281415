//! Query cache
//!
//! Keyed store of fetch results. Each entry holds the last successful data,
//! the last terminal error, the success timestamp, and — while a fetch is in
//! flight — a shared future every concurrent caller of
//! [`QueryCache::fetch_coalesced`] awaits, so at most one fetch crosses the
//! network per key at any moment.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::key::QueryKey;
use crate::retry::QueryError;

/// Serialized data for caching, tagged with the source type so typed reads
/// can answer "is this a T" without a trial decode.
#[derive(Clone, Debug)]
pub struct SerializedData {
    bytes: Vec<u8>,
    type_id: TypeId,
    type_name: &'static str,
}

impl SerializedData {
    pub fn encode<T: Serialize + 'static>(value: &T) -> Result<Self, QueryError> {
        let bytes = bincode::serialize(value)
            .map_err(|e| QueryError::Serialization(e.to_string()))?;
        Ok(Self {
            bytes,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        })
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn decode<T: DeserializeOwned + 'static>(&self) -> Result<T, QueryError> {
        if !self.is::<T>() {
            return Err(QueryError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                actual: self.type_name,
            });
        }
        bincode::deserialize(&self.bytes)
            .map_err(|e| QueryError::Deserialization(e.to_string()))
    }

    /// Byte-level equality; the engine's notion of "same data" across fetches.
    pub fn same_as(&self, other: &SerializedData) -> bool {
        self.type_id == other.type_id && self.bytes == other.bytes
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<SerializedData, QueryError>>>;

/// Cache entry for one query key.
#[derive(Clone, Debug, Default)]
pub struct CacheEntry {
    pub data: Option<SerializedData>,
    pub error: Option<QueryError>,
    /// Stamp of the last successful fetch; `None` until one completes
    pub updated_at: Option<Instant>,
    /// Explicitly marked stale regardless of age
    pub invalidated: bool,
    in_flight: Option<SharedFetch>,
}

impl CacheEntry {
    /// Stale means never fetched, explicitly invalidated, or older than
    /// `stale_time`.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.invalidated {
            return true;
        }
        match self.updated_at {
            None => true,
            Some(updated_at) => updated_at.elapsed() >= stale_time,
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Typed view of the data; `None` when absent or of another type.
    pub fn data_as<T: DeserializeOwned + 'static>(&self) -> Option<T> {
        self.data
            .as_ref()
            .filter(|data| data.is::<T>())
            .and_then(|data| data.decode::<T>().ok())
    }
}

/// Concurrent keyed cache with a singleton in-flight fetch per key.
#[derive(Clone, Default)]
pub struct QueryCache {
    entries: Arc<RwLock<HashMap<QueryKey, CacheEntry>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed data snapshot, regardless of staleness.
    pub fn get<T: DeserializeOwned + 'static>(&self, key: &QueryKey) -> Option<T> {
        self.entries.read().get(key).and_then(CacheEntry::data_as)
    }

    /// Write data directly: clears the error, stamps the entry fresh.
    pub fn set<T: Serialize + 'static>(&self, key: &QueryKey, value: &T) -> Result<(), QueryError> {
        let data = SerializedData::encode(value)?;
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_default();
        entry.data = Some(data);
        entry.error = None;
        entry.updated_at = Some(Instant::now());
        entry.invalidated = false;
        Ok(())
    }

    /// Write data stamped with an explicit fetch time, used when seeding
    /// initial data that was obtained earlier.
    pub fn set_with_updated_at<T: Serialize + 'static>(
        &self,
        key: &QueryKey,
        value: &T,
        updated_at: Instant,
    ) -> Result<(), QueryError> {
        let data = SerializedData::encode(value)?;
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_default();
        entry.data = Some(data);
        entry.error = None;
        entry.updated_at = Some(updated_at);
        entry.invalidated = false;
        Ok(())
    }

    /// Raw entry snapshot.
    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn remove(&self, key: &QueryKey) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Mark an entry stale without touching its data. Creates the entry when
    /// absent so a later fetch sees it as invalidated.
    pub fn mark_invalidated(&self, key: &QueryKey) {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_default();
        entry.invalidated = true;
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_fetching())
            .count()
    }

    /// Fetch with per-key coalescing.
    ///
    /// Fresh cached data of the right type is returned directly. An in-flight
    /// fetch is joined. Otherwise a new singleton fetch is installed; its
    /// result is written back (success stamps the entry, cancellation leaves
    /// it untouched, any other error is stored) and handed to every waiter.
    pub async fn fetch_coalesced<T, F>(
        &self,
        key: &QueryKey,
        fetch_fn: F,
        stale_time: Duration,
        signal: CancelToken,
    ) -> Result<T, QueryError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(CancelToken) -> BoxFuture<'static, Result<T, QueryError>>,
    {
        let mut fetch_fn = Some(fetch_fn);
        loop {
            let (shared, joined) = {
                let mut entries = self.entries.write();
                let entry = entries.entry(key.clone()).or_default();

                if entry.error.is_none() && !entry.is_stale(stale_time) {
                    if let Some(data) = &entry.data {
                        if data.is::<T>() {
                            trace!(%key, "cache hit");
                            return data.decode::<T>();
                        }
                    }
                }

                match &entry.in_flight {
                    Some(in_flight) => (in_flight.clone(), true),
                    None => {
                        let fetch_fn = match fetch_fn.take() {
                            Some(f) => f,
                            // A joined fetch was cancelled by its owner and a
                            // second install is not possible without the
                            // consumed closure; surface the cancellation.
                            None => return Err(QueryError::Cancelled),
                        };
                        let shared = self.install_fetch(entry, key, fetch_fn, signal.clone());
                        (shared, false)
                    }
                }
            };

            let result = shared.await;
            match result {
                Ok(data) => return data.decode::<T>(),
                // The joined fetch was cancelled by whoever owned it; if this
                // caller is still live, retry with a fresh install.
                Err(QueryError::Cancelled) if joined && !signal.is_cancelled() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn install_fetch<T, F>(
        &self,
        entry: &mut CacheEntry,
        key: &QueryKey,
        fetch_fn: F,
        signal: CancelToken,
    ) -> SharedFetch
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(CancelToken) -> BoxFuture<'static, Result<T, QueryError>>,
    {
        let (tx, rx) = oneshot::channel::<Result<SerializedData, QueryError>>();
        let shared: SharedFetch = rx
            .map(|received| received.unwrap_or(Err(QueryError::Cancelled)))
            .boxed()
            .shared();
        entry.in_flight = Some(shared.clone());

        let fetch = fetch_fn(signal.clone());
        let cache = self.clone();
        let key = key.clone();
        debug!(%key, "fetch installed");

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = signal.cancelled() => Err(QueryError::Cancelled),
                outcome = fetch => {
                    outcome.and_then(|value| SerializedData::encode(&value))
                }
            };

            {
                let mut entries = cache.entries.write();
                let entry = entries.entry(key.clone()).or_default();
                match &result {
                    Ok(data) => {
                        entry.data = Some(data.clone());
                        entry.error = None;
                        entry.updated_at = Some(Instant::now());
                        entry.invalidated = false;
                        debug!(%key, "fetch succeeded");
                    }
                    // Cancellation is never persisted
                    Err(err) if err.is_cancelled() => {
                        debug!(%key, "fetch cancelled");
                    }
                    Err(err) => {
                        entry.error = Some(err.clone());
                        debug!(%key, error = %err, "fetch failed");
                    }
                }
                entry.in_flight = None;
            }

            let _ = tx.send(result);
        });

        shared
    }
}
