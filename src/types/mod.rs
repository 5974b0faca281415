//! Core types and data structures shared across the query system

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::key::QueryKey;

/// Derived query status. Error wins over Success, Success wins over Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    /// No data and no error yet
    Pending,
    /// Data is available
    Success,
    /// The last fetch failed terminally
    Error,
}

/// Whether a query is currently touching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStatus {
    /// Not fetching
    Idle,
    /// A fetch is in flight
    Fetching,
    /// A fetch is suspended waiting for the network to come back
    Paused,
}

/// Mutation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

impl Default for MutationStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// How a query behaves with respect to network connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Pause fetching while offline
    Online,
    /// Always attempt the first fetch, pause between retries while offline
    OfflineFirst,
    /// Ignore connectivity entirely
    Always,
}

impl Default for NetworkMode {
    fn default() -> Self {
        Self::Online
    }
}

/// Direction of an infinite-query page fetch, passed to the query function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchDirection {
    Forward,
    Backward,
}

/// Unique identifier for query observers
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct QueryObserverId(pub uuid::Uuid);

impl QueryObserverId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for QueryObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arbitrary consumer-supplied metadata attached to a query or mutation,
/// surfaced back through the query context.
pub type QueryMeta = serde_json::Map<String, serde_json::Value>;

/// Which queries a filter selects based on observer attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Match regardless of attachment
    All,
    /// Match only entries with at least one attached observer
    Active,
    /// Match only entries with no attached observer
    Inactive,
}

impl Default for QueryKind {
    fn default() -> Self {
        Self::All
    }
}

/// Criteria for selecting cached queries. All present criteria are ANDed.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Key to match; a prefix match unless `exact` is set
    pub query_key: Option<QueryKey>,
    /// Require the full key to equal `query_key` instead of a prefix match
    pub exact: bool,
    /// Restrict by observer attachment
    pub kind: QueryKind,
    /// Restrict by staleness; `None` matches either
    pub stale: Option<bool>,
    /// Restrict by the fetch status of attached observers
    pub fetch_status: Option<FetchStatus>,
    /// Final AND applied to the key
    pub predicate: Option<Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>>,
}

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.query_key = Some(key.into());
        self
    }

    pub fn exact(mut self, key: impl Into<QueryKey>) -> Self {
        self.query_key = Some(key.into());
        self.exact = true;
        self
    }

    pub fn with_kind(mut self, kind: QueryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn with_fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&QueryKey) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Key-level part of the match: prefix/exact plus the custom predicate.
    pub fn matches_key(&self, key: &QueryKey) -> bool {
        if let Some(wanted) = &self.query_key {
            let key_ok = if self.exact {
                key == wanted
            } else {
                key.starts_with(wanted)
            };
            if !key_ok {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(key) {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetch_status", &self.fetch_status)
            .field("predicate", &self.predicate.as_ref().map(|_| "fn"))
            .finish()
    }
}

/// Options controlling `cancel_queries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOptions {
    /// Suppress observer error reporting for the cancellation
    pub silent: bool,
    /// Roll in-flight data back to the pre-fetch snapshot
    pub revert: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            silent: false,
            revert: true,
        }
    }
}
