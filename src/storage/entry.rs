use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;

use crate::error::QueryError;
use crate::instant::Instant;

/// Status of a cache entry, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Success,
    Error,
}

/// Pagination context for the current (or most recent) fetch against an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchDirection {
    Initial,
    Next,
    Previous,
    #[default]
    Idle,
}

/// The cached state for a single hashed key.
///
/// `V` is the payload type for this particular query; the storage layer
/// type-erases over `V` (see `storage::AnyQuery`) so one `QueryClient` can
/// host many distinct `V`s, but an individual `CacheEntry` is always
/// strongly typed.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub data: Option<V>,
    pub status: Status,
    pub error: Option<QueryError>,
    pub is_fetching: bool,
    pub fetch_direction: FetchDirection,
    pub timestamp: Option<Instant>,
    pub stale_time: Duration,
    pub cache_time: Duration,
    /// The original (normalized) query identifier, kept for enumeration.
    pub key: Value,
    pub tags: HashSet<String>,
    pub is_invalidated: bool,
}

impl<V> CacheEntry<V> {
    pub fn new(key: Value, stale_time: Duration, cache_time: Duration) -> Self {
        CacheEntry {
            data: None,
            status: Status::Pending,
            error: None,
            is_fetching: false,
            fetch_direction: FetchDirection::Idle,
            timestamp: None,
            stale_time,
            cache_time,
            key,
            tags: HashSet::new(),
            is_invalidated: false,
        }
    }

    /// `isStale ⇔ isInvalidated ∨ (now − timestamp) > staleTime`, per spec.md §8.4.
    /// An entry with no timestamp yet (never successfully loaded) is always stale.
    pub fn is_stale(&self) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.timestamp {
            None => true,
            Some(ts) => ts.elapsed() > self.stale_time,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.data.is_none()
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, Status::Error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, Status::Success)
    }

    /// Commits a successful fetch. Clears any prior invalidation and error.
    pub fn commit_success(&mut self, data: V, direction: FetchDirection) {
        self.data = Some(data);
        self.status = Status::Success;
        self.error = None;
        self.is_fetching = false;
        self.fetch_direction = direction;
        self.timestamp = Some(Instant::now());
        self.is_invalidated = false;
    }

    /// Commits a failed fetch. The last good `data` is preserved.
    pub fn commit_error(&mut self, error: QueryError) {
        self.status = Status::Error;
        self.error = Some(error);
        self.is_fetching = false;
    }

    /// Commits a schema-validation failure on an otherwise-successful
    /// transport response: unlike a transport error, the previously-good
    /// `data` is discarded rather than preserved, since the transport did
    /// return a value — it just wasn't the shape the caller declared
    /// (spec.md §7 "Validation failure after a successful transport
    /// response is committed with `status=error, data=undefined, error=…`").
    pub fn commit_validation_error(&mut self, error: QueryError) {
        self.data = None;
        self.status = Status::Error;
        self.error = Some(error);
        self.is_fetching = false;
    }

    /// Commits the transitional "fetch started" state, preserving existing data.
    pub fn commit_fetch_start(&mut self, direction: FetchDirection, tags: impl IntoIterator<Item = String>) {
        self.is_fetching = true;
        self.error = None;
        self.fetch_direction = direction;
        self.tags.extend(tags);
    }

    pub fn mark_invalidated(&mut self) {
        self.is_invalidated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(stale_time: Duration) -> CacheEntry<i32> {
        CacheEntry::new(json!(["k"]), stale_time, Duration::from_secs(60))
    }

    #[test]
    fn no_timestamp_is_always_stale() {
        let e = entry(Duration::from_secs(10));
        assert!(e.is_stale());
    }

    #[test]
    fn fresh_commit_is_not_stale() {
        let mut e = entry(Duration::from_secs(10));
        e.commit_success(1, FetchDirection::Initial);
        assert!(!e.is_stale());
    }

    #[test]
    fn successful_commit_clears_invalidation() {
        let mut e = entry(Duration::from_secs(10));
        e.mark_invalidated();
        e.commit_success(1, FetchDirection::Initial);
        assert!(!e.is_invalidated);
        assert!(!e.is_stale());
    }

    #[test]
    fn invalidation_forces_stale_regardless_of_age() {
        let mut e = entry(Duration::from_secs(3600));
        e.commit_success(1, FetchDirection::Initial);
        assert!(!e.is_stale());
        e.mark_invalidated();
        assert!(e.is_stale());
    }

    #[test]
    fn error_preserves_last_good_data() {
        let mut e = entry(Duration::from_secs(10));
        e.commit_success(42, FetchDirection::Initial);
        e.commit_error(QueryError::new(crate::error::QueryErrorKind::ServerError));
        assert_eq!(e.data, Some(42));
        assert!(e.is_error());
        assert!(!e.is_fetching);
    }
}
