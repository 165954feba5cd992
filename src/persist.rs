//! Pure (de)hydration transforms between a [`CacheEntry`] and its wire
//! representation, plus the storage-backend seam ([`Persister`]).
//!
//! Concrete backends (localStorage, IndexedDB, disk) are out of scope
//! (spec.md §1) — this module only defines the trait and the transform a
//! backend would serialize.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;
use crate::instant::Instant;
use crate::storage::entry::{CacheEntry, FetchDirection};

/// The serializable form of one persisted entry. Only successfully-loaded
/// entries are worth persisting — pending/errored entries carry nothing a
/// restored session could use (teacher: only `QueryState::Loaded` converts
/// to `PersistQueryData`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DehydratedEntry {
    pub key: Value,
    pub data: Value,
    pub timestamp_millis: Option<u64>,
    pub stale_time_millis: u64,
    pub cache_time_millis: u64,
    pub tags: Vec<String>,
}

/// Converts a loaded entry to its wire form. Returns `None` for an entry
/// with no data yet (pending or never successfully fetched).
pub fn dehydrate<V: Serialize>(entry: &CacheEntry<V>) -> Option<DehydratedEntry> {
    let data = entry.data.as_ref()?;
    Some(DehydratedEntry {
        key: entry.key.clone(),
        data: serde_json::to_value(data).ok()?,
        timestamp_millis: entry.timestamp.map(|t| t.as_millis()),
        stale_time_millis: entry.stale_time.as_millis() as u64,
        cache_time_millis: entry.cache_time.as_millis() as u64,
        tags: entry.tags.iter().cloned().collect(),
    })
}

/// Rebuilds a loaded [`CacheEntry`] from its wire form (used by `restore`).
pub fn hydrate<V: DeserializeOwned>(dehydrated: &DehydratedEntry) -> Result<CacheEntry<V>, QueryError> {
    let data: V = serde_json::from_value(dehydrated.data.clone()).map_err(QueryError::validation)?;
    let mut entry = CacheEntry::new(
        dehydrated.key.clone(),
        Duration::from_millis(dehydrated.stale_time_millis),
        Duration::from_millis(dehydrated.cache_time_millis),
    );
    entry.tags = dehydrated.tags.iter().cloned().collect();
    entry.commit_success(data, FetchDirection::Initial);
    if let Some(ms) = dehydrated.timestamp_millis {
        entry.timestamp = Some(Instant::from_millis(ms));
    }
    Ok(entry)
}

/// A client-side persistence backend, keyed by hashed query identifier.
#[async_trait(?Send)]
pub trait Persister {
    async fn persist_client(&self, hash: &str, entry: DehydratedEntry);
    async fn restore_client(&self, hash: &str) -> Option<DehydratedEntry>;
    async fn remove_client(&self, hash: &str);
}
