//! Query Client: the facade every call site (observers, mutations, hydration
//! glue) goes through. Owns the storage map, the remote executor, the
//! registered plugins, and the process-wide configuration.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{QueryError, QueryErrorKind};
use crate::executor::{self, RemoteExecutor, Retry, RetryDelay};
use crate::focus::{FocusSignal, OnlineSignal};
use crate::key::{self, HashError, QueryKey};
use crate::mutation::MutationCache;
use crate::plugin::Plugin;
use crate::schema::SchemaValidator;
use crate::signal::Signal;
use crate::storage::entry::{CacheEntry, FetchDirection};
use crate::storage::Storage;

/// A transport call: given a cancellation token, resolves to the query's
/// typed value or a classified [`QueryError`].
pub type QueryFn<V> = Rc<dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = Result<V, QueryError>>>>>;

pub struct QueryFetchOptions<V> {
    pub fetch_direction: FetchDirection,
    pub cancellation: CancellationToken,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub tags: HashSet<String>,
    pub schema: Option<Rc<dyn SchemaValidator<V>>>,
    /// Overrides the client default when this fetch is the one that
    /// auto-creates the entry (an observer's own `staleTime`/`cacheTime`,
    /// spec.md §4.6).
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
}

impl<V> Default for QueryFetchOptions<V> {
    fn default() -> Self {
        QueryFetchOptions {
            fetch_direction: FetchDirection::Initial,
            cancellation: CancellationToken::new(),
            retry: None,
            retry_delay: None,
            tags: HashSet::new(),
            schema: None,
            stale_time: None,
            cache_time: None,
        }
    }
}

#[derive(Default)]
pub struct SetOptions {
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub tags: HashSet<String>,
}

struct QueryClientInner {
    storage: Storage,
    executor: RemoteExecutor,
    mutations: MutationCache,
    config: ClientConfig,
    plugins: std::cell::RefCell<Vec<Rc<dyn Plugin>>>,
    focus: FocusSignal,
    online: OnlineSignal,
}

/// Cheap to clone (shares one `Rc`-backed set of collaborators).
#[derive(Clone)]
pub struct QueryClient(Rc<QueryClientInner>);

impl QueryClient {
    pub fn new(config: ClientConfig) -> Self {
        let storage = Storage::new(config.max_cache_size);
        QueryClient(Rc::new(QueryClientInner {
            storage,
            executor: RemoteExecutor::new(),
            mutations: MutationCache::new(),
            config,
            plugins: std::cell::RefCell::new(Vec::new()),
            focus: FocusSignal::new(),
            online: OnlineSignal::new(),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.0.config
    }

    /// The Remote Executor backing this client's fetches — used directly by
    /// [`crate::infinite::InfiniteObserver`], which dedupes per-page rather
    /// than per-query-key.
    pub fn executor(&self) -> &RemoteExecutor {
        &self.0.executor
    }

    /// The Mutation Cache backing every [`crate::mutation::MutationObserver`]
    /// created against this client, per spec.md §4.8.
    pub fn mutation_cache(&self) -> &MutationCache {
        &self.0.mutations
    }

    /// Driven by a platform-integration crate on window-focus regain.
    pub fn focus_signal(&self) -> &FocusSignal {
        &self.0.focus
    }

    /// Driven by a platform-integration crate when the transport becomes
    /// reachable again.
    pub fn online_signal(&self) -> &OnlineSignal {
        &self.0.online
    }

    /// Registers a plugin. Hooks fire in registration order.
    pub fn use_plugin(&self, plugin: impl Plugin + 'static) {
        self.0.plugins.borrow_mut().push(Rc::new(plugin));
    }

    /// Auto-creating signal for `key`, per spec.md §4.5 `getSignal`, using
    /// the client's configured defaults for `staleTime`/`cacheTime`.
    pub fn get_signal<K, V>(&self, key: &K) -> Result<Signal<CacheEntry<V>>, HashError>
    where
        K: QueryKey,
        V: Clone + serde::Serialize + 'static,
    {
        self.get_signal_with(key, None, None)
    }

    /// Auto-creating signal for `key`, with an observer's own
    /// `staleTime`/`cacheTime` overriding the client defaults when an
    /// entry doesn't exist yet (spec.md §4.6 — `QueryObserverOptions`
    /// carries both per query).
    pub fn get_signal_with<K, V>(
        &self,
        key: &K,
        stale_time: Option<Duration>,
        cache_time: Option<Duration>,
    ) -> Result<Signal<CacheEntry<V>>, HashError>
    where
        K: QueryKey,
        V: Clone + serde::Serialize + 'static,
    {
        let hash = key::hashed_key(key)?;
        let normalized_key = key::normalize(key.to_value());
        Ok(self
            .0
            .storage
            .get_or_create::<V>(
                &hash,
                normalized_key,
                stale_time.unwrap_or(self.0.config.default_stale_time),
                cache_time.unwrap_or(self.0.config.default_cache_time),
                true,
            )
            .expect("auto_create is true"))
    }

    pub fn get<K, V>(&self, key: &K) -> Result<Option<V>, HashError>
    where
        K: QueryKey,
        V: Clone + serde::Serialize + 'static,
    {
        let hash = key::hashed_key(key)?;
        Ok(self
            .0
            .storage
            .get_or_create::<V>(&hash, Value::Null, Duration::ZERO, Duration::ZERO, false)
            .and_then(|signal| signal.with(|e| e.data.clone())))
    }

    pub fn set<K, V>(&self, key: &K, data: V, options: SetOptions) -> Result<(), HashError>
    where
        K: QueryKey,
        V: Clone + serde::Serialize + 'static,
    {
        let hash = key::hashed_key(key)?;
        let normalized_key = key::normalize(key.to_value());
        let stale_time = options.stale_time.unwrap_or(self.0.config.default_stale_time);
        let cache_time = options.cache_time.unwrap_or(self.0.config.default_cache_time);

        let data_value = serde_json::to_value(&data).unwrap_or(Value::Null);
        let mut entry = CacheEntry::new(normalized_key.clone(), stale_time, cache_time);
        entry.tags = options.tags;
        entry.commit_success(data, FetchDirection::Initial);
        self.0.storage.set(&hash, entry);
        self.notify_query_updated(normalized_key, data_value);
        Ok(())
    }

    /// Writes a fully-specified entry verbatim — used by hydration glue that
    /// already reconstructed a [`CacheEntry`] via [`crate::persist::hydrate`].
    pub fn restore<V>(&self, hash: &str, entry: CacheEntry<V>)
    where
        V: Clone + serde::Serialize + 'static,
    {
        let key = entry.key.clone();
        let data_value = entry
            .data
            .as_ref()
            .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        self.0.storage.set(hash, entry);
        self.notify_query_updated(key, data_value);
    }

    pub fn has(&self, hash: &str) -> bool {
        self.0.storage.has(hash)
    }

    /// Whether the entry named by `hash` is stale. A hash with no entry is
    /// treated as stale (there's nothing fresh to show).
    pub fn is_stale<V: Clone + serde::Serialize + 'static>(&self, hash: &str) -> bool {
        self.0
            .storage
            .get_or_create::<V>(hash, Value::Null, Duration::ZERO, Duration::ZERO, false)
            .map(|signal| signal.with(|e| e.is_stale()))
            .unwrap_or(true)
    }

    pub fn remove(&self, hash: &str) -> bool {
        self.0.storage.delete(hash)
    }

    pub fn clear(&self) {
        for hash in self.0.storage.get_all_keys() {
            self.0.storage.delete(&hash);
        }
    }

    pub fn snapshot(&self) -> std::collections::HashMap<Rc<str>, Rc<dyn crate::storage::AnyQuery>> {
        self.0.storage.get_snapshot()
    }

    /// Pure transform from the live cache to its wire form, per spec.md §6:
    /// enumerates the snapshot and emits only the entries whose data is
    /// defined (pending/errored entries carry nothing a restored session
    /// could use).
    pub fn dehydrate(&self) -> std::collections::HashMap<Rc<str>, crate::persist::DehydratedEntry> {
        self.snapshot()
            .into_iter()
            .filter_map(|(hash, query)| query.dehydrate().map(|entry| (hash, entry)))
            .collect()
    }

    /// Orchestrates a single fetch: transitional commit, plugin fan-out,
    /// delegation to the Remote Executor, schema validation, and final
    /// commit, per spec.md §4.5.
    pub async fn fetch<K, V>(&self, key: &K, f: QueryFn<V>, options: QueryFetchOptions<V>) -> Result<V, QueryError>
    where
        K: QueryKey,
        V: Clone + serde::Serialize + 'static,
    {
        let hash = key::hashed_key(key).map_err(|e| QueryError::new(QueryErrorKind::Unknown).with_cause(e))?;
        let normalized_key = key::normalize(key.to_value());

        let stale_time = options.stale_time.unwrap_or(self.0.config.default_stale_time);
        let cache_time = options.cache_time.unwrap_or(self.0.config.default_cache_time);

        let signal = self
            .0
            .storage
            .get_or_create::<V>(&hash, normalized_key.clone(), stale_time, cache_time, true)
            .expect("auto_create is true");

        signal.update(|e| e.commit_fetch_start(options.fetch_direction, options.tags.clone()));
        self.notify_fetch_start(normalized_key.clone()).await;

        let exec_options = executor::FetchOptions {
            retry: options.retry.unwrap_or(self.0.config.default_retry),
            retry_delay: options.retry_delay.unwrap_or_else(|| self.0.config.default_retry_delay.clone()),
        };

        let result = self
            .0
            .executor
            .fetch(&hash, move |token| f(token), exec_options, options.cancellation.clone())
            .await;

        match result {
            Ok(value) => {
                let validated = match &options.schema {
                    Some(validator) => serde_json::to_value(&value)
                        .map_err(|e| QueryError::new(QueryErrorKind::ParseError).with_cause(e))
                        .and_then(|raw| validator.parse(raw)),
                    None => Ok(value),
                };
                match validated {
                    Ok(value) => {
                        let data_value = serde_json::to_value(&value).unwrap_or(Value::Null);
                        signal.update({
                            let value = value.clone();
                            move |e| e.commit_success(value, options.fetch_direction)
                        });
                        self.notify_fetch_success(normalized_key.clone(), data_value.clone()).await;
                        self.notify_query_updated(normalized_key, data_value);
                        Ok(value)
                    }
                    Err(error) => {
                        signal.update({
                            let error = error.clone();
                            move |e| e.commit_validation_error(error)
                        });
                        self.notify_fetch_error(normalized_key.clone(), error.clone()).await;
                        self.notify_query_updated(normalized_key, Value::Null);
                        Err(error)
                    }
                }
            }
            Err(error) => {
                if !error.is_cancelled() {
                    signal.update({
                        let error = error.clone();
                        move |e| e.commit_error(error)
                    });
                    self.notify_fetch_error(normalized_key.clone(), error.clone()).await;
                    let data_value = signal
                        .with(|e| e.data.clone())
                        .map(|d| serde_json::to_value(&d).unwrap_or(Value::Null))
                        .unwrap_or(Value::Null);
                    self.notify_query_updated(normalized_key, data_value);
                }
                Err(error)
            }
        }
    }

    /// Prefix-invalidates every entry whose identifier starts with `key`
    /// (trie lookup, never a string-prefix heuristic — spec.md §4.5).
    pub fn invalidate<K: QueryKey>(&self, key: &K) {
        let normalized = key::normalize(key.to_value());
        let parts = match &normalized {
            Value::Array(parts) => parts.clone(),
            other => vec![other.clone()],
        };
        let matched = self.0.storage.matching_keys(&parts);
        tracing::debug!(count = matched.len(), key = ?normalized, "invalidating queries by prefix");
        for hash in matched {
            self.mark_invalidated(&hash);
        }
        self.notify_invalidate(normalized);
    }

    pub fn invalidate_tags(&self, tags: impl IntoIterator<Item = impl AsRef<str>>) {
        for tag in tags {
            for hash in self.0.storage.keys_by_tag(tag.as_ref()) {
                self.mark_invalidated(&hash);
            }
        }
    }

    pub fn invalidate_all(&self) {
        for hash in self.0.storage.get_all_keys() {
            self.mark_invalidated(&hash);
        }
    }

    fn mark_invalidated(&self, hash: &str) {
        if let Some(slot) = self.0.storage.get_snapshot().get(hash) {
            slot.mark_invalidated();
        }
    }

    async fn notify_fetch_start(&self, key: Value) {
        let plugins = self.0.plugins.borrow().clone();
        for plugin in plugins {
            plugin.on_fetch_start(&key).await;
        }
    }

    async fn notify_fetch_success(&self, key: Value, data: Value) {
        let plugins = self.0.plugins.borrow().clone();
        for plugin in plugins {
            plugin.on_fetch_success(&key, &data).await;
        }
    }

    async fn notify_fetch_error(&self, key: Value, error: QueryError) {
        let plugins = self.0.plugins.borrow().clone();
        for plugin in plugins {
            plugin.on_fetch_error(&key, &error).await;
        }
    }

    fn notify_invalidate(&self, key: Value) {
        let plugins = self.0.plugins.borrow().clone();
        tokio::task::spawn_local(async move {
            for plugin in plugins {
                plugin.on_invalidate(&key).await;
            }
        });
    }

    fn notify_query_updated(&self, key: Value, data: Value) {
        let plugins = self.0.plugins.borrow().clone();
        tokio::task::spawn_local(async move {
            for plugin in plugins {
                plugin.on_query_updated(&key, &data).await;
            }
        });
    }
}
