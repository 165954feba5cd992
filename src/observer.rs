//! Query Observer: binds one caller's declarative options to a shared
//! storage entry and derives a memoized, optionally-projected result view.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{QueryClient, QueryFetchOptions, QueryFn};
use crate::executor::{Retry, RetryDelay};
use crate::focus::FocusListenerKey;
use crate::key::{self, QueryKey};
use crate::schema::SchemaValidator;
use crate::signal::{ListenerKey, Signal};
use crate::storage::entry::{CacheEntry, FetchDirection, Status};

pub struct QueryObserverOptions<K, V, S = V> {
    pub query_key: K,
    pub query_fn: QueryFn<V>,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub enabled: bool,
    pub refetch_on_window_focus: bool,
    pub refetch_on_reconnect: bool,
    pub refetch_interval: Option<Duration>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub schema: Option<Rc<dyn SchemaValidator<V>>>,
    pub select: Rc<dyn Fn(&V) -> S>,
    pub tags: HashSet<String>,
}

impl<K: Clone, V, S> Clone for QueryObserverOptions<K, V, S> {
    fn clone(&self) -> Self {
        QueryObserverOptions {
            query_key: self.query_key.clone(),
            query_fn: self.query_fn.clone(),
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            enabled: self.enabled,
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            refetch_interval: self.refetch_interval,
            retry: self.retry,
            retry_delay: self.retry_delay,
            schema: self.schema.clone(),
            select: self.select.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl<K, V> QueryObserverOptions<K, V, V>
where
    V: Clone,
{
    pub fn new(query_key: K, query_fn: QueryFn<V>) -> Self {
        QueryObserverOptions {
            query_key,
            query_fn,
            stale_time: None,
            cache_time: None,
            enabled: true,
            refetch_on_window_focus: true,
            refetch_on_reconnect: true,
            refetch_interval: None,
            retry: None,
            retry_delay: None,
            schema: None,
            select: Rc::new(|v: &V| v.clone()),
            tags: HashSet::new(),
        }
    }
}

impl<K, V, S> QueryObserverOptions<K, V, S> {
    /// Reprojects the observed value through `select`, changing the result
    /// type the derived view carries (spec.md §4.6 `select`).
    pub fn with_select<S2>(self, select: impl Fn(&V) -> S2 + 'static) -> QueryObserverOptions<K, V, S2> {
        QueryObserverOptions {
            query_key: self.query_key,
            query_fn: self.query_fn,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            enabled: self.enabled,
            refetch_on_window_focus: self.refetch_on_window_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            refetch_interval: self.refetch_interval,
            retry: self.retry,
            retry_delay: self.retry_delay,
            schema: self.schema,
            select: Rc::new(select),
            tags: self.tags,
        }
    }
}

/// A snapshot of the observed query. Compared field-wise (ignoring the
/// error's transport `cause`, which isn't meaningfully comparable) so the
/// owning [`Signal`] can suppress a notification when nothing changed
/// (spec.md §4.6 "snapshots are memoized").
#[derive(Debug, Clone)]
pub struct QueryResult<S> {
    pub data: Option<S>,
    pub status: Status,
    pub error: Option<crate::error::QueryError>,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub is_loading: bool,
    pub is_error: bool,
    pub is_success: bool,
}

impl<S: PartialEq> PartialEq for QueryResult<S> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.status == other.status
            && self.error.as_ref().map(|e| e.kind) == other.error.as_ref().map(|e| e.kind)
            && self.is_fetching == other.is_fetching
            && self.is_stale == other.is_stale
            && self.is_loading == other.is_loading
            && self.is_error == other.is_error
            && self.is_success == other.is_success
    }
}

/// Binds declarative options to the shared signal for `queryKey` and exposes
/// a derived, memoized result. Cheap to clone once wrapped in `Rc` (see
/// [`QueryObserver::new`]) — subscriber count on the result signal drives the
/// attach/detach lifecycle, reusing [`crate::signal::Signal::on_lifecycle`]
/// exactly as `storage::QuerySlot` reuses it for GC arming.
pub struct QueryObserver<K, V, S = V> {
    client: QueryClient,
    options: RefCell<QueryObserverOptions<K, V, S>>,
    hash: RefCell<String>,
    entry_signal: RefCell<Signal<CacheEntry<V>>>,
    entry_listener: Cell<Option<ListenerKey>>,
    pub result: Signal<QueryResult<S>>,
    cancellation: RefCell<CancellationToken>,
    interval_handle: RefCell<Option<tokio::task::JoinHandle<()>>>,
    focus_key: Cell<Option<FocusListenerKey>>,
    online_key: Cell<Option<FocusListenerKey>>,
}

impl<K, V, S> QueryObserver<K, V, S>
where
    K: QueryKey + 'static,
    V: Clone + serde::Serialize + 'static,
    S: Clone + PartialEq + 'static,
{
    pub fn new(client: QueryClient, options: QueryObserverOptions<K, V, S>) -> Rc<Self> {
        let hash = key::hashed_key(&options.query_key).expect("query key must hash");
        let entry_signal = client
            .get_signal_with::<K, V>(&options.query_key, options.stale_time, options.cache_time)
            .expect("query key must hash");
        let initial = entry_signal.with(|e| Self::compute_result(e, &options));

        let observer = Rc::new(QueryObserver {
            client,
            options: RefCell::new(options),
            hash: RefCell::new(hash),
            entry_signal: RefCell::new(entry_signal),
            entry_listener: Cell::new(None),
            result: Signal::new(initial),
            cancellation: RefCell::new(CancellationToken::new()),
            interval_handle: RefCell::new(None),
            focus_key: Cell::new(None),
            online_key: Cell::new(None),
        });

        let on_active = {
            let weak = Rc::downgrade(&observer);
            move || {
                if let Some(observer) = weak.upgrade() {
                    observer.activate();
                }
            }
        };
        let on_inactive = {
            let weak = Rc::downgrade(&observer);
            move || {
                if let Some(observer) = weak.upgrade() {
                    observer.deactivate();
                }
            }
        };
        observer.result.on_lifecycle(on_active, on_inactive);

        observer
    }

    pub fn subscribe(&self, listener: impl Fn(&QueryResult<S>) + 'static) -> ListenerKey {
        self.result.subscribe(listener)
    }

    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.result.unsubscribe(key)
    }

    pub fn get(&self) -> QueryResult<S> {
        self.result.get()
    }

    /// Rebinds to new options. Re-binds to a fresh signal if the hashed key
    /// changed, re-checks on a disabled→enabled transition, and rearms the
    /// refetch interval if it changed (spec.md §4.6 `setOptions`).
    pub fn set_options(self: &Rc<Self>, new_options: QueryObserverOptions<K, V, S>) {
        let new_hash = key::hashed_key(&new_options.query_key).expect("query key must hash");
        let key_changed = new_hash != *self.hash.borrow();
        let enabled_transitioned = !self.options.borrow().enabled && new_options.enabled;
        let interval_changed = self.options.borrow().refetch_interval != new_options.refetch_interval;

        if key_changed {
            if let Some(listener) = self.entry_listener.take() {
                self.entry_signal.borrow().unsubscribe(listener);
            }
            self.cancellation.borrow().cancel();
            let new_signal = self
                .client
                .get_signal_with::<K, V>(&new_options.query_key, new_options.stale_time, new_options.cache_time)
                .expect("query key must hash");
            *self.entry_signal.borrow_mut() = new_signal;
            *self.hash.borrow_mut() = new_hash;
            self.attach_entry_listener();
        }

        *self.options.borrow_mut() = new_options;
        self.recompute();

        if key_changed || enabled_transitioned {
            self.check_and_fetch();
        }
        if interval_changed {
            self.rearm_interval();
        }
    }

    /// Invalidates then fetches unconditionally, regardless of staleness.
    pub fn refetch(self: &Rc<Self>) {
        let key = self.options.borrow().query_key.clone();
        self.client.invalidate(&key);
        self.spawn_fetch(FetchDirection::Initial);
    }

    fn activate(self: &Rc<Self>) {
        self.attach_entry_listener();
        self.register_focus_hook();
        self.register_online_hook();
        self.rearm_interval();
        self.check_and_fetch();
    }

    fn deactivate(self: &Rc<Self>) {
        if let Some(key) = self.entry_listener.take() {
            self.entry_signal.borrow().unsubscribe(key);
        }
        if let Some(key) = self.focus_key.take() {
            self.client.focus_signal().unsubscribe(key);
        }
        if let Some(key) = self.online_key.take() {
            self.client.online_signal().unsubscribe(key);
        }
        if let Some(handle) = self.interval_handle.borrow_mut().take() {
            handle.abort();
        }
        self.cancellation.borrow().cancel();
    }

    fn attach_entry_listener(self: &Rc<Self>) {
        let observer = Rc::clone(self);
        // Takes the entry straight from the listener callback rather than
        // re-borrowing `entry_signal` — the signal is mid-flush (holding its
        // own borrow) while this runs.
        let key = self
            .entry_signal
            .borrow()
            .subscribe(move |entry: &CacheEntry<V>| observer.recompute_from(entry));
        self.entry_listener.set(Some(key));
    }

    fn register_focus_hook(self: &Rc<Self>) {
        if self.options.borrow().refetch_on_window_focus {
            let observer = Rc::clone(self);
            let key = self
                .client
                .focus_signal()
                .subscribe(move || observer.background_refetch_if_stale());
            self.focus_key.set(Some(key));
        }
    }

    fn register_online_hook(self: &Rc<Self>) {
        if self.options.borrow().refetch_on_reconnect {
            let observer = Rc::clone(self);
            let key = self
                .client
                .online_signal()
                .subscribe(move || observer.background_refetch_if_stale());
            self.online_key.set(Some(key));
        }
    }

    fn rearm_interval(self: &Rc<Self>) {
        if let Some(handle) = self.interval_handle.borrow_mut().take() {
            handle.abort();
        }
        if let Some(interval) = self.options.borrow().refetch_interval {
            let observer = Rc::clone(self);
            let handle = tokio::task::spawn_local(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    observer.spawn_fetch(FetchDirection::Initial);
                }
            });
            *self.interval_handle.borrow_mut() = Some(handle);
        }
    }

    fn background_refetch_if_stale(self: &Rc<Self>) {
        let (is_stale, is_fetching) = self.entry_signal.borrow().with(|e| (e.is_stale(), e.is_fetching));
        if is_stale && !is_fetching {
            self.spawn_fetch(FetchDirection::Initial);
        }
    }

    /// `checkAndFetch`: fetches if the entry has never loaded, or is stale,
    /// provided it isn't already fetching or already errored.
    fn check_and_fetch(self: &Rc<Self>) {
        if !self.options.borrow().enabled {
            return;
        }
        let (is_loading, is_stale, is_fetching, is_error) = self
            .entry_signal
            .borrow()
            .with(|e| (e.is_loading(), e.is_stale(), e.is_fetching, e.is_error()));
        if (is_loading || is_stale) && !is_fetching && !is_error {
            self.spawn_fetch(FetchDirection::Initial);
        }
    }

    fn spawn_fetch(self: &Rc<Self>, direction: FetchDirection) {
        self.cancellation.borrow().cancel();
        let cancellation = CancellationToken::new();
        *self.cancellation.borrow_mut() = cancellation.clone();

        let observer = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let options = observer.options.borrow().clone();
            let fetch_options = QueryFetchOptions {
                fetch_direction: direction,
                cancellation,
                retry: options.retry,
                retry_delay: options.retry_delay,
                tags: options.tags.clone(),
                schema: options.schema.clone(),
                stale_time: options.stale_time,
                cache_time: options.cache_time,
            };
            let _ = observer
                .client
                .fetch(&options.query_key, options.query_fn.clone(), fetch_options)
                .await;
        });
    }

    fn recompute(&self) {
        let options = self.options.borrow();
        let result = self.entry_signal.borrow().with(|e| Self::compute_result(e, &options));
        drop(options);
        self.result.set(result);
    }

    fn recompute_from(&self, entry: &CacheEntry<V>) {
        let result = Self::compute_result(entry, &self.options.borrow());
        self.result.set(result);
    }

    fn compute_result(entry: &CacheEntry<V>, options: &QueryObserverOptions<K, V, S>) -> QueryResult<S> {
        QueryResult {
            data: entry.data.as_ref().map(|v| (options.select)(v)),
            status: entry.status,
            error: entry.error.clone(),
            is_fetching: entry.is_fetching,
            is_stale: entry.is_stale(),
            is_loading: entry.is_loading(),
            is_error: entry.is_error(),
            is_success: entry.is_success(),
        }
    }
}
