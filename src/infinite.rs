//! Infinite Observer: a paginated variant of the Query Observer whose cache
//! entry stores accumulated pages instead of a single value.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{QueryError, QueryErrorKind};
use crate::executor::{self, Retry, RetryDelay};
use crate::key::{self, QueryKey};
use crate::signal::Signal;
use crate::storage::entry::{CacheEntry, FetchDirection};
use crate::client::QueryClient;

/// The accumulated payload an infinite query caches — every page fetched so
/// far together with the parameter that produced each one.
#[derive(Debug, Clone, Serialize)]
pub struct Pages<V> {
    pub pages: Vec<V>,
    pub page_params: Vec<Value>,
}

impl<V> Default for Pages<V> {
    fn default() -> Self {
        Pages {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

pub type InfiniteQueryFn<V> =
    Rc<dyn Fn(Value, CancellationToken) -> Pin<Box<dyn Future<Output = Result<V, QueryError>>>>>;
pub type PageParamFn<V> = Rc<dyn Fn(&V, &[V]) -> Option<Value>>;

#[derive(Clone)]
pub struct InfiniteObserverOptions<K, V> {
    pub query_key: K,
    pub query_fn: InfiniteQueryFn<V>,
    pub initial_page_param: Value,
    pub get_next_page_param: PageParamFn<V>,
    pub get_previous_page_param: Option<PageParamFn<V>>,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub tags: HashSet<String>,
}

impl<K, V> InfiniteObserverOptions<K, V> {
    pub fn new(query_key: K, query_fn: InfiniteQueryFn<V>, get_next_page_param: PageParamFn<V>) -> Self {
        InfiniteObserverOptions {
            query_key,
            query_fn,
            initial_page_param: Value::Null,
            get_next_page_param,
            get_previous_page_param: None,
            stale_time: None,
            cache_time: None,
            retry: None,
            retry_delay: None,
            tags: HashSet::new(),
        }
    }
}

/// Pagination-aware counterpart to [`crate::observer::QueryObserver`].
/// `V` is a single page's payload — the entry itself caches `Pages<V>`, per
/// spec.md §4.7 ("a variant whose cache entry stores `{pages, pageParams}`").
pub struct InfiniteObserver<K, V> {
    client: QueryClient,
    options: RefCell<InfiniteObserverOptions<K, V>>,
    pub signal: Signal<CacheEntry<Pages<V>>>,
    cancellation: RefCell<CancellationToken>,
}

impl<K, V> InfiniteObserver<K, V>
where
    K: QueryKey + 'static,
    V: Clone + Serialize + 'static,
{
    pub fn new(client: QueryClient, options: InfiniteObserverOptions<K, V>) -> Rc<Self> {
        let signal = client
            .get_signal_with::<K, Pages<V>>(&options.query_key, options.stale_time, options.cache_time)
            .expect("query key must hash");
        Rc::new(InfiniteObserver {
            client,
            options: RefCell::new(options),
            signal,
            cancellation: RefCell::new(CancellationToken::new()),
        })
    }

    pub fn get(&self) -> CacheEntry<Pages<V>> {
        self.signal.get()
    }

    pub fn has_next_page(&self) -> bool {
        let options = self.options.borrow();
        self.signal.with(|e| match &e.data {
            None => true,
            Some(pages) if pages.pages.is_empty() => true,
            Some(pages) => (options.get_next_page_param)(pages.pages.last().unwrap(), &pages.pages).is_some(),
        })
    }

    pub fn has_previous_page(&self) -> bool {
        let options = self.options.borrow();
        self.signal.with(|e| match &e.data {
            Some(pages) if !pages.pages.is_empty() => match &options.get_previous_page_param {
                Some(f) => f(pages.pages.first().unwrap(), &pages.pages).is_some(),
                None => false,
            },
            _ => false,
        })
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.signal.with(|e| e.is_fetching && e.fetch_direction == FetchDirection::Next)
    }

    pub fn is_fetching_previous_page(&self) -> bool {
        self.signal.with(|e| e.is_fetching && e.fetch_direction == FetchDirection::Previous)
    }

    pub async fn fetch_next_page(self: &Rc<Self>) -> Result<(), QueryError> {
        let param = {
            let data = self.signal.with(|e| e.data.clone());
            let options = self.options.borrow();
            match data {
                None => options.initial_page_param.clone(),
                Some(pages) if pages.pages.is_empty() => options.initial_page_param.clone(),
                Some(pages) => match (options.get_next_page_param)(pages.pages.last().unwrap(), &pages.pages) {
                    Some(p) => p,
                    None => return Ok(()),
                },
            }
        };
        self.fetch_page(param, FetchDirection::Next).await
    }

    pub async fn fetch_previous_page(self: &Rc<Self>) -> Result<(), QueryError> {
        let param = {
            let data = self.signal.with(|e| e.data.clone());
            match data {
                Some(pages) if !pages.pages.is_empty() => {
                    let options = self.options.borrow();
                    let f = options
                        .get_previous_page_param
                        .as_ref()
                        .ok_or_else(|| QueryError::new(QueryErrorKind::Unknown))?;
                    match f(pages.pages.first().unwrap(), &pages.pages) {
                        Some(p) => p,
                        None => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        };
        self.fetch_page(param, FetchDirection::Previous).await
    }

    /// Invalidates, then replays every page param fetched so far in order
    /// (spec.md §4.7 "explicit refetch replays all page params").
    pub async fn refetch(self: &Rc<Self>) -> Result<(), QueryError> {
        let key = self.options.borrow().query_key.clone();
        self.client.invalidate(&key);

        let params = self.signal.with(|e| e.data.as_ref().map(|p| p.page_params.clone()).unwrap_or_default());
        if params.is_empty() {
            return self.fetch_next_page().await;
        }
        self.signal.update(|e| e.data = None);
        for (i, param) in params.into_iter().enumerate() {
            let direction = if i == 0 { FetchDirection::Initial } else { FetchDirection::Next };
            self.fetch_page(param, direction).await?;
        }
        Ok(())
    }

    /// Re-fetches only the first page and merges it in place, leaving every
    /// other page untouched (spec.md §4.7 "background refetch re-fetches
    /// only the first page").
    pub async fn background_refetch_first_page(self: &Rc<Self>) -> Result<(), QueryError> {
        let Some(param) = self.signal.with(|e| e.data.as_ref().and_then(|p| p.page_params.first().cloned())) else {
            return Ok(());
        };

        let page = self.run_fetch(param, FetchDirection::Initial).await?;
        self.signal.update(|e| {
            if let Some(pages) = e.data.as_mut() {
                if let Some(first) = pages.pages.first_mut() {
                    *first = page;
                }
            }
        });
        Ok(())
    }

    async fn fetch_page(self: &Rc<Self>, param: Value, direction: FetchDirection) -> Result<(), QueryError> {
        let tags = self.options.borrow().tags.clone();
        self.signal.update(|e| e.commit_fetch_start(direction, tags));

        match self.run_fetch(param.clone(), direction).await {
            Ok(page) => {
                self.signal.update(|e| {
                    let mut pages = e.data.take().unwrap_or_default();
                    match direction {
                        FetchDirection::Previous => {
                            pages.pages.insert(0, page);
                            pages.page_params.insert(0, param);
                        }
                        _ => {
                            pages.pages.push(page);
                            pages.page_params.push(param);
                        }
                    }
                    e.commit_success(pages, direction);
                });
                Ok(())
            }
            Err(error) => {
                if !error.is_cancelled() {
                    self.signal.update(|e| e.commit_error(error.clone()));
                }
                Err(error)
            }
        }
    }

    async fn run_fetch(self: &Rc<Self>, param: Value, _direction: FetchDirection) -> Result<V, QueryError> {
        self.cancellation.borrow().cancel();
        let cancellation = CancellationToken::new();
        *self.cancellation.borrow_mut() = cancellation.clone();

        let options = self.options.borrow().clone();
        let base_hash = key::hashed_key(&options.query_key).map_err(|e| QueryError::new(QueryErrorKind::Unknown).with_cause(e))?;
        let page_hash = key::hash(&param).map_err(|e| QueryError::new(QueryErrorKind::Unknown).with_cause(e))?;
        let exec_hash = format!("{base_hash}#page:{page_hash}");

        let query_fn = options.query_fn.clone();
        self.client
            .executor()
            .fetch(
                &exec_hash,
                move |token| query_fn(param.clone(), token),
                executor::FetchOptions {
                    retry: options.retry.unwrap_or(self.client.config().default_retry),
                    retry_delay: options
                        .retry_delay
                        .unwrap_or_else(|| self.client.config().default_retry_delay.clone()),
                },
                cancellation,
            )
            .await
    }
}
