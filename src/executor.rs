//! Remote Executor: per-hash deduplicated async execution with retry,
//! exponential backoff with jitter, and external cancellation.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{FutureExt, Shared};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::instant::Instant;

/// The caller-supplied fetcher, given a token it should observe for
/// cancellation. The Rust analogue of the spec's `fn({signal}) → promise<T>`.
pub type BoxedFetch<V> = Pin<Box<dyn Future<Output = Result<V, QueryError>>>>;
pub type SharedFetch<V> = Shared<BoxedFetch<V>>;

/// How many attempts a fetch is allowed, per spec.md §4.4.
#[derive(Debug, Clone, Copy)]
pub enum Retry {
    Count(u32),
    Disabled,
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Count(3)
    }
}

impl From<bool> for Retry {
    fn from(value: bool) -> Self {
        if value {
            Retry::Count(3)
        } else {
            Retry::Disabled
        }
    }
}

impl From<u32> for Retry {
    fn from(value: u32) -> Self {
        Retry::Count(value)
    }
}

/// The wait between retry attempts.
#[derive(Clone)]
pub enum RetryDelay {
    /// `1000·2^(n−1)` ms, ±25% jitter, capped at 30s.
    Exponential,
    Fixed(Duration),
    Custom(Rc<dyn Fn(u32, &QueryError) -> Duration>),
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential
    }
}

#[derive(Clone, Default)]
pub struct FetchOptions {
    pub retry: Retry,
    pub retry_delay: RetryDelay,
}

fn exponential_backoff(retry_number: u32) -> Duration {
    let base_ms = 1000f64 * 2f64.powi(retry_number as i32 - 1);
    let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
    let ms = (base_ms * (1.0 + jitter)).clamp(0.0, 30_000.0);
    Duration::from_millis(ms as u64)
}

fn backoff_for(retry_number: u32, delay: &RetryDelay, error: &QueryError) -> Duration {
    match delay {
        RetryDelay::Exponential => exponential_backoff(retry_number),
        RetryDelay::Fixed(d) => *d,
        RetryDelay::Custom(f) => f(retry_number, error),
    }
}

async fn run_with_retry<V, F, Fut>(
    f: F,
    options: FetchOptions,
    cancellation: CancellationToken,
) -> Result<V, QueryError>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<V, QueryError>>,
{
    let max_retries = match options.retry {
        Retry::Count(n) => n,
        Retry::Disabled => 0,
    };

    let mut retry_count = 0u32;
    loop {
        if cancellation.is_cancelled() {
            return Err(QueryError::cancelled());
        }

        let child = cancellation.child_token();
        let attempt = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(QueryError::cancelled()),
            result = f(child) => result,
        };

        match attempt {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if !e.kind.retryable() || retry_count >= max_retries => {
                return Err(e.with_retry_count(retry_count));
            }
            Err(e) => {
                retry_count += 1;
                let wait = backoff_for(retry_count, &options.retry_delay, &e);
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(QueryError::cancelled()),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

struct PendingEntry {
    future: Box<dyn Any>,
    inserted_at: Instant,
    generation: u64,
}

struct RemoteExecutorInner {
    pending: RefCell<HashMap<String, PendingEntry>>,
    next_generation: Cell<u64>,
    hygiene_armed: Cell<bool>,
}

/// Deduplicates concurrent fetches for the same hash and retries failed
/// attempts. Cheap to clone (shares one `Rc`-backed dedup map).
#[derive(Clone)]
pub struct RemoteExecutor(Rc<RemoteExecutorInner>);

const RETENTION: Duration = Duration::from_millis(100);
const HYGIENE_INTERVAL: Duration = Duration::from_secs(30);
const HYGIENE_MAX_AGE: Duration = Duration::from_secs(60);

impl RemoteExecutor {
    pub fn new() -> Self {
        RemoteExecutor(Rc::new(RemoteExecutorInner {
            pending: RefCell::new(HashMap::new()),
            next_generation: Cell::new(0),
            hygiene_armed: Cell::new(false),
        }))
    }

    /// Runs (or joins an in-flight run of) the fetch for `hash`.
    ///
    /// If a pending execution already exists for this hash — including one
    /// that resolved within the last [`RETENTION`] window — its shared
    /// future is returned instead of starting a new one.
    pub fn fetch<V, F, Fut>(
        &self,
        hash: &str,
        f: F,
        options: FetchOptions,
        cancellation: CancellationToken,
    ) -> SharedFetch<V>
    where
        V: Clone + 'static,
        F: Fn(CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<V, QueryError>> + 'static,
    {
        if let Some(existing) = self.0.pending.borrow().get(hash) {
            if let Some(shared) = existing.future.downcast_ref::<SharedFetch<V>>() {
                return shared.clone();
            }
            tracing::error!(hash, "payload type mismatch for in-flight hash; starting a fresh execution");
        }

        let boxed: BoxedFetch<V> = Box::pin(run_with_retry(f, options, cancellation));
        let shared: SharedFetch<V> = boxed.shared();

        let generation = self.0.next_generation.get();
        self.0.next_generation.set(generation + 1);
        self.0.pending.borrow_mut().insert(
            hash.to_string(),
            PendingEntry {
                future: Box::new(shared.clone()),
                inserted_at: Instant::now(),
                generation,
            },
        );

        self.arm_retention(hash.to_string(), generation, shared.clone());
        self.ensure_hygiene_sweep();

        shared
    }

    fn arm_retention<V>(&self, hash: String, generation: u64, shared: SharedFetch<V>)
    where
        V: Clone + 'static,
    {
        let weak = Rc::downgrade(&self.0);
        tokio::task::spawn_local(async move {
            let result = shared.await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if result.is_ok() {
                tokio::time::sleep(RETENTION).await;
            }
            let mut pending = inner.pending.borrow_mut();
            if pending.get(&hash).map(|e| e.generation) == Some(generation) {
                pending.remove(&hash);
            }
        });
    }

    fn ensure_hygiene_sweep(&self) {
        if self.0.hygiene_armed.replace(true) {
            return;
        }
        let weak = Rc::downgrade(&self.0);
        tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(HYGIENE_INTERVAL).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner
                    .pending
                    .borrow_mut()
                    .retain(|_, entry| entry.inserted_at.elapsed() < HYGIENE_MAX_AGE);
            }
        });
    }
}

impl Default for RemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}
