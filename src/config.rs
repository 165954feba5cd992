//! Process-wide defaults for a [`crate::client::QueryClient`].

use std::time::Duration;

use crate::executor::{Retry, RetryDelay};

const DEFAULT_STALE_TIME: Duration = Duration::from_secs(10);
const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_CACHE_SIZE: usize = 10_000;

/// Defaults applied when a call site doesn't override them.
///
/// Mirrors the teacher's `DefaultQueryOptions`, generalized with the retry
/// and max-cache-size knobs the distilled spec adds (the teacher has no
/// eviction cap — every query lives until GC'd).
#[derive(Clone)]
pub struct ClientConfig {
    pub default_stale_time: Duration,
    pub default_cache_time: Duration,
    pub default_retry: Retry,
    pub default_retry_delay: RetryDelay,
    pub max_cache_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            default_stale_time: DEFAULT_STALE_TIME,
            default_cache_time: DEFAULT_CACHE_TIME,
            default_retry: Retry::default(),
            default_retry_delay: RetryDelay::default(),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}
