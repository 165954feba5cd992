use std::cell::RefCell;
use std::time::Duration;

/// Per-key garbage-collection timer.
///
/// Mirrors the teacher crate's `GarbageCollector` (arm-on-unwatched,
/// cancel-on-watched), but driven by `tokio::time::sleep` + `spawn_local`
/// instead of a DOM/WASM timeout handle, and with a single authoritative
/// `cache_time` per entry rather than a max-across-observers merge — the
/// spec's `CacheEntry` carries one `cacheTime` field, not one per observer.
#[derive(Default)]
pub struct GarbageCollector {
    handle: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        GarbageCollector::default()
    }

    /// Arms a timer for `ttl`; `on_expire` runs once, after which the timer
    /// is considered spent (call `arm` again to rearm).
    pub fn arm(&self, ttl: Duration, on_expire: impl FnOnce() + 'static) {
        self.disable();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(ttl).await;
            on_expire();
        });
        *self.handle.borrow_mut() = Some(handle);
    }

    pub fn disable(&self) {
        if let Some(handle) = self.handle.borrow_mut().take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.borrow().is_some()
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn fires_after_ttl() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let gc = GarbageCollector::new();
                let fired = Rc::new(Cell::new(false));
                let fired_clone = fired.clone();
                gc.arm(Duration::from_secs(10), move || fired_clone.set(true));

                tokio::time::advance(Duration::from_secs(5)).await;
                crate::signal::settle().await;
                assert!(!fired.get());

                tokio::time::advance(Duration::from_secs(6)).await;
                crate::signal::settle().await;
                assert!(fired.get());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn disable_prevents_expiry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let gc = GarbageCollector::new();
                let fired = Rc::new(Cell::new(false));
                let fired_clone = fired.clone();
                gc.arm(Duration::from_secs(10), move || fired_clone.set(true));
                gc.disable();

                tokio::time::advance(Duration::from_secs(20)).await;
                crate::signal::settle().await;
                assert!(!fired.get());
            })
            .await;
    }
}
