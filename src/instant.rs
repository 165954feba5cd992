use std::ops::Sub;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant as TokioInstant;

/// Wall-clock instant, expressed as a duration since the Unix epoch.
///
/// A plain `std::time::Instant` can't be serialized (it has no defined
/// epoch), which the hydration format (`persist.rs`) needs, so timestamps
/// are carried as milliseconds-since-epoch throughout the cache.
///
/// `now()`/`elapsed()` are anchored off `tokio::time::Instant` rather than
/// `SystemTime::now()` directly: the rest of the cache's timers (GC, retry
/// backoff) already run on tokio's time driver, and staleness needs to
/// advance the same way under a paused/advanced test clock (`start_paused`,
/// `tokio::time::advance`) or the two clocks drift apart in tests. The epoch
/// offset is captured once per thread and every subsequent `now()` walks
/// forward by the tokio clock's elapsed time from that anchor, so the value
/// stays wall-clock-shaped (serializable, meaningful across a hydration
/// boundary) while still tracking tokio's clock for freshness comparisons.
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instant(pub Duration);

thread_local! {
    static ANCHOR: (TokioInstant, Duration) = {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch");
        (TokioInstant::now(), wall)
    };
}

fn wall_now() -> Duration {
    ANCHOR.with(|(tokio_anchor, wall_anchor)| *wall_anchor + tokio_anchor.elapsed())
}

impl Instant {
    /// The current wall-clock time, tracking tokio's (possibly paused) clock.
    pub fn now() -> Self {
        Instant(wall_now())
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }

    /// Build an `Instant` from milliseconds since the Unix epoch.
    pub fn from_millis(millis: u64) -> Self {
        Instant(Duration::from_millis(millis))
    }

    /// Elapsed time since this instant, saturating at zero if `self` is in the future.
    pub fn elapsed(&self) -> Duration {
        wall_now().saturating_sub(self.0)
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl std::fmt::Display for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_millis())
    }
}

impl std::fmt::Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Instant").field(&self.0.as_millis()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_millis() {
        let now = Instant::now();
        let restored = Instant::from_millis(now.as_millis());
        assert_eq!(now.as_millis(), restored.as_millis());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_tracks_the_paused_tokio_clock() {
        let mark = Instant::now();
        assert_eq!(mark.elapsed(), Duration::ZERO);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(mark.elapsed(), Duration::from_millis(1_500));
    }
}
