//! The runtime's cached millisecond clock.
//!
//! Worker threads refresh the cache once per loop iteration; everything else
//! (coarse timers, deadline arithmetic, rate windows) reads the cached value
//! instead of hitting the OS clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A monotonic millisecond clock with a cached reading.
#[derive(Debug, Clone)]
pub(crate) struct Clock {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    epoch: Instant,
    cached: AtomicU64,
}

impl Clock {
    pub(crate) fn new() -> Clock {
        let epoch = Instant::now();
        Clock {
            inner: Arc::new(Inner {
                epoch,
                cached: AtomicU64::new(0),
            }),
        }
    }

    /// Milliseconds since the clock's epoch, read from the OS.
    pub(crate) fn now(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    /// Refresh the cache from the OS clock and return the new reading.
    pub(crate) fn spak(&self) -> u64 {
        let now = self.now();
        self.inner.cached.store(now, Ordering::Relaxed);
        now
    }

    /// The cached reading; may lag `now()` by up to one loop iteration.
    pub(crate) fn cached(&self) -> u64 {
        self.inner.cached.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::Clock;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn cached_lags_until_spak() {
        let clock = Clock::new();
        assert_eq!(clock.cached(), 0);
        thread::sleep(Duration::from_millis(15));
        assert!(clock.now() >= 15);
        assert_eq!(clock.cached(), 0);
        let refreshed = clock.spak();
        assert!(refreshed >= 15);
        assert_eq!(clock.cached(), refreshed);
    }
}
