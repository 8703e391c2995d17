//! A source of "current time" abstracted behind a trait, so the cache
//! and query-timeout logic can be driven by a fake clock in tests
//! instead of racing real wall-clock time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The real clock, backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Returns an [`Arc<dyn Clock>`] wrapping [`SystemClock`], the default
/// clock for production use.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// A settable clock for tests: `advance`/`set` control what
/// `now_millis` returns, so cache-eviction and timeout scenarios can
/// be driven deterministically instead of depending on real elapsed
/// time.
#[cfg(any(feature = "test-util", test))]
#[derive(Debug, Clone, Default)]
pub struct FakeClock(Arc<AtomicU64>);

#[cfg(any(feature = "test-util", test))]
impl FakeClock {
    pub fn new(start_millis: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_millis)))
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: u64) {
        self.0.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

#[cfg(any(feature = "test-util", test))]
impl Clock for FakeClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
