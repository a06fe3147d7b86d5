//! Monotonic and wall-clock time sources.
//!
//! Runtime windows are tracked in monotonic "elapsed" milliseconds. Wall-clock
//! time is only consulted when translating bounds to and from the persisted
//! document, because the elapsed clock does not survive a reboot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of elapsed and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonically increasing milliseconds since an arbitrary origin.
    fn elapsed_millis(&self) -> u64;

    /// Current wall-clock time.
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Clock backed by [`Instant`] and [`Utc::now`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
///
/// Both readings only move when told to. [`ManualClock::reboot`] resets the
/// elapsed reading while leaving wall-clock time in place, which is how a
/// device restart looks to the registry.
#[derive(Debug)]
pub struct ManualClock {
    elapsed: AtomicU64,
    wall: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock reading `elapsed_millis` and `wall`.
    pub fn new(elapsed_millis: u64, wall: DateTime<Utc>) -> Self {
        Self {
            elapsed: AtomicU64::new(elapsed_millis),
            wall: Mutex::new(wall),
        }
    }

    /// Move both readings forward by `by`.
    pub fn advance(&self, by: Duration) {
        let millis = duration_millis(by);
        self.elapsed.fetch_add(millis, Ordering::SeqCst);
        let step = chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX));
        let mut wall = self.wall.lock();
        *wall = *wall + step;
    }

    /// Reset the elapsed reading, as after a restart.
    pub fn reboot(&self, elapsed_millis: u64) {
        self.elapsed.store(elapsed_millis, Ordering::SeqCst);
    }

    /// Replace the wall-clock reading.
    pub fn set_wall_clock(&self, wall: DateTime<Utc>) {
        *self.wall.lock() = wall;
    }
}

impl Clock for ManualClock {
    fn elapsed_millis(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        *self.wall.lock()
    }
}

/// Saturating conversion of a [`Duration`] to whole milliseconds.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
