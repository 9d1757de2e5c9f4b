//! Node clock: wall-clock epoch seconds plus a monotonic millisecond counter.
//!
//! The node has no RTC, so wall-clock time starts at whatever the host says
//! and the operator can set it. The millisecond counter wraps at `u32::MAX`
//! like a microcontroller tick; compare it with `wrapping_sub`.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch.
    fn epoch_secs(&self) -> u32;

    /// Milliseconds since boot, wrapping.
    fn uptime_millis(&self) -> u32;
}

// ── SystemClock ───────────────────────────────────────────────────────────────

pub struct SystemClock {
    boot: Instant,
    /// Seconds added to host time by `set_epoch`.
    offset: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
            offset: AtomicI64::new(0),
        }
    }

    fn host_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Set the wall clock. Subsequent readings advance from `epoch`.
    pub fn set_epoch(&self, epoch: u32) {
        self.offset
            .store(epoch as i64 - Self::host_secs(), Ordering::Relaxed);
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn epoch_secs(&self) -> u32 {
        let secs = Self::host_secs() + self.offset.load(Ordering::Relaxed);
        secs.clamp(0, u32::MAX as i64) as u32
    }

    fn uptime_millis(&self) -> u32 {
        self.boot.elapsed().as_millis() as u32
    }
}

// ── ManualClock ───────────────────────────────────────────────────────────────

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Default)]
pub struct ManualClock {
    epoch: AtomicU32,
    millis: AtomicU32,
    /// Milliseconds elapsed since the epoch last ticked. Kept apart from
    /// `millis`, which wraps at a non-multiple of 1000.
    sub_second: AtomicU32,
}

impl ManualClock {
    pub fn new(epoch: u32, millis: u32) -> Self {
        Self {
            epoch: AtomicU32::new(epoch),
            millis: AtomicU32::new(millis),
            sub_second: AtomicU32::new(0),
        }
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    /// Advance the millisecond counter (wrapping) and the epoch by whole
    /// seconds elapsed.
    pub fn advance_millis(&self, delta: u32) {
        self.millis.fetch_add(delta, Ordering::Relaxed);
        let mut carried = 0;
        let _ = self
            .sub_second
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |rem| {
                let total = rem as u64 + delta as u64;
                carried = (total / 1000) as u32;
                Some((total % 1000) as u32)
            });
        self.epoch.fetch_add(carried, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn epoch_secs(&self) -> u32 {
        self.epoch.load(Ordering::Relaxed)
    }

    fn uptime_millis(&self) -> u32 {
        self.millis.load(Ordering::Relaxed)
    }
}
