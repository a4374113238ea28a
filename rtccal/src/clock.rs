//! Host time source.
//!
//! Calibration compares device ticks against host wall-clock time, so every
//! timestamp, deadline and sleep in the protocol layer goes through the
//! [`Clock`] trait. [`SystemClock`] is the real thing; tests substitute a
//! virtual clock driven by a simulated device.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

/// Source of wall-clock and monotonic time.
pub trait Clock {
    /// Current local wall-clock time.
    fn now(&self) -> DateTime<Local>;

    /// Monotonic time elapsed since the clock was created.
    ///
    /// Used for deadlines and spin guards, never for reported timestamps.
    fn elapsed(&self) -> Duration;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// One iteration of a busy-wait.
    fn spin(&self) {
        std::hint::spin_loop();
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Local> {
        (**self).now()
    }

    fn elapsed(&self) -> Duration {
        (**self).elapsed()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }

    fn spin(&self) {
        (**self).spin();
    }
}

/// The operating system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose monotonic origin is now.
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
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
