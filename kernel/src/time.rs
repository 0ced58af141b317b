// SPDX-License-Identifier: MPL-2.0

//! The monotonic kernel clock and instants derived from it.

use core::{ops::Add, time::Duration};

/// A point on the monotonic kernel clock, in microseconds since boot.
///
/// Blocking calls take *absolute* deadlines of this type; `None` stands for
/// "no deadline" throughout the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelTime(u64);

impl KernelTime {
    pub const ZERO: KernelTime = KernelTime(0);

    pub const fn from_us(us: u64) -> Self {
        KernelTime(us)
    }

    pub const fn as_us(&self) -> u64 {
        self.0
    }

    pub fn saturating_duration_since(&self, earlier: KernelTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for KernelTime {
    type Output = KernelTime;

    fn add(self, rhs: Duration) -> KernelTime {
        KernelTime(self.0.saturating_add(rhs.as_micros() as u64))
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// The generic-timer backed clock.
        pub struct KernelClock;

        impl KernelClock {
            pub const fn new() -> Self {
                KernelClock
            }

            pub fn now(&self) -> KernelTime {
                let (cnt, frq) = crate::arch::counter();
                // Split the division to keep precision with frequencies
                // that are not multiples of 1 MHz.
                let secs = cnt / frq;
                let rem = cnt % frq;
                KernelTime(secs * 1_000_000 + rem * 1_000_000 / frq)
            }
        }
    } else {
        use core::sync::atomic::{AtomicU64, Ordering};

        /// Hosted stand-in for the generic timer: a counter the embedder
        /// (or a test) advances explicitly.
        pub struct KernelClock {
            now_us: AtomicU64,
        }

        impl KernelClock {
            pub const fn new() -> Self {
                KernelClock {
                    now_us: AtomicU64::new(0),
                }
            }

            pub fn now(&self) -> KernelTime {
                KernelTime(self.now_us.load(Ordering::Acquire))
            }

            pub fn advance(&self, delta: Duration) {
                self.now_us
                    .fetch_add(delta.as_micros() as u64, Ordering::AcqRel);
            }
        }
    }
}

impl Default for KernelClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deadlines_compare_monotonically() {
        let clock = KernelClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(10));
        let t1 = clock.now();
        assert!(t1 > t0);
        assert_eq!(t1.saturating_duration_since(t0), Duration::from_millis(10));
        assert_eq!(t0.saturating_duration_since(t1), Duration::ZERO);
    }

    #[test]
    fn add_duration_saturates() {
        let t = KernelTime::from_us(u64::MAX - 1);
        assert_eq!((t + Duration::from_secs(5)).as_us(), u64::MAX);
    }
}
