//! 🚦 ratelimit.rs — the bouncer at the retry-queue door.
//!
//! Token bucket, Linux-kernel-logging flavor: within any `interval`-second
//! window, the first `burst` messages get in; everything after that is
//! dropped on the floor, and when the window rolls over we log *how much*
//! hit the floor. One summary line instead of a log flood about a log flood.
//!
//! 🧠 Knowledge graph:
//! - **Who uses it**: the retry reinjector — a misbehaving cluster can turn
//!   one bad batch into thousands of synthetic retry messages per second,
//!   and this is what stands between that and a feedback loop
//! - **No time caching**: the clock is read on every admit call. Retry
//!   traffic is bursty and rare; a cached coarse clock would save nothing
//!   and skew windows
//! - **`interval == 0`**: limiter off, everything admitted
//!
//! 🦆 (the duck tried to get in twice. the duck is in `missed`.)

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

#[derive(Debug, Default)]
struct Window {
    /// ⏱️ unix-seconds timestamp of the current window's start
    begin: u64,
    /// ✅ admits in the current window
    done: u32,
    /// 🗑️ drops in the current window, reported when the window rolls
    missed: u64,
}

/// 🚦 A thread-safe token bucket with a rolling window.
///
/// Cheap enough to sit on every action instance; contended only by workers
/// of that one action, and only when failures are being reinjected.
#[derive(Debug)]
pub struct RateLimiter {
    interval_secs: u64,
    burst: u32,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(interval_secs: u32, burst: u32) -> Self {
        RateLimiter {
            interval_secs: u64::from(interval_secs),
            burst,
            window: Mutex::new(Window::default()),
        }
    }

    /// 🎫 One ticket, please. `true` → enqueue it; `false` → it's gone, and
    /// the window-roll summary will own up to it later.
    pub fn admit(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0); // a clock before 1970 has bigger problems than rate limits
        self.admit_at(now)
    }

    /// 🧪 Clock-injected twin of [`RateLimiter::admit`] — same logic, testable time.
    pub(crate) fn admit_at(&self, now: u64) -> bool {
        if self.interval_secs == 0 {
            return true;
        }
        let mut w = self.window.lock().expect("rate limiter mutex poisoned");
        if now > w.begin + self.interval_secs {
            if w.missed > 0 {
                warn!(
                    discarded = w.missed,
                    "rate limiter dropped retry messages in the last window"
                );
                w.missed = 0;
            }
            w.begin = now;
            w.done = 0;
        }
        if w.done < self.burst {
            w.done += 1;
            true
        } else {
            w.missed += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_interval_zero_means_open_bar() {
        let limiter = RateLimiter::new(0, 1);
        for _ in 0..100 {
            assert!(limiter.admit_at(1000));
        }
    }

    #[test]
    fn the_one_where_the_burst_runs_out() {
        // 🧪 burst 3: three admits, then the door closes for the window
        let limiter = RateLimiter::new(600, 3);
        assert!(limiter.admit_at(1000));
        assert!(limiter.admit_at(1000));
        assert!(limiter.admit_at(1001));
        assert!(!limiter.admit_at(1002), "fourth message hits the floor");
        assert!(!limiter.admit_at(1003));
    }

    #[test]
    fn the_one_where_a_new_window_refills_the_bucket() {
        let limiter = RateLimiter::new(10, 2);
        assert!(limiter.admit_at(1000));
        assert!(limiter.admit_at(1000));
        assert!(!limiter.admit_at(1005));
        // ⏱️ 1011 > 1000 + 10 → window rolls, tokens are back
        assert!(limiter.admit_at(1011));
        assert!(limiter.admit_at(1011));
        assert!(!limiter.admit_at(1012));
    }
}
