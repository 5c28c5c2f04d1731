use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Expired windows are swept when a new key arrives past this many entries.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct WindowState {
    start: Instant,
    window: Duration,
    count: u32,
}

/// Fixed request windows tracked per key. A window opens on the first
/// request for a key, counts until `window` has elapsed, then resets.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, WindowState>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WindowState>> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts one request against `key`. `max == 0` never limits.
    pub fn check(&self, key: &str, max: u32, window: Duration) -> Decision {
        self.check_at(key, max, window, Instant::now())
    }

    pub fn check_at(&self, key: &str, max: u32, window: Duration, now: Instant) -> Decision {
        if max == 0 {
            return Decision::Allowed { remaining: u32::MAX };
        }

        let mut windows = self.lock();
        if windows.len() >= SWEEP_THRESHOLD && !windows.contains_key(key) {
            sweep(&mut windows, now);
        }
        let state = windows.entry(key.to_string()).or_insert(WindowState {
            start: now,
            window,
            count: 0,
        });
        state.window = window;
        if now.duration_since(state.start) >= window {
            state.start = now;
            state.count = 0;
        }
        if state.count < max {
            state.count += 1;
            Decision::Allowed {
                remaining: max - state.count,
            }
        } else {
            Decision::Limited {
                retry_after: window.saturating_sub(now.duration_since(state.start)),
            }
        }
    }

    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sweep(windows: &mut HashMap<String, WindowState>, now: Instant) {
    windows.retain(|_, state| now.duration_since(state.start) < state.window);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_counts_then_resets() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        let start = Instant::now();

        assert!(limiter.check_at("svc", 2, window, start).is_allowed());
        assert!(limiter.check_at("svc", 2, window, start).is_allowed());
        assert!(!limiter.check_at("svc", 2, window, start + Duration::from_secs(30)).is_allowed());
        assert!(limiter
            .check_at("svc", 2, window, start + Duration::from_secs(61))
            .is_allowed());
    }

    #[test]
    fn expired_windows_are_swept_as_new_keys_arrive() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        let start = Instant::now();
        for i in 0..SWEEP_THRESHOLD {
            limiter.check_at(&format!("ip-{}", i), 5, window, start);
        }
        assert_eq!(limiter.len(), SWEEP_THRESHOLD);

        // Still inside the window: nothing to drop, the map grows by one.
        limiter.check_at("late", 5, window, start + Duration::from_secs(30));
        assert_eq!(limiter.len(), SWEEP_THRESHOLD + 1);

        // Past it, the first-wave windows go away.
        limiter.check_at("later", 5, window, start + Duration::from_secs(61));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn keys_are_independent_and_zero_is_unlimited() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        assert!(limiter.check("a", 1, window).is_allowed());
        assert!(!limiter.check("a", 1, window).is_allowed());
        assert!(limiter.check("b", 1, window).is_allowed());
        for _ in 0..10 {
            assert!(limiter.check("c", 0, window).is_allowed());
        }
    }
}
