// =============================================================================
// Log throttling — state-keyed rate limiting for high-frequency warnings
// =============================================================================
//
// Risk gates and queue-overflow paths can fire hundreds of times per second.
// Callers ask `should_log(key)` before emitting; the throttle answers at
// most once per interval per key, with an immediate pass on the first
// occurrence or on a state change.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Interval-based throttle keyed by arbitrary strings.
pub struct LogThrottle {
    last_logged: Mutex<HashMap<String, Instant>>,
}

impl LogThrottle {
    pub fn new() -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// `true` when `key` has not logged within `interval` (first call for a
    /// key always passes). Passing records the timestamp.
    pub fn should_log(&self, key: &str, interval: Duration) -> bool {
        let mut map = self.last_logged.lock();
        let now = Instant::now();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget a key so its next occurrence logs immediately.
    pub fn reset(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// Throttle that also tracks a state label per key: a *state change* logs
/// immediately only on the key's first sighting; afterwards even changes
/// respect the minimum interval, so flapping states cannot storm the log.
pub struct StateThrottle {
    inner: Mutex<HashMap<String, StateEntry>>,
}

struct StateEntry {
    state: String,
    last_logged: Instant,
}

impl StateThrottle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `(key, state)` should log given `interval`.
    pub fn should_log(&self, key: &str, state: &str, interval: Duration) -> bool {
        let mut map = self.inner.lock();
        let now = Instant::now();
        match map.get_mut(key) {
            None => {
                map.insert(
                    key.to_string(),
                    StateEntry {
                        state: state.to_string(),
                        last_logged: now,
                    },
                );
                true
            }
            Some(entry) => {
                let due = now.duration_since(entry.last_logged) >= interval;
                if due {
                    entry.state = state.to_string();
                    entry.last_logged = now;
                    true
                } else {
                    // Track the state silently; the next due log reflects it.
                    entry.state = state.to_string();
                    false
                }
            }
        }
    }

    /// Current recorded state for a key, if any.
    pub fn state_of(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).map(|e| e.state.clone())
    }

    pub fn clear(&self, key: &str) {
        self.inner.lock().remove(key);
    }
}

impl Default for StateThrottle {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_occurrence_always_logs() {
        let t = LogThrottle::new();
        assert!(t.should_log("a", Duration::from_secs(60)));
        assert!(!t.should_log("a", Duration::from_secs(60)));
        // Independent keys do not interfere.
        assert!(t.should_log("b", Duration::from_secs(60)));
    }

    #[test]
    fn reset_reopens_the_gate() {
        let t = LogThrottle::new();
        assert!(t.should_log("a", Duration::from_secs(60)));
        t.reset("a");
        assert!(t.should_log("a", Duration::from_secs(60)));
    }

    #[test]
    fn zero_interval_never_throttles() {
        let t = LogThrottle::new();
        assert!(t.should_log("a", Duration::ZERO));
        assert!(t.should_log("a", Duration::ZERO));
    }

    #[test]
    fn state_change_within_interval_stays_quiet() {
        let t = StateThrottle::new();
        assert!(t.should_log("k", "collecting", Duration::from_secs(60)));
        // State flips but the interval has not elapsed: quiet, state tracked.
        assert!(!t.should_log("k", "volatile", Duration::from_secs(60)));
        assert_eq!(t.state_of("k").as_deref(), Some("volatile"));
    }

    #[test]
    fn state_logs_again_after_interval() {
        let t = StateThrottle::new();
        assert!(t.should_log("k", "ok", Duration::ZERO));
        assert!(t.should_log("k", "ok", Duration::ZERO));
    }
}
