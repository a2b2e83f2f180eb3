// =============================================================================
// Reconnect policies — bounded monitor-driven and unbounded standalone
// =============================================================================
//
// Two policies exist on purpose:
//   - `Bounded`   — used by the health monitor: linear-ish delay
//                   `min(5 * attempt, 30)` seconds, at most N attempts,
//                   then the venue is left degraded for a human.
//   - `Unbounded` — used by standalone scanners: exponential backoff from a
//                   base delay, capped, retrying forever.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReconnectPolicy {
    /// `min(5 * attempt, 30)` seconds, up to `max_attempts`.
    Bounded { max_attempts: u32 },
    /// `base * 2^(attempt-1)` seconds, capped at `max_delay_secs`, forever.
    Unbounded {
        base_delay_secs: f64,
        max_delay_secs: f64,
    },
}

impl ReconnectPolicy {
    /// Standard monitor policy: three attempts.
    pub fn bounded(max_attempts: u32) -> Self {
        Self::Bounded { max_attempts }
    }

    /// Standalone-scanner policy: 2 s base, 60 s cap, no attempt bound.
    pub fn unbounded() -> Self {
        Self::Unbounded {
            base_delay_secs: 2.0,
            max_delay_secs: 60.0,
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based), or `None`
    /// when the policy is exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::Bounded { max_attempts } => {
                if attempt > *max_attempts {
                    None
                } else {
                    let secs = (5 * attempt).min(30) as u64;
                    Some(Duration::from_secs(secs))
                }
            }
            Self::Unbounded {
                base_delay_secs,
                max_delay_secs,
            } => {
                let exp = base_delay_secs * 2f64.powi(attempt.saturating_sub(1).min(30) as i32);
                Some(Duration::from_secs_f64(exp.min(*max_delay_secs)))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_delays_ramp_and_cap() {
        let p = ReconnectPolicy::bounded(3);
        assert_eq!(p.delay_for_attempt(1), Some(Duration::from_secs(5)));
        assert_eq!(p.delay_for_attempt(2), Some(Duration::from_secs(10)));
        assert_eq!(p.delay_for_attempt(3), Some(Duration::from_secs(15)));
        assert_eq!(p.delay_for_attempt(4), None);
    }

    #[test]
    fn bounded_caps_at_thirty_seconds() {
        let p = ReconnectPolicy::bounded(10);
        assert_eq!(p.delay_for_attempt(7), Some(Duration::from_secs(30)));
        assert_eq!(p.delay_for_attempt(10), Some(Duration::from_secs(30)));
    }

    #[test]
    fn unbounded_doubles_to_cap_and_never_exhausts() {
        let p = ReconnectPolicy::unbounded();
        assert_eq!(p.delay_for_attempt(1), Some(Duration::from_secs(2)));
        assert_eq!(p.delay_for_attempt(2), Some(Duration::from_secs(4)));
        assert_eq!(p.delay_for_attempt(5), Some(Duration::from_secs(32)));
        assert_eq!(p.delay_for_attempt(6), Some(Duration::from_secs(60)));
        assert_eq!(p.delay_for_attempt(1000), Some(Duration::from_secs(60)));
    }
}
