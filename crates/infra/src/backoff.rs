//! Poll backoff policy.
//!
//! A step that is waiting on something external asks to be polled again. The
//! policy turns the chunk's poll attempt count into the next deadline, and caps
//! how many times a chunk may poll before it is failed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy between polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between polls
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Poll backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollBackoff {
    /// Maximum number of polls a chunk may request (0 = polling disabled)
    pub max_attempts: u32,
    /// Base delay between polls
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl PollBackoff {
    /// Fixed delay, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before poll number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so chunks of one step do not all wake together.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Whether a chunk that has already polled `poll_attempts` times may poll again.
    pub fn allows_another_poll(&self, poll_attempts: u32) -> bool {
        poll_attempts < self.max_attempts
    }

    /// Deadline for the next poll, or `None` once attempts are exhausted.
    pub fn next_poll_time(&self, now: DateTime<Utc>, poll_attempts: u32) -> Option<DateTime<Utc>> {
        if !self.allows_another_poll(poll_attempts) {
            return None;
        }
        let delay = self.delay_for_attempt(poll_attempts + 1);
        Some(now + chrono::Duration::from_std(delay).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn exponential_delays_double_until_capped() {
        let policy = PollBackoff::exponential(10, Duration::from_secs(1), Duration::from_secs(5))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(5));
    }

    #[test]
    fn linear_delays_grow_by_base() {
        let policy = PollBackoff {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..PollBackoff::default()
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn next_poll_time_stops_at_max_attempts() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let policy = PollBackoff::fixed(2, Duration::from_secs(30));

        assert_eq!(policy.next_poll_time(now, 0), Some(now + chrono::Duration::seconds(30)));
        assert_eq!(policy.next_poll_time(now, 1), Some(now + chrono::Duration::seconds(30)));
        assert_eq!(policy.next_poll_time(now, 2), None);
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = PollBackoff::fixed(5, Duration::from_secs(10)).with_jitter(0.5);
        for attempt in 1..=5 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_secs(5), "{delay:?}");
            assert!(delay <= Duration::from_secs(10), "{delay:?}");
        }
    }
}
