//! # Exponential Backoff
//!
//! Doubling backoff used between watch reconnects and transient API retries.
//! Sequence for min=1s, max=60s: 1s, 2s, 4s, 8s, 16s, 32s, 60s (max).
//!
//! It also drives `kube::runtime::watcher` through [`WatchStreamExt::backoff`],
//! so the configured watch bounds apply to the real watch stream.
//!
//! [`WatchStreamExt::backoff`]: kube::runtime::WatchStreamExt::backoff

use std::time::Duration;

/// Exponential backoff calculator
///
/// Each backoff is twice the previous one, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Minimum backoff value (for reset)
    min: Duration,
    /// Current backoff value
    current: Duration,
    /// Maximum backoff value
    max: Duration,
    /// Number of backoffs handed out since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff between `min` and `max`
    ///
    /// A `max` below `min` is raised to `min`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            current: min,
            max: max.max(min),
            attempts: 0,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        self.attempts = self.attempts.saturating_add(1);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Backoffs handed out since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Calculate the backoff for a given attempt (stateless, 0-indexed)
    #[must_use]
    pub fn calculate_for_attempt(attempt: u32, min: Duration, max: Duration) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        std::cmp::min(min.saturating_mul(factor), max.max(min))
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    /// Never exhausted: retries continue at `max`
    fn next(&mut self) -> Option<Duration> {
        Some(self.next_backoff())
    }
}

impl kube::runtime::utils::Backoff for ExponentialBackoff {
    fn reset(&mut self) {
        ExponentialBackoff::reset(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(16));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(32));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(60)); // max
        assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();

        // Should restart from the beginning after a successful reconnect
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn test_max_below_min_is_clamped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_calculate_for_attempt() {
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(ExponentialBackoff::calculate_for_attempt(0, min, max), min);
        assert_eq!(
            ExponentialBackoff::calculate_for_attempt(3, min, max),
            Duration::from_millis(800)
        );
        assert_eq!(ExponentialBackoff::calculate_for_attempt(40, min, max), max);
    }

    #[test]
    fn test_watcher_backoff_never_ends_and_resets() {
        use kube::runtime::utils::Backoff;

        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(40));
        let delays: Vec<_> = backoff.by_ref().take(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );

        Backoff::reset(&mut backoff);
        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
    }
}
