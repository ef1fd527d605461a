use log::{info, warn};
use std::time::Duration;

/// Exponential reconnect schedule: attempt `n` (1-based) waits `base * 2^n`.
/// Once `max_attempts` have been handed out the policy is exhausted until
/// `reset` is called after a successful open.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        ReconnectPolicy {
            base,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay before the next attempt, or `None` when no attempts remain.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            warn!("Reconnect attempts exhausted after {}", self.attempts);
            return None;
        }
        self.attempts += 1;
        let factor = 2u32.saturating_pow(self.attempts);
        let delay = self.base.saturating_mul(factor);
        info!(
            "Reconnect attempt {}/{} in {:?}",
            self.attempts, self.max_attempts, delay
        );
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_exhausted() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(1), 5);
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(32),
            ]
        );
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(Duration::from_millis(10), 2);
        policy.next_delay();
        policy.next_delay();
        assert!(policy.is_exhausted());

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut policy = ReconnectPolicy::new(Duration::from_secs(1), 0);
        assert_eq!(policy.next_delay(), None);
    }
}
