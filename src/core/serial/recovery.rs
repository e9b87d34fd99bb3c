//! Reopen and reconnect backoff

use std::time::Duration;

/// Recovery policy for a link whose device or connection failed
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    /// Maximum consecutive attempts, 0 for unlimited
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Delay multiplier (exponential backoff)
    pub backoff_multiplier: f32,
    /// Whether to attempt recovery at all
    pub enabled: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            enabled: true,
        }
    }
}

impl RecoveryPolicy {
    /// Delay before attempt number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f32() * self.backoff_multiplier.powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f32());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f32(capped)
        } else {
            self.max_delay
        }
    }

    /// Should attempt number `attempt` (0-based) be made?
    pub fn should_attempt(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

/// Attempt counter driven by a [`RecoveryPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RecoveryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Fresh counter
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts made since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` when the policy gives up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.should_attempt(self.attempt) {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Forget earlier failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RecoveryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        let second = policy.delay_for_attempt(1);
        assert!(second >= Duration::from_millis(199) && second <= Duration::from_millis(201));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(350));
    }

    #[test]
    fn test_unlimited_attempts() {
        let policy = RecoveryPolicy::default();
        assert!(policy.should_attempt(1_000_000));
    }

    #[test]
    fn test_backoff_gives_up() {
        let mut backoff = Backoff::new(RecoveryPolicy {
            max_attempts: 2,
            ..Default::default()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_disabled() {
        let policy = RecoveryPolicy {
            enabled: false,
            ..Default::default()
        };
        assert!(!policy.should_attempt(0));
    }
}
