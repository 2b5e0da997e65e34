use std::cmp::min;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// total number of attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// growth of the delay per attempt, in eighths (16 doubles the delay, 8 keeps it constant).
    ///  Values below 8 are treated as 8, so delays never shrink.
    pub delay_factor_eighths: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            delay_factor_eighths: 12,
        }
    }
}

/// Bounded retry with exponentially growing delays. Each call to [Backoff::next_delay] accounts
///  for one failed attempt and returns how long to wait before the next one, or `None` if there
///  are no attempts left.
pub struct Backoff {
    failed_attempts: u32,
    next_delay: Duration,

    config_max_attempts: u32,
    config_max_delay: Duration,
    config_delay_factor_eighths: u32,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Backoff {
        Backoff {
            failed_attempts: 0,
            next_delay: min(policy.initial_delay, policy.max_delay),
            config_max_attempts: policy.max_attempts,
            config_max_delay: policy.max_delay,
            config_delay_factor_eighths: policy.delay_factor_eighths.max(8),
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failed_attempts += 1;
        if self.failed_attempts >= self.config_max_attempts {
            return None;
        }

        let result = self.next_delay;
        self.next_delay = min(
            self.next_delay * self.config_delay_factor_eighths / 8,
            self.config_max_delay,
        );
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn policy(max_attempts: u32, initial_millis: u64, max_millis: u64, factor: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(initial_millis),
            max_delay: Duration::from_millis(max_millis),
            delay_factor_eighths: factor,
        }
    }

    #[rstest]
    #[case::single_attempt(1, 100, 1000, 16, vec![])]
    #[case::no_attempts(0, 100, 1000, 16, vec![])]
    #[case::doubling(4, 100, 1000, 16, vec![100, 200, 400])]
    #[case::capped(6, 100, 500, 16, vec![100, 200, 400, 500, 500])]
    #[case::constant(3, 50, 1000, 8, vec![50, 50])]
    #[case::factor_1_5(4, 80, 1000, 12, vec![80, 120, 180])]
    #[case::initial_above_max(3, 900, 300, 16, vec![300, 300])]
    #[case::shrinking_factor_is_constant(3, 50, 1000, 4, vec![50, 50])]
    #[case::zero_factor_is_constant(4, 50, 1000, 0, vec![50, 50, 50])]
    fn test_delays(
        #[case] max_attempts: u32,
        #[case] initial_millis: u64,
        #[case] max_millis: u64,
        #[case] factor: u32,
        #[case] expected_millis: Vec<u64>,
    ) {
        let mut backoff = Backoff::new(&policy(max_attempts, initial_millis, max_millis, factor));

        let mut actual = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            actual.push(delay.as_millis() as u64);
        }
        assert_eq!(actual, expected_millis);
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_failed_attempts() {
        let mut backoff = Backoff::new(&RetryPolicy::new(3));
        assert_eq!(backoff.failed_attempts(), 0);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.failed_attempts(), 2);
    }
}
