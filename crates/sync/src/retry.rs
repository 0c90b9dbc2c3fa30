//! Retry policy: schedule-based backoff with a hard attempt ceiling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide retry configuration.
///
/// The schedule is an ordered list of delays authored in increasing order;
/// the policy trusts the authored order and reuses the last entry for any
/// failure beyond the schedule's length. An empty schedule disables
/// retries entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Hard ceiling on total attempts (first attempt included).
    max_attempts: u32,
    /// Delay before retry N is `schedule[N - 1]` (last entry reused).
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schedule: vec![
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(60 * 60),
            ],
        }
    }
}

impl RetryPolicy {
    /// Create a policy from an authored schedule.
    pub fn new(max_attempts: u32, schedule: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            schedule,
        }
    }

    /// Create a policy with a fixed delay between retries.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            schedule: vec![delay],
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide whether a job may run again after a failure.
    ///
    /// `failures` is the total number of failed attempts, including the
    /// failure just observed. Returns `None` once the attempt ceiling is
    /// reached (the caller must fail the job permanently); otherwise the
    /// delay to wait before the next attempt, measured from now.
    pub fn next_attempt(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        let idx = (failures.saturating_sub(1) as usize).min(self.schedule.len().saturating_sub(1));
        self.schedule.get(idx).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn walks_the_schedule_in_order() {
        let policy = RetryPolicy::new(
            4,
            vec![
                Duration::from_secs(300),
                Duration::from_secs(900),
                Duration::from_secs(3600),
            ],
        );

        assert_eq!(policy.next_attempt(1), Some(Duration::from_secs(300)));
        assert_eq!(policy.next_attempt(2), Some(Duration::from_secs(900)));
        assert_eq!(policy.next_attempt(3), Some(Duration::from_secs(3600)));
        assert_eq!(policy.next_attempt(4), None);
    }

    #[test]
    fn reuses_last_entry_past_the_schedule() {
        let policy = RetryPolicy::new(10, vec![Duration::from_secs(60), Duration::from_secs(120)]);

        assert_eq!(policy.next_attempt(5), Some(Duration::from_secs(120)));
        assert_eq!(policy.next_attempt(9), Some(Duration::from_secs(120)));
    }

    #[test]
    fn exhaustion_at_the_ceiling() {
        let policy = RetryPolicy::default();

        assert!(policy.next_attempt(1).is_some());
        assert!(policy.next_attempt(2).is_some());
        assert_eq!(policy.next_attempt(3), None);
        assert_eq!(policy.next_attempt(7), None);
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.next_attempt(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_attempt(2), Some(Duration::from_millis(500)));
    }

    #[test]
    fn empty_schedule_disables_retries() {
        let policy = RetryPolicy::new(3, Vec::new());
        assert_eq!(policy.next_attempt(1), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for a non-decreasing authored schedule, the delays
        /// handed out across successive failures are non-decreasing.
        #[test]
        fn backoff_is_non_decreasing(
            mut delays in prop::collection::vec(0u64..86_400, 1..8),
            max_attempts in 1u32..16,
        ) {
            delays.sort_unstable();
            let schedule: Vec<Duration> = delays.iter().map(|&s| Duration::from_secs(s)).collect();
            let policy = RetryPolicy::new(max_attempts, schedule);

            let mut prev = Duration::ZERO;
            for failures in 1..max_attempts {
                if let Some(delay) = policy.next_attempt(failures) {
                    prop_assert!(delay >= prev);
                    prev = delay;
                }
            }
        }

        /// Property: a job never retries past `max_attempts` failures.
        #[test]
        fn retries_terminate(
            max_attempts in 0u32..16,
            failures in 0u32..64,
        ) {
            let policy = RetryPolicy::fixed(max_attempts, Duration::from_secs(1));
            if failures >= max_attempts {
                prop_assert!(policy.next_attempt(failures).is_none());
            } else {
                prop_assert!(policy.next_attempt(failures).is_some());
            }
        }
    }
}
