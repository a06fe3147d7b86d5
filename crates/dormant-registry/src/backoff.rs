//! Retry delay arithmetic.

use std::time::Duration;

use crate::types::{Backoff, BackoffPolicy};

/// Longest delay any retry may be pushed out by.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(5 * 60 * 60);

/// Smallest initial delay a job may declare.
pub const MIN_BACKOFF_DELAY: Duration = Duration::from_secs(10);

/// Delay before the `attempt`-th retry (1-indexed).
///
/// Linear grows as `initial * attempt`, exponential as
/// `initial * 2^(attempt - 1)`. Both are capped at [`MAX_BACKOFF_DELAY`].
/// An `attempt` of zero is treated as the first attempt.
pub fn next_delay(initial_delay: Duration, policy: BackoffPolicy, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let delay = match policy {
        BackoffPolicy::Linear => initial_delay.checked_mul(attempt),
        BackoffPolicy::Exponential => 1u32
            .checked_shl(attempt - 1)
            .and_then(|factor| initial_delay.checked_mul(factor)),
    };
    delay.map_or(MAX_BACKOFF_DELAY, |d| d.min(MAX_BACKOFF_DELAY))
}

impl Backoff {
    /// Delay before the `attempt`-th retry under this policy.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        next_delay(self.initial_delay, self.policy, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);

    #[test_case(BackoffPolicy::Linear, 1 => 15 ; "linear first")]
    #[test_case(BackoffPolicy::Linear, 2 => 30 ; "linear second")]
    #[test_case(BackoffPolicy::Linear, 5 => 75 ; "linear fifth")]
    #[test_case(BackoffPolicy::Linear, 20 => 300 ; "linear capped")]
    #[test_case(BackoffPolicy::Exponential, 1 => 15 ; "exponential first")]
    #[test_case(BackoffPolicy::Exponential, 2 => 30 ; "exponential second")]
    #[test_case(BackoffPolicy::Exponential, 4 => 120 ; "exponential fourth")]
    #[test_case(BackoffPolicy::Exponential, 5 => 240 ; "exponential fifth")]
    #[test_case(BackoffPolicy::Exponential, 6 => 300 ; "exponential capped")]
    #[test_case(BackoffPolicy::Exponential, 200 => 300 ; "exponential shift overflow")]
    fn delay_in_minutes(policy: BackoffPolicy, attempt: u32) -> u64 {
        next_delay(FIFTEEN_MIN, policy, attempt).as_secs() / 60
    }

    #[test]
    fn zero_attempt_is_first_attempt() {
        assert_eq!(
            next_delay(FIFTEEN_MIN, BackoffPolicy::Exponential, 0),
            next_delay(FIFTEEN_MIN, BackoffPolicy::Exponential, 1)
        );
    }

    fn policy() -> impl Strategy<Value = BackoffPolicy> {
        prop_oneof![Just(BackoffPolicy::Linear), Just(BackoffPolicy::Exponential)]
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap(
            initial_secs in 10u64..100_000,
            policy in policy(),
            attempt in 1u32..10_000,
        ) {
            let delay = next_delay(Duration::from_secs(initial_secs), policy, attempt);
            prop_assert!(delay <= MAX_BACKOFF_DELAY);
        }

        #[test]
        fn delay_is_non_decreasing_in_attempt(
            initial_secs in 10u64..10_000,
            policy in policy(),
            attempt in 1u32..1_000,
        ) {
            let initial = Duration::from_secs(initial_secs);
            prop_assert!(next_delay(initial, policy, attempt) <= next_delay(initial, policy, attempt + 1));
        }

        #[test]
        fn exponential_doubles_until_capped(initial_secs in 10u64..1_000, attempt in 1u32..30) {
            let initial = Duration::from_secs(initial_secs);
            let current = next_delay(initial, BackoffPolicy::Exponential, attempt);
            let next = next_delay(initial, BackoffPolicy::Exponential, attempt + 1);
            prop_assert_eq!(next, (current * 2).min(MAX_BACKOFF_DELAY));
        }
    }
}
