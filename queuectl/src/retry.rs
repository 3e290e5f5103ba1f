//! Post-failure transition rule: retry with backoff, or condemn to the
//! dead-letter queue.

use std::time::Duration;

use crate::backoff::BackoffPolicy;

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to the backlog after `delay`.
    Retry { delay: Duration },
    /// Retry budget exhausted; transfer to the dead-letter queue.
    Dlq,
}

impl RetryDecision {
    /// Decide the fate of a job after a failure.
    ///
    /// `attempts_now` is the post-increment count, i.e. the number of the
    /// attempt that just failed. The same value is fed to the backoff
    /// policy, so one failure yields a `base^1` delay.
    pub fn decide(attempts_now: u32, max_retries: u32, policy: &BackoffPolicy) -> Self {
        if attempts_now >= max_retries {
            RetryDecision::Dlq
        } else {
            RetryDecision::Retry {
                delay: policy.delay(attempts_now),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_below_ceiling() {
        let policy = BackoffPolicy::new(2);

        assert_eq!(
            RetryDecision::decide(1, 3, &policy),
            RetryDecision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            RetryDecision::decide(2, 3, &policy),
            RetryDecision::Retry {
                delay: Duration::from_secs(4)
            }
        );
    }

    #[test]
    fn condemns_at_ceiling() {
        let policy = BackoffPolicy::new(2);

        assert_eq!(RetryDecision::decide(3, 3, &policy), RetryDecision::Dlq);
        assert_eq!(RetryDecision::decide(4, 3, &policy), RetryDecision::Dlq);
    }

    #[test]
    fn zero_ceiling_condemns_first_failure() {
        let policy = BackoffPolicy::new(2);

        assert_eq!(RetryDecision::decide(1, 0, &policy), RetryDecision::Dlq);
    }
}
