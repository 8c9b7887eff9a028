//! Retry decisions for failed handler invocations and bounded retry for publishes

use std::future::Future;
use tracing::debug;

const TAG: &str = "xserver.consumer.retry";

/// What to do with a unit after a failed handler attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Invoke the handler again immediately
    Retry,
    /// Give up locally and forward the unit to the dead-letter topic
    ForwardToDeadLetter,
    /// Give up locally; no dead-letter topic is configured
    Drop,
}

impl RetryDecision {
    /// Whether the decision ends the unit's processing
    pub fn is_terminal(self) -> bool {
        !matches!(self, RetryDecision::Retry)
    }
}

/// Decide the next step for a unit whose handler just failed.
///
/// `attempt` counts previous failures of this unit, starting at 0 for the
/// first invocation. A `fail_count` of 0 means the first failure is terminal.
pub fn decide(attempt: u32, fail_count: u32, has_dead_letter_topic: bool) -> RetryDecision {
    if attempt < fail_count {
        RetryDecision::Retry
    } else if has_dead_letter_topic {
        RetryDecision::ForwardToDeadLetter
    } else {
        RetryDecision::Drop
    }
}

/// Per-topic retry policy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Number of local retries after the first failure
    pub fail_count: u32,
    /// Topic receiving units that exhausted their retries
    pub dead_letter_topic: Option<String>,
}

impl RetryPolicy {
    /// Create a policy with local retries and an optional dead-letter topic
    pub fn new(fail_count: u32, dead_letter_topic: Option<String>) -> Self {
        Self {
            fail_count,
            dead_letter_topic: dead_letter_topic.filter(|topic| !topic.is_empty()),
        }
    }

    /// Create a policy with no retries and no dead-letter topic
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Decide the next step after the `attempt`-th failure
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        decide(attempt, self.fail_count, self.dead_letter_topic.is_some())
    }
}

/// Run `operation` up to `max_attempts` times, stopping at the first success.
///
/// There is no backoff between attempts. Returns the last error when every
/// attempt failed. Failures are not logged here; `operation` logs its own.
pub async fn retry_bounded<F, Fut, T, E>(max_attempts: u32, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(target: TAG, "Operation succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[rstest]
    #[case(0, 3, false, RetryDecision::Retry)]
    #[case(2, 3, true, RetryDecision::Retry)]
    #[case(3, 3, true, RetryDecision::ForwardToDeadLetter)]
    #[case(3, 3, false, RetryDecision::Drop)]
    #[case(7, 3, false, RetryDecision::Drop)]
    #[case(0, 0, true, RetryDecision::ForwardToDeadLetter)]
    #[case(0, 0, false, RetryDecision::Drop)]
    fn test_decide(
        #[case] attempt: u32,
        #[case] fail_count: u32,
        #[case] has_dead_letter: bool,
        #[case] expected: RetryDecision,
    ) {
        assert_eq!(decide(attempt, fail_count, has_dead_letter), expected);
    }

    #[test]
    fn test_policy_ignores_empty_dead_letter_topic() {
        let policy = RetryPolicy::new(1, Some(String::new()));
        assert_eq!(policy.dead_letter_topic, None);
        assert_eq!(policy.decide(1), RetryDecision::Drop);

        let policy = RetryPolicy::new(1, Some("orders-failed".to_string()));
        assert_eq!(policy.decide(0), RetryDecision::Retry);
        assert_eq!(policy.decide(1), RetryDecision::ForwardToDeadLetter);
        assert!(policy.decide(1).is_terminal());
    }

    #[tokio::test]
    async fn test_retry_bounded_stops_on_success() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let result: Result<&str, &str> = retry_bounded(3, move |_| {
            let count = count_clone.clone();
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err("temporary error")
                } else {
                    Ok("sent")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("sent"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_bounded_gives_up() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();

        let result: Result<(), String> = retry_bounded(3, move |attempt| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {} failed", attempt)) }
        })
        .await;

        assert_eq!(result, Err("attempt 2 failed".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
