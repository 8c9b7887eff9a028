//! Exit signaling and bounded waits shared by consumers and servers

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TAG: &str = "xserver.shutdown";

/// Single-fire, broadcast exit notification.
///
/// Every clone observes the same signal. Firing is idempotent; waiters that
/// start after the signal fired return immediately.
#[derive(Debug, Clone, Default)]
pub struct ExitSignal {
    token: CancellationToken,
}

impl ExitSignal {
    /// Create an unfired signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal
    pub fn fire(&self) {
        self.token.cancel();
    }

    /// Whether the signal has fired
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the signal fires
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for `select!` arms and tokio-util helpers
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Result of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The awaited work finished within the limit
    Completed {
        /// Time spent waiting
        elapsed: Duration,
    },
    /// The limit elapsed first; the work was left running
    TimedOut {
        /// The limit that elapsed
        limit: Duration,
    },
}

impl DrainOutcome {
    /// Whether the work finished in time
    pub fn is_completed(&self) -> bool {
        matches!(self, DrainOutcome::Completed { .. })
    }

    /// Combine outcomes of independent drains: timed out if any timed out
    pub fn merge(self, other: DrainOutcome) -> DrainOutcome {
        match (self, other) {
            (DrainOutcome::Completed { elapsed: a }, DrainOutcome::Completed { elapsed: b }) => {
                DrainOutcome::Completed { elapsed: a.max(b) }
            }
            (DrainOutcome::TimedOut { limit: a }, DrainOutcome::TimedOut { limit: b }) => {
                DrainOutcome::TimedOut { limit: a.max(b) }
            }
            (timed_out @ DrainOutcome::TimedOut { .. }, _)
            | (_, timed_out @ DrainOutcome::TimedOut { .. }) => timed_out,
        }
    }
}

/// Wait for `work` for at most `limit`.
///
/// On timeout the future is dropped; anything it was waiting on keeps running.
pub async fn bounded_wait<F>(work: F, limit: Duration) -> DrainOutcome
where
    F: Future<Output = ()>,
{
    let start = Instant::now();
    match tokio::time::timeout(limit, work).await {
        Ok(()) => {
            let elapsed = start.elapsed();
            debug!(target: TAG, "bounded wait completed in {:?}", elapsed);
            DrainOutcome::Completed { elapsed }
        }
        Err(_) => DrainOutcome::TimedOut { limit },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_signal_is_broadcast_and_idempotent() {
        let signal = ExitSignal::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.fired().await })
            })
            .collect();

        assert!(!signal.is_fired());
        signal.fire();
        signal.fire();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert!(signal.is_fired());

        // Late waiters return immediately.
        signal.fired().await;
    }

    #[tokio::test]
    async fn test_bounded_wait_outcomes() {
        let outcome = bounded_wait(async {}, Duration::from_millis(100)).await;
        assert!(outcome.is_completed());

        let outcome = bounded_wait(
            tokio::time::sleep(Duration::from_secs(10)),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(
            outcome,
            DrainOutcome::TimedOut {
                limit: Duration::from_millis(20)
            }
        );
    }

    #[test]
    fn test_merge_prefers_timeout() {
        let done = DrainOutcome::Completed {
            elapsed: Duration::from_millis(5),
        };
        let late = DrainOutcome::TimedOut {
            limit: Duration::from_secs(2),
        };
        assert_eq!(done.merge(late), late);
        assert_eq!(late.merge(done), late);
        assert_eq!(
            done.merge(DrainOutcome::Completed {
                elapsed: Duration::from_millis(9)
            }),
            DrainOutcome::Completed {
                elapsed: Duration::from_millis(9)
            }
        );
    }
}
