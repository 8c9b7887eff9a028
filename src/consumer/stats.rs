//! Per-family success/failure counters reported on a fixed interval

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TAG: &str = "xserver.consumer.stat";

/// Default reporting interval
pub const DEFAULT_STAT_INTERVAL: Duration = Duration::from_secs(60);

/// Counts drained by one report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatSnapshot {
    /// Units that ended in handler success
    pub success: u64,
    /// Units that ended in forward or drop
    pub failure: u64,
}

/// Success and failure counters, reset on every report
#[derive(Debug, Default)]
pub struct StatCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

impl StatCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a unit whose handler eventually succeeded
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a unit that was forwarded or dropped
    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the current counts and reset both counters to zero
    pub fn drain(&self) -> StatSnapshot {
        StatSnapshot {
            success: self.success.swap(0, Ordering::Relaxed),
            failure: self.failure.swap(0, Ordering::Relaxed),
        }
    }

    /// Read without resetting
    pub fn peek(&self) -> StatSnapshot {
        StatSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the periodic reporter for one broker family.
///
/// The reporter stops when `exit` is cancelled; counts accumulated since the
/// last tick are reported one final time.
pub fn spawn_reporter(
    family: &'static str,
    counters: Arc<StatCounters>,
    interval: Duration,
    exit: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = exit.cancelled() => {
                    report(family, counters.drain());
                    break;
                }
                _ = ticker.tick() => {
                    report(family, counters.drain());
                }
            }
        }
    })
}

fn report(family: &str, snapshot: StatSnapshot) {
    info!(
        target: TAG,
        family,
        success = snapshot.success,
        failure = snapshot.failure,
        "[{} Stat] success:{},fail:{}",
        family,
        snapshot.success,
        snapshot.failure
    );
}
