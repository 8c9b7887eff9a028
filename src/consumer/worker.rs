//! Partition worker: pull, handle with bounded retry, forward or drop, commit

use crate::consumer::dead_letter::DeadLetterForwarder;
use crate::consumer::handler::BoundHandler;
use crate::consumer::retry::{RetryDecision, RetryPolicy};
use crate::consumer::stats::StatCounters;
use crate::consumer::unit::{ConsumptionUnit, UnitSource};
use crate::shutdown::ExitSignal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const TAG: &str = "xserver.consumer.worker";

/// Terminal outcome of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The handler succeeded after `failures` failed attempts
    Succeeded {
        /// Failed attempts before the success
        failures: u32,
    },
    /// Retries were exhausted and the unit went to the dead-letter topic
    Forwarded {
        /// Whether the publish was acknowledged
        delivered: bool,
    },
    /// Retries were exhausted and no dead-letter topic is configured
    Dropped,
}

impl UnitOutcome {
    /// Whether the handler eventually succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded { .. })
    }
}

/// Everything a worker needs besides its source
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Broker family label for logs
    pub family: &'static str,
    /// Index of the worker within its topic
    pub worker_id: usize,
    /// Handler bound to the topic
    pub handler: BoundHandler,
    /// Retry policy of the topic
    pub policy: RetryPolicy,
    /// Present when the topic has a dead-letter topic
    pub forwarder: Option<DeadLetterForwarder>,
    /// Family counters
    pub stats: Arc<StatCounters>,
}

/// Consume until `exit` fires or the source closes.
///
/// Units are processed strictly one at a time: the next unit is not pulled
/// until the previous one has been committed. The exit signal is only
/// observed between units, never while a handler runs.
pub async fn run_worker(mut source: Box<dyn UnitSource>, ctx: WorkerContext, exit: ExitSignal) {
    info!(target: TAG, family = ctx.family, worker = ctx.worker_id, "worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = exit.fired() => None,
            next = source.next_unit() => Some(next),
        };

        let unit = match next {
            None => {
                warn!(target: TAG, "[Quit] accept quit signal");
                break;
            }
            Some(None) => {
                warn!(target: TAG, "source closed, worker {} stopping", ctx.worker_id);
                break;
            }
            Some(Some(Err(e))) => {
                error!(target: TAG, "consumer errors, err:{}", e);
                continue;
            }
            Some(Some(Ok(unit))) => unit,
        };

        if exit.is_fired() {
            // Uncommitted, so the broker redelivers it.
            warn!(target: TAG, "[Quit] accept quit signal, leaving pulled unit uncommitted");
            break;
        }

        let mut unit = unit;
        let outcome = process_unit(&ctx, &mut unit).await;
        if outcome.is_success() {
            ctx.stats.record_success();
        } else {
            ctx.stats.record_failure();
        }

        let token = unit.into_token();
        debug!(target: TAG, "committing {:?} after {:?}", token, outcome);
        if let Err(e) = source.commit(token).await {
            error!(target: TAG, "commit offset error:{}", e);
        }
    }

    if let Err(e) = source.flush().await {
        error!(target: TAG, "[Quit] commit offset error:{}", e);
    }
    info!(target: TAG, family = ctx.family, worker = ctx.worker_id, "worker stopped");
}

/// Drive one unit to a terminal outcome
pub async fn process_unit(ctx: &WorkerContext, unit: &mut ConsumptionUnit) -> UnitOutcome {
    loop {
        let err = match ctx.handler.invoke(unit.delivery()).await {
            Ok(()) => {
                let d = unit.delivery();
                debug!(
                    target: TAG,
                    "[Consumer] success,key:{},offset:{},partition:{}",
                    d.key_lossy(),
                    d.offset,
                    d.partition
                );
                return UnitOutcome::Succeeded {
                    failures: unit.attempt(),
                };
            }
            Err(err) => err,
        };

        let d = unit.delivery();
        error!(
            target: TAG,
            "[Consumer] failed:key:{},val:{},offset:{},partition:{},attempt:{},err:{}",
            d.key_lossy(),
            String::from_utf8_lossy(&d.value),
            d.offset,
            d.partition,
            unit.attempt(),
            err
        );

        let decision = ctx.policy.decide(unit.attempt());
        unit.record_failure();

        match decision {
            RetryDecision::Retry => continue,
            RetryDecision::ForwardToDeadLetter => return forward(ctx, unit).await,
            RetryDecision::Drop => {
                let d = unit.delivery();
                error!(
                    target: TAG,
                    "[Consumer] unset fail topic:key:{},val:{},offset:{},partition:{}",
                    d.key_lossy(),
                    String::from_utf8_lossy(&d.value),
                    d.offset,
                    d.partition
                );
                return UnitOutcome::Dropped;
            }
        }
    }
}

async fn forward(ctx: &WorkerContext, unit: &ConsumptionUnit) -> UnitOutcome {
    let d = unit.delivery();
    let (Some(forwarder), Some(topic)) = (&ctx.forwarder, &ctx.policy.dead_letter_topic) else {
        error!(
            target: TAG,
            "[Consumer] no dead-letter publisher, dropping key:{},offset:{},partition:{}",
            d.key_lossy(),
            d.offset,
            d.partition
        );
        return UnitOutcome::Dropped;
    };

    match forwarder.forward(topic, d.key.as_deref(), &d.value).await {
        Ok(()) => {
            debug!(
                target: TAG,
                "[Consumer] send to fail topic,key:{},offset:{},partition:{}",
                d.key_lossy(),
                d.offset,
                d.partition
            );
            UnitOutcome::Forwarded { delivered: true }
        }
        Err(e) => {
            error!(
                target: TAG,
                "[Consumer] send to fail topic failed,topic:{},val:{},err:{}",
                topic,
                String::from_utf8_lossy(&d.value),
                e
            );
            UnitOutcome::Forwarded { delivered: false }
        }
    }
}
