//! Broker-agnostic consumer engine.
//!
//! A [`BrokerFamily`] knows how to talk to one broker technology; the
//! [`BrokerConsumer`] owns the workers, the stat reporter and the drain for
//! every topic of that family.

use crate::consumer::config::ConsumerOptions;
use crate::consumer::dead_letter::{DeadLetterForwarder, Publisher, SharedPublisher};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::handler::HandlerRegistry;
use crate::consumer::retry::RetryPolicy;
use crate::consumer::stats::{spawn_reporter, StatCounters};
use crate::consumer::unit::UnitSource;
use crate::consumer::worker::{run_worker, WorkerContext};
use crate::shutdown::{bounded_wait, DrainOutcome, ExitSignal};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

const TAG: &str = "xserver.consumer.broker";

/// Broker technologies a process can supervise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BrokerKind {
    /// Apache Kafka
    Kafka,
    /// Apache RocketMQ
    RocketMq,
}

impl BrokerKind {
    /// Label used in logs and stat lines
    pub fn label(&self) -> &'static str {
        match self {
            BrokerKind::Kafka => "Kafka",
            BrokerKind::RocketMq => "RocketMQ",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One configured topic group, before handler resolution
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPlan {
    /// Position of the group in the family's configuration
    pub index: usize,
    /// Topic label (may list several topics for Kafka)
    pub topic: String,
    /// Name of the handler to bind
    pub handler: String,
    /// Number of workers to run
    pub workers: usize,
    /// Local retry and dead-letter policy
    pub policy: RetryPolicy,
}

/// Connection logic for one broker technology
#[async_trait]
pub trait BrokerFamily: Send + Sync + 'static {
    /// Which technology this is
    fn kind(&self) -> BrokerKind;

    /// Validated topic groups to consume
    fn plans(&self) -> ConsumerResult<Vec<TopicPlan>>;

    /// Open the source for one worker of a topic group
    async fn open(&self, plan: &TopicPlan, worker_id: usize) -> ConsumerResult<Box<dyn UnitSource>>;

    /// Publisher for a topic group that has a dead-letter topic.
    ///
    /// Implementations construct through `shared` so that one publisher
    /// serves the whole process.
    async fn dead_letter_publisher(
        &self,
        plan: &TopicPlan,
        shared: &SharedPublisher,
    ) -> ConsumerResult<Arc<dyn Publisher>>;
}

/// Lifecycle of a [`BrokerConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Sources are being opened.
    ///
    /// This state only lasts for the duration of [`BrokerConsumer::start`],
    /// which returns a consumer that is already `Running`; it shows up in the
    /// start log, never through [`BrokerConsumer::state`].
    Initializing,
    /// Workers are consuming
    Running,
    /// The exit signal fired; waiting for workers
    Draining,
    /// Workers finished or the drain timed out
    Closed,
}

/// Running consumers of one broker family
pub struct BrokerConsumer {
    kind: BrokerKind,
    exit: ExitSignal,
    tracker: TaskTracker,
    stats: Arc<StatCounters>,
    reporter: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<ConsumerState>,
    drain_timeout: Duration,
    workers: usize,
    skipped: Vec<ConsumerError>,
    closed: OnceCell<DrainOutcome>,
}

impl fmt::Debug for BrokerConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConsumer")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("workers", &self.workers)
            .field("skipped", &self.skipped)
            .finish()
    }
}

struct PreparedWorker {
    ctx: WorkerContext,
    topic: String,
    source: Box<dyn UnitSource>,
}

impl BrokerConsumer {
    /// Open every source of `family` and start its workers.
    ///
    /// All sources are opened before any worker starts; an error while opening
    /// aborts the whole family and nothing is left running. Topic groups whose
    /// handler is not registered are skipped with a warning.
    pub async fn start(
        family: &dyn BrokerFamily,
        registry: &HandlerRegistry,
        publisher: &SharedPublisher,
        options: &ConsumerOptions,
    ) -> ConsumerResult<Self> {
        let kind = family.kind();
        debug!(target: TAG, "{} consumer {:?}", kind, ConsumerState::Initializing);
        let plans = family.plans()?;
        if plans.is_empty() {
            return Err(ConsumerError::ConfigError(format!("{} config not found", kind)));
        }

        let stats = Arc::new(StatCounters::new());
        let mut prepared = Vec::new();
        let mut skipped = Vec::new();

        for plan in &plans {
            let Some(handler) = registry.get(&plan.handler) else {
                let unconfigured = ConsumerError::HandlerNotFound {
                    topic: plan.topic.clone(),
                    handler: plan.handler.clone(),
                };
                warn!(target: TAG, "{} consumer unconfigured, {}, skipping", kind, unconfigured);
                skipped.push(unconfigured);
                continue;
            };

            if plan.workers == 0 {
                warn!(target: TAG, "topic:{}, consumerCount is 0, no workers started", plan.topic);
                continue;
            }

            let forwarder = match &plan.policy.dead_letter_topic {
                Some(_) => {
                    let publisher = family.dead_letter_publisher(plan, publisher).await?;
                    Some(DeadLetterForwarder::new(publisher).with_max_attempts(options.forward_attempts))
                }
                None => None,
            };

            for worker_id in 0..plan.workers {
                let source = family.open(plan, worker_id).await?;
                prepared.push(PreparedWorker {
                    ctx: WorkerContext {
                        family: kind.label(),
                        worker_id,
                        handler: handler.clone(),
                        policy: plan.policy.clone(),
                        forwarder: forwarder.clone(),
                        stats: stats.clone(),
                    },
                    topic: plan.topic.clone(),
                    source,
                });
            }
        }

        let exit = ExitSignal::new();
        let tracker = TaskTracker::new();
        let workers = prepared.len();

        for PreparedWorker { ctx, topic, source } in prepared {
            let span = info_span!("worker", family = kind.label(), topic = %topic, id = ctx.worker_id);
            tracker.spawn(run_worker(source, ctx, exit.clone()).instrument(span));
        }
        tracker.close();

        let reporter = spawn_reporter(kind.label(), stats.clone(), options.stat_interval, exit.token().clone());

        info!(target: TAG, "{} consumer started with {} workers", kind, workers);

        Ok(Self {
            kind,
            exit,
            tracker,
            stats,
            reporter: Mutex::new(Some(reporter)),
            state: Mutex::new(ConsumerState::Running),
            drain_timeout: options.drain_timeout,
            workers,
            skipped,
            closed: OnceCell::new(),
        })
    }

    /// Which family this is
    pub fn kind(&self) -> BrokerKind {
        self.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of workers started
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Why topic groups were skipped, one [`ConsumerError::HandlerNotFound`] each
    pub fn skipped(&self) -> &[ConsumerError] {
        &self.skipped
    }

    /// Topics skipped because their handler was not registered
    pub fn skipped_topics(&self) -> Vec<&str> {
        self.skipped
            .iter()
            .filter_map(|e| match e {
                ConsumerError::HandlerNotFound { topic, .. } => Some(topic.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Counters of this family
    pub fn stats(&self) -> &Arc<StatCounters> {
        &self.stats
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Fire the exit signal and wait, bounded, for every worker.
    ///
    /// Returns even if a handler is stuck; such workers are abandoned. Calling
    /// again returns the first outcome.
    pub async fn close(&self) -> DrainOutcome {
        *self
            .closed
            .get_or_init(|| async {
                self.set_state(ConsumerState::Draining);
                info!(target: TAG, "{} consumer closing", self.kind);
                self.exit.fire();

                let outcome = bounded_wait(self.tracker.wait(), self.drain_timeout).await;
                match outcome {
                    DrainOutcome::Completed { elapsed } => {
                        info!(target: TAG, "{} consumer closed in {:?}", self.kind, elapsed);
                    }
                    DrainOutcome::TimedOut { limit } => {
                        error!(
                            target: TAG,
                            "{} close consumers wait timeout after {:?}, close incomplete",
                            self.kind, limit
                        );
                    }
                }

                let reporter = self
                    .reporter
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(reporter) = reporter {
                    if let Err(e) = reporter.await {
                        warn!(target: TAG, "stat reporter ended abnormally: {}", e);
                    }
                }

                self.set_state(ConsumerState::Closed);
                outcome
            })
            .await
    }
}
