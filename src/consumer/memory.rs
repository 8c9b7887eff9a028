//! In-process unit source and broker family, fed from memory.
//!
//! Useful for exercising handlers and the worker engine without a broker.
//! Every pull, commit and flush is recorded on a [`MemoryProbe`].

use crate::consumer::broker::{BrokerFamily, BrokerKind, TopicPlan};
use crate::consumer::dead_letter::{Publisher, SharedPublisher};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::unit::{CommitToken, ConsumptionUnit, Delivery, UnitSource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct ProbeState {
    pulled: Vec<i64>,
    committed: Vec<i64>,
    commits_per_token: HashMap<(String, i32, i64), usize>,
    flushes: usize,
}

/// Shared view of what a [`MemorySource`] did
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MemoryProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offsets in the order they were pulled
    pub fn pulled_offsets(&self) -> Vec<i64> {
        self.lock().pulled.clone()
    }

    /// Offsets in the order they were committed
    pub fn committed_offsets(&self) -> Vec<i64> {
        self.lock().committed.clone()
    }

    /// Highest number of commits seen for a single position
    pub fn max_commits_per_token(&self) -> usize {
        self.lock().commits_per_token.values().copied().max().unwrap_or(0)
    }

    /// Number of flushes
    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }
}

/// Sender side of an open [`MemorySource`]
#[derive(Debug, Clone)]
pub struct MemoryFeeder {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl MemoryFeeder {
    /// Queue a delivery; returns false once the source is gone
    pub fn push(&self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }
}

/// A [`UnitSource`] reading deliveries from an in-process queue
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Delivery>,
    probe: MemoryProbe,
}

impl MemorySource {
    /// A source yielding `deliveries` in order, then closing
    pub fn new(deliveries: Vec<Delivery>) -> (Self, MemoryProbe) {
        let (source, feeder, probe) = Self::channel();
        for delivery in deliveries {
            feeder.push(delivery);
        }
        (source, probe)
    }

    /// A source that stays open until every feeder is dropped
    pub fn channel() -> (Self, MemoryFeeder, MemoryProbe) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = MemoryProbe::default();
        (
            Self {
                rx,
                probe: probe.clone(),
            },
            MemoryFeeder { tx },
            probe,
        )
    }
}

#[async_trait]
impl UnitSource for MemorySource {
    async fn next_unit(&mut self) -> Option<ConsumerResult<ConsumptionUnit>> {
        let delivery = self.rx.recv().await?;
        self.probe.lock().pulled.push(delivery.offset);
        Some(Ok(ConsumptionUnit::at_position(delivery)))
    }

    async fn commit(&mut self, token: CommitToken) -> ConsumerResult<()> {
        let mut state = self.probe.lock();
        state.committed.push(token.offset());
        *state
            .commits_per_token
            .entry((token.topic().to_string(), token.partition(), token.offset()))
            .or_default() += 1;
        Ok(())
    }

    async fn flush(&mut self) -> ConsumerResult<()> {
        self.probe.lock().flushes += 1;
        Ok(())
    }
}

/// Feeder and probe of one worker opened by a [`MemoryFamily`]
#[derive(Debug, Clone)]
pub struct OpenedWorker {
    /// Topic the worker consumes
    pub topic: String,
    /// Worker index within the topic
    pub worker_id: usize,
    /// Push deliveries to this worker
    pub feeder: MemoryFeeder,
    /// What the worker's source saw
    pub probe: MemoryProbe,
}

/// A broker family whose sources are in-process queues.
///
/// Each opened source is kept open by a [`MemoryFeeder`] retained on the
/// family, so workers block in `next_unit` until the exit signal fires.
pub struct MemoryFamily {
    kind: BrokerKind,
    plans: Vec<TopicPlan>,
    publisher: Option<Arc<dyn Publisher>>,
    opened: Mutex<Vec<OpenedWorker>>,
    fail_open: Option<String>,
}

impl MemoryFamily {
    /// A family of `kind` consuming `plans`
    pub fn new(kind: BrokerKind, plans: Vec<TopicPlan>) -> Self {
        Self {
            kind,
            plans,
            publisher: None,
            opened: Mutex::new(Vec::new()),
            fail_open: None,
        }
    }

    /// Dead-letter publisher installed into the shared slot on demand
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Make every `open` fail with a connection error
    pub fn failing_open(mut self, reason: impl Into<String>) -> Self {
        self.fail_open = Some(reason.into());
        self
    }

    /// Workers opened so far
    pub fn opened(&self) -> Vec<OpenedWorker> {
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl BrokerFamily for MemoryFamily {
    fn kind(&self) -> BrokerKind {
        self.kind
    }

    fn plans(&self) -> ConsumerResult<Vec<TopicPlan>> {
        Ok(self.plans.clone())
    }

    async fn open(&self, plan: &TopicPlan, worker_id: usize) -> ConsumerResult<Box<dyn UnitSource>> {
        if let Some(reason) = &self.fail_open {
            return Err(ConsumerError::ConnectionError(reason.clone()));
        }
        let (source, feeder, probe) = MemorySource::channel();
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(OpenedWorker {
                topic: plan.topic.clone(),
                worker_id,
                feeder,
                probe,
            });
        Ok(Box::new(source))
    }

    async fn dead_letter_publisher(
        &self,
        _plan: &TopicPlan,
        shared: &SharedPublisher,
    ) -> ConsumerResult<Arc<dyn Publisher>> {
        let publisher = self.publisher.clone();
        shared
            .get_or_try_init(|| async move {
                publisher.ok_or_else(|| ConsumerError::DeadLetterError("no publisher configured".to_string()))
            })
            .await
    }
}
