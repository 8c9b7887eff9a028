//! End-to-end runs of the consumer server over in-memory brokers

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use xserver_rs::consumer::{
    async_handler_fn, handler_fn, BrokerKind, ConsumerError, ConsumerOptions, ConsumerResult, ConsumerSettings, Delivery,
    EnabledFamilies, MemoryFamily, PublishReceipt, Publisher, RetryPolicy, TopicPlan,
};
use xserver_rs::server::{ConsumerServer, Server, ServerError};

#[derive(Default)]
struct CollectingPublisher {
    records: Mutex<Vec<(String, Option<Vec<u8>>, Vec<u8>)>>,
}

#[async_trait]
impl Publisher for CollectingPublisher {
    async fn publish(&self, topic: &str, key: Option<&[u8]>, value: &[u8]) -> ConsumerResult<PublishReceipt> {
        let mut records = self.records.lock().unwrap();
        records.push((topic.to_string(), key.map(<[u8]>::to_vec), value.to_vec()));
        Ok(PublishReceipt {
            partition: 0,
            offset: records.len() as i64 - 1,
        })
    }
}

fn plan(topic: &str, handler: &str, workers: usize, policy: RetryPolicy) -> TopicPlan {
    TopicPlan {
        index: 0,
        topic: topic.to_string(),
        handler: handler.to_string(),
        workers,
        policy,
    }
}

fn delivery(topic: &str, offset: i64, value: &[u8]) -> Delivery {
    Delivery {
        topic: topic.to_string(),
        key: Some(format!("k{}", offset).into_bytes()),
        value: value.to_vec(),
        partition: 0,
        offset,
        extra: vec![format!("k{}", offset)],
    }
}

fn kafka_only() -> ConsumerSettings {
    ConsumerSettings {
        enabled: EnabledFamilies {
            kafka: true,
            rocketmq: false,
        },
        ..Default::default()
    }
}

fn quick_server(settings: ConsumerSettings, drain: Duration) -> ConsumerServer {
    let mut server = ConsumerServer::with_settings(settings);
    server.set_grace_period(Duration::from_millis(10));
    server.set_options(ConsumerOptions {
        drain_timeout: drain,
        ..Default::default()
    });
    server
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_consume_forward_and_shutdown() {
    let publisher = Arc::new(CollectingPublisher::default());
    let family = Arc::new(
        MemoryFamily::new(
            BrokerKind::Kafka,
            vec![plan("orders", "orders", 1, RetryPolicy::new(1, Some("orders-fail".to_string())))],
        )
        .with_publisher(publisher.clone()),
    );

    let handled = Arc::new(AtomicU32::new(0));
    let stopped = Arc::new(AtomicBool::new(false));

    let mut server = quick_server(kafka_only(), Duration::from_millis(500));
    server.set_family(family.clone());
    let calls = handled.clone();
    server.add_handler(
        "orders",
        handler_fn(move |_topic, payload, _extra| {
            calls.fetch_add(1, Ordering::SeqCst);
            if payload == b"bad" {
                anyhow::bail!("rejected");
            }
            Ok(())
        }),
    );
    let flag = stopped.clone();
    server.add_stop_hook(move || flag.store(true, Ordering::SeqCst));

    let trigger = server.shutdown_trigger();
    let serving = tokio::spawn(server.serve());

    wait_until(|| !family.opened().is_empty()).await;
    let worker = family.opened().remove(0);
    assert!(worker.feeder.push(delivery("orders", 0, b"good")));
    assert!(worker.feeder.push(delivery("orders", 1, b"bad")));
    wait_until(|| worker.probe.committed_offsets().len() == 2).await;

    assert!(!stopped.load(Ordering::SeqCst));
    trigger.fire();
    serving.await.unwrap().unwrap();

    assert!(stopped.load(Ordering::SeqCst));
    // one call for the good record, first try plus one retry for the bad one
    assert_eq!(handled.load(Ordering::SeqCst), 3);
    assert_eq!(worker.probe.committed_offsets(), vec![0, 1]);
    assert_eq!(worker.probe.max_commits_per_token(), 1);
    assert_eq!(worker.probe.flushes(), 1);

    let records = publisher.records.lock().unwrap().clone();
    assert_eq!(
        records,
        vec![("orders-fail".to_string(), Some(b"k1".to_vec()), b"bad".to_vec())]
    );
}

#[tokio::test]
async fn test_start_hook_failure_starts_nothing() {
    let family = Arc::new(MemoryFamily::new(
        BrokerKind::Kafka,
        vec![plan("orders", "orders", 1, RetryPolicy::no_retry())],
    ));

    let mut server = quick_server(kafka_only(), Duration::from_millis(100));
    server.set_family(family.clone());
    server.add_handler("orders", handler_fn(|_, _, _| Ok(())));
    server.add_start_hook(|| Ok(()));
    server.add_start_hook(|| Err(anyhow::anyhow!("config server unreachable")));

    let err = server.serve().await.unwrap_err();
    assert!(matches!(err, ServerError::StartHook { index: 1, .. }));
    assert!(family.opened().is_empty());
}

#[tokio::test]
async fn test_consumer_start_failure_runs_stop_hooks() {
    let family = Arc::new(
        MemoryFamily::new(BrokerKind::Kafka, vec![plan("orders", "orders", 1, RetryPolicy::no_retry())])
            .failing_open("broker unreachable"),
    );
    let stopped = Arc::new(AtomicBool::new(false));

    let mut server = quick_server(kafka_only(), Duration::from_millis(100));
    server.set_family(family);
    server.add_handler("orders", handler_fn(|_, _, _| Ok(())));
    let flag = stopped.clone();
    server.add_stop_hook(move || flag.store(true, Ordering::SeqCst));

    let err = server.serve().await.unwrap_err();
    assert!(matches!(err, ServerError::Consumer(ConsumerError::ConnectionError(_))));
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_stuck_handler_does_not_block_shutdown() {
    let family = Arc::new(MemoryFamily::new(
        BrokerKind::Kafka,
        vec![plan("slow", "slow", 1, RetryPolicy::no_retry())],
    ));
    let entered = Arc::new(AtomicBool::new(false));

    let mut server = quick_server(kafka_only(), Duration::from_millis(200));
    server.set_family(family.clone());
    let flag = entered.clone();
    server.add_handler(
        "slow",
        async_handler_fn(move |_, _, _| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<(), anyhow::Error>(())
            }
        }),
    );

    let trigger = server.shutdown_trigger();
    let serving = tokio::spawn(server.serve());

    wait_until(|| !family.opened().is_empty()).await;
    let worker = family.opened().remove(0);
    worker.feeder.push(delivery("slow", 0, b"payload"));
    wait_until(|| entered.load(Ordering::SeqCst)).await;

    let started = Instant::now();
    trigger.fire();
    serving.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(worker.probe.committed_offsets().is_empty());
}

#[tokio::test]
async fn test_missing_config_file_fails_serve() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = ConsumerServer::new(Some(dir.path().to_path_buf()));
    server.set_grace_period(Duration::from_millis(10));

    let err = server.serve().await.unwrap_err();
    assert!(matches!(err, ServerError::Consumer(_)));
}
