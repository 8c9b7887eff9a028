//! Job server lifecycle

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use xserver_rs::server::{JobServer, NamedJobSelector, Server, ServerError};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

fn server_for(name: Option<&str>, log: &Log) -> JobServer {
    let mut server = JobServer::new(NamedJobSelector::new(name.map(str::to_string)));
    server.set_grace_period(Duration::from_millis(10));

    let jobs = log.clone();
    server.add_job("rebuildIndex", move || {
        let jobs = jobs.clone();
        async move {
            record(&jobs, "rebuildIndex");
            Ok::<(), anyhow::Error>(())
        }
    });
    let jobs = log.clone();
    server.add_job("purgeCache", move || {
        let jobs = jobs.clone();
        async move {
            record(&jobs, "purgeCache");
            Err::<(), _>(anyhow::anyhow!("cache unavailable"))
        }
    });

    let hooks = log.clone();
    server.add_start_hook(move || {
        record(&hooks, "start");
        Ok(())
    });
    let hooks = log.clone();
    server.add_stop_hook(move || record(&hooks, "stop"));
    server
}

#[tokio::test]
async fn test_selected_job_runs_then_stop_hooks() {
    let log = Log::default();
    server_for(Some("rebuildIndex"), &log).serve().await.unwrap();
    assert_eq!(log.lock().unwrap().clone(), vec!["start", "rebuildIndex", "stop"]);
}

#[tokio::test]
async fn test_failing_job_still_completes_serve() {
    let log = Log::default();
    server_for(Some("purgeCache"), &log).serve().await.unwrap();
    assert_eq!(log.lock().unwrap().clone(), vec!["start", "purgeCache", "stop"]);
}

#[tokio::test]
async fn test_unknown_job_fails_after_stop_hooks() {
    let log = Log::default();
    let err = server_for(Some("compact"), &log).serve().await.unwrap_err();
    assert!(matches!(err, ServerError::JobSelection(ref msg) if msg.contains("compact")));
    assert_eq!(log.lock().unwrap().clone(), vec!["start", "stop"]);
}

#[tokio::test]
async fn test_no_job_name_fails() {
    let log = Log::default();
    let err = server_for(None, &log).serve().await.unwrap_err();
    assert!(matches!(err, ServerError::JobSelection(_)));
}

#[tokio::test]
async fn test_shutdown_interrupts_long_job() {
    let mut server = JobServer::new(NamedJobSelector::new(Some("forever".to_string())));
    server.set_grace_period(Duration::from_millis(10));
    server.add_job("forever", || async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<(), anyhow::Error>(())
    });

    let trigger = server.shutdown_trigger();
    let serving = tokio::spawn(server.serve());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    trigger.fire();
    serving.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}
