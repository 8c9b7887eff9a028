//! Server running named one-shot jobs

use crate::bootstrap::LifecycleCoordinator;
use crate::server::error::{ServerError, ServerResult};
use crate::server::{wait_for_shutdown, Server, ShutdownTrigger, SignalListener, DEFAULT_GRACE_PERIOD};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const TAG: &str = "xserver.JobServer";

type JobTask = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named job
#[derive(Clone)]
pub struct Job {
    name: String,
    task: JobTask,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish()
    }
}

impl Job {
    /// Wrap an async task under a name
    pub fn new<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            task: Arc::new(move || task().boxed()),
        }
    }

    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the job once
    pub async fn run(&self) -> anyhow::Result<()> {
        (self.task)().await
    }
}

/// Chooses which registered jobs a run executes
pub trait JobSelector: Send + Sync {
    /// Pick jobs out of the registered ones
    fn select(&self, jobs: &BTreeMap<String, Job>) -> ServerResult<Vec<Job>>;
}

/// Selects the single job with a given name
#[derive(Debug, Clone, Default)]
pub struct NamedJobSelector {
    name: Option<String>,
}

impl NamedJobSelector {
    /// Select `name`; `None` fails selection
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }
}

impl JobSelector for NamedJobSelector {
    fn select(&self, jobs: &BTreeMap<String, Job>) -> ServerResult<Vec<Job>> {
        let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) else {
            return Err(ServerError::JobSelection(
                "no job selected, pass a job name such as --task testJob".to_string(),
            ));
        };
        match jobs.get(name) {
            Some(job) => Ok(vec![job.clone()]),
            None => Err(ServerError::JobSelection(format!("not found [ {} ] job", name))),
        }
    }
}

/// Runs the selected jobs concurrently, then shuts down
pub struct JobServer {
    lifecycle: LifecycleCoordinator,
    jobs: BTreeMap<String, Job>,
    selector: Box<dyn JobSelector>,
    grace_period: Duration,
    trigger: ShutdownTrigger,
}

impl JobServer {
    /// Create a server choosing jobs with `selector`
    pub fn new(selector: impl JobSelector + 'static) -> Self {
        Self {
            lifecycle: LifecycleCoordinator::new(),
            jobs: BTreeMap::new(),
            selector: Box::new(selector),
            grace_period: DEFAULT_GRACE_PERIOD,
            trigger: ShutdownTrigger::default(),
        }
    }

    /// Register a job; a later job with the same name replaces the earlier one
    pub fn add_job<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = Job::new(name, task);
        self.jobs.insert(job.name.clone(), job);
    }

    /// Pause between the stop hooks and the return of `serve()`
    pub fn set_grace_period(&mut self, grace_period: Duration) {
        self.grace_period = grace_period;
    }

    /// Handle requesting shutdown without a process signal
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    async fn run_jobs(jobs: Vec<Job>) {
        info!(target: TAG, "[start] JobServer Process");
        let mut running = JoinSet::new();
        for job in jobs {
            running.spawn(async move {
                info!(target: TAG, "[start] job name:{}", job.name);
                if let Err(e) = job.run().await {
                    error!(target: TAG, "[{}] run failed,error: {:#}", job.name, e);
                }
                info!(target: TAG, "[end] job name:{}", job.name);
            });
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(target: TAG, "job task ended abnormally: {}", e);
            }
        }
        info!(target: TAG, "[end] JobServer Process");
    }
}

#[async_trait]
impl Server for JobServer {
    fn add_start_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.lifecycle.add_start_hook(hook);
    }

    fn add_stop_hook<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifecycle.add_stop_hook(hook);
    }

    /// Jobs still running when a shutdown is requested are aborted before the
    /// stop hooks run
    async fn serve(mut self) -> ServerResult<()> {
        let _signals = SignalListener::spawn(&self.trigger);
        if let Err(e) = self.lifecycle.run_start() {
            error!(target: TAG, "start failed: {}", e);
            return Err(e);
        }

        let selected = self.selector.select(&self.jobs);
        let result = match selected {
            Ok(jobs) => {
                let mut work = tokio::spawn(Self::run_jobs(jobs));
                tokio::select! {
                    joined = &mut work => {
                        if let Err(e) = joined {
                            error!(target: TAG, "job runner ended abnormally: {}", e);
                        }
                    }
                    _ = wait_for_shutdown(&self.trigger) => {
                        warn!(target: TAG, "shutdown requested while jobs were running");
                        work.abort();
                    }
                }
                Ok(())
            }
            Err(e) => {
                error!(target: TAG, "parse failed:{}", e);
                Err(e)
            }
        };

        info!(target: TAG, "Stop...");
        self.lifecycle.run_stop();
        tokio::time::sleep(self.grace_period).await;
        result
    }
}
