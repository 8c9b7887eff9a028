//! Server running the broker consumers until shutdown

use crate::bootstrap::LifecycleCoordinator;
use crate::consumer::broker::BrokerFamily;
use crate::consumer::config::{ConsumerOptions, ConsumerSettings};
use crate::consumer::handler::{HandlerRegistry, HandlerRegistryBuilder, MessageHandler};
use crate::consumer::manager::{ConsumerManager, ConsumerManagerBuilder};
use crate::consumer::rocketmq::RocketMqClient;
use crate::server::error::ServerResult;
use crate::server::{wait_for_shutdown, Server, ShutdownTrigger, SignalListener, DEFAULT_GRACE_PERIOD};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const TAG: &str = "xserver.MQConsumerServer";

/// Runs every enabled broker family until SIGINT, SIGTERM or a
/// [`ShutdownTrigger`], then drains them
pub struct ConsumerServer {
    lifecycle: LifecycleCoordinator,
    config_dir: Option<PathBuf>,
    settings: Option<ConsumerSettings>,
    handlers: HandlerRegistryBuilder,
    options: ConsumerOptions,
    grace_period: Duration,
    rocketmq_client: Option<Arc<dyn RocketMqClient>>,
    families: Vec<Arc<dyn BrokerFamily>>,
    trigger: ShutdownTrigger,
}

impl ConsumerServer {
    /// Create a server reading `mq.json` from `config_dir`, or from
    /// `conf/consumer/` under the working directory when `None`
    pub fn new(config_dir: Option<PathBuf>) -> Self {
        Self {
            lifecycle: LifecycleCoordinator::new(),
            config_dir,
            settings: None,
            handlers: HandlerRegistry::builder(),
            options: ConsumerOptions::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            rocketmq_client: None,
            families: Vec::new(),
            trigger: ShutdownTrigger::default(),
        }
    }

    /// Create a server with already loaded settings
    pub fn with_settings(settings: ConsumerSettings) -> Self {
        let mut server = Self::new(None);
        server.settings = Some(settings);
        server
    }

    /// Register a handler under the name topics refer to
    pub fn add_handler(&mut self, name: impl Into<String>, handler: impl MessageHandler) {
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Engine tuning
    pub fn set_options(&mut self, options: ConsumerOptions) {
        self.options = options;
    }

    /// Pause between the stop hooks and the return of `serve()`
    pub fn set_grace_period(&mut self, grace_period: Duration) {
        self.grace_period = grace_period;
    }

    /// Client used by the RocketMQ family
    pub fn set_rocketmq_client(&mut self, client: Arc<dyn RocketMqClient>) {
        self.rocketmq_client = Some(client);
    }

    /// Replace the built-in implementation of a broker family
    pub fn set_family(&mut self, family: Arc<dyn BrokerFamily>) {
        self.families.push(family);
    }

    /// Handle requesting shutdown without a process signal
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    fn load_settings(&mut self) -> ServerResult<ConsumerSettings> {
        match self.settings.take() {
            Some(settings) => Ok(settings),
            None => Ok(ConsumerSettings::load(self.config_dir.as_deref())?),
        }
    }

    async fn start_consumers(&mut self) -> ServerResult<ConsumerManager> {
        let settings = self.load_settings()?;
        let registry = std::mem::take(&mut self.handlers).build();

        let mut builder: ConsumerManagerBuilder =
            ConsumerManager::builder(settings, registry).options(self.options.clone());
        if let Some(client) = self.rocketmq_client.take() {
            builder = builder.rocketmq_client(client);
        }
        for family in self.families.drain(..) {
            builder = builder.family(family);
        }
        Ok(builder.build().await?)
    }
}

#[async_trait]
impl Server for ConsumerServer {
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

    async fn serve(mut self) -> ServerResult<()> {
        let _signals = SignalListener::spawn(&self.trigger);
        if let Err(e) = self.lifecycle.run_start() {
            error!(target: TAG, "start failed: {}", e);
            return Err(e);
        }

        let manager = match self.start_consumers().await {
            Ok(manager) => manager,
            Err(e) => {
                error!(target: TAG, "consumers failed to start: {}", e);
                self.lifecycle.run_stop();
                return Err(e);
            }
        };

        wait_for_shutdown(&self.trigger).await;

        warn!(target: TAG, "Process Stop...");
        let outcome = manager.close().await;
        if !outcome.is_completed() {
            warn!(target: TAG, "consumers did not drain in time: {:?}", outcome);
        }
        self.lifecycle.run_stop();
        warn!(target: TAG, "Process Stop Complete");

        tokio::time::sleep(self.grace_period).await;
        warn!(target: TAG, "Stop Complete.");
        Ok(())
    }
}
