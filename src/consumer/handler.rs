//! Message handlers and the registry that binds them to topics by name

use crate::consumer::unit::Delivery;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use thiserror::Error;
use tracing::error;

const TAG: &str = "xserver.consumer.handler";

/// Callback invoked for every unit of a topic bound to it.
///
/// `extra` carries the family's auxiliary keys: the message key for Kafka,
/// the message tags for RocketMQ. Handlers must be idempotent; delivery is
/// at-least-once.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message
    async fn handle(&self, topic: &str, payload: &[u8], extra: &[String]) -> anyhow::Result<()>;
}

/// Outcome of a failed handler invocation
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("handler {name} failed: {source}")]
    Failed {
        /// Registered handler name
        name: String,
        /// Error returned by the handler
        source: anyhow::Error,
    },

    /// The handler panicked; the panic was contained
    #[error("handler {name} panicked at {location}: {message}")]
    Panicked {
        /// Registered handler name
        name: String,
        /// Panic payload rendered as text
        message: String,
        /// Source location of the panic
        location: String,
    },
}

/// Adapter turning a synchronous closure into a [`MessageHandler`]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&str, &[u8], &[String]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F> MessageHandler for HandlerFn<F>
where
    F: Fn(&str, &[u8], &[String]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, topic: &str, payload: &[u8], extra: &[String]) -> anyhow::Result<()> {
        (self.f)(topic, payload, extra)
    }
}

/// Boxed future returned by [`async_handler_fn`] closures
pub type BoxedHandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Adapter turning a closure returning a future into a [`MessageHandler`].
///
/// The closure receives owned copies of the topic, payload and extra keys.
pub struct AsyncHandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a handler
pub fn async_handler_fn<F, Fut>(f: F) -> AsyncHandlerFn<impl Fn(String, Vec<u8>, Vec<String>) -> BoxedHandlerFuture + Send + Sync + 'static>
where
    F: Fn(String, Vec<u8>, Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    AsyncHandlerFn {
        f: move |topic, payload, extra| Box::pin(f(topic, payload, extra)) as BoxedHandlerFuture,
    }
}

#[async_trait]
impl<F> MessageHandler for AsyncHandlerFn<F>
where
    F: Fn(String, Vec<u8>, Vec<String>) -> BoxedHandlerFuture + Send + Sync + 'static,
{
    async fn handle(&self, topic: &str, payload: &[u8], extra: &[String]) -> anyhow::Result<()> {
        (self.f)(topic.to_string(), payload.to_vec(), extra.to_vec()).await
    }
}

/// A handler resolved from the registry, carrying its registered name
#[derive(Clone)]
pub struct BoundHandler {
    name: Arc<str>,
    handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for BoundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundHandler")
            .field("name", &self.name)
            .finish()
    }
}

impl BoundHandler {
    /// Registered name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the handler for a delivery.
    ///
    /// This is the single point where external callback code runs: errors and
    /// panics both come back as a [`HandlerError`], so a faulty handler never
    /// takes its worker down.
    pub async fn invoke(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        install_panic_capture();
        let call = self
            .handler
            .handle(&delivery.topic, &delivery.value, &delivery.extra);

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(HandlerError::Failed {
                name: self.name.to_string(),
                source,
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let captured = LAST_PANIC.with(|slot| slot.borrow_mut().take());
                let (location, stack) = match captured {
                    Some(CapturedPanic { location, backtrace }) => (location, backtrace),
                    None => ("<unknown>".to_string(), String::new()),
                };
                error!(
                    target: TAG,
                    handler = %self.name,
                    topic = %delivery.topic,
                    "[Recovery] Panic: {} at {}\n stack:{}",
                    message,
                    location,
                    stack
                );
                Err(HandlerError::Panicked {
                    name: self.name.to_string(),
                    message,
                    location,
                })
            }
        }
    }
}

struct CapturedPanic {
    location: String,
    backtrace: String,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<CapturedPanic>> = const { RefCell::new(None) };
}

static PANIC_CAPTURE: Once = Once::new();

/// Chain a panic hook recording where the panic happened and the stack at
/// that point, for the thread that panicked. The previous hook still runs.
fn install_panic_capture() {
    PANIC_CAPTURE.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            let backtrace = Backtrace::force_capture().to_string();
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(CapturedPanic { location, backtrace }));
            previous(info);
        }));
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Immutable mapping from handler name to handler.
///
/// Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, BoundHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

impl HandlerRegistry {
    /// Start building a registry
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Look up a handler by name
    pub fn get(&self, name: &str) -> Option<BoundHandler> {
        self.handlers.get(name).cloned()
    }

    /// Whether a handler with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builder for [`HandlerRegistry`]
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, BoundHandler>,
}

impl HandlerRegistryBuilder {
    /// Register a handler under a unique name; a later registration replaces
    /// an earlier one with the same name
    pub fn register(mut self, name: impl Into<String>, handler: impl MessageHandler) -> Self {
        self.insert(name, Arc::new(handler));
        self
    }

    /// Register an already shared handler
    pub fn register_arc(mut self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.insert(name, handler);
        self
    }

    /// Register in place, for callers holding a mutable builder
    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let name = name.into();
        let bound = BoundHandler {
            name: Arc::from(name.as_str()),
            handler,
        };
        self.handlers.insert(name, bound);
    }

    /// Freeze the registry
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}
