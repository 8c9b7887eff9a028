//! Built-in start and stop hooks

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How the process logs
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Log at debug level unless `RUST_LOG` says otherwise
    pub debug: bool,
    /// Emit JSON records instead of plain text
    pub json: bool,
    /// Export spans over OTLP
    #[cfg(feature = "telemetry")]
    pub telemetry: Option<crate::telemetry::TelemetryConfig>,
}

impl LogSettings {
    /// Default level when `RUST_LOG` is unset
    pub fn default_level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.default_level().into())
            .from_env_lossy()
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn install_subscriber(settings: &LogSettings) -> anyhow::Result<()> {
    #[cfg(feature = "telemetry")]
    let otel = settings
        .telemetry
        .as_ref()
        .map(crate::telemetry::layer)
        .transpose()?;
    #[cfg(not(feature = "telemetry"))]
    let otel: Option<tracing_subscriber::layer::Identity> = None;

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(settings.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!settings.json).then(tracing_subscriber::fmt::layer))
        .with(otel)
        .try_init()?;
    Ok(())
}

/// Start hook installing the tracing subscriber
pub fn init_tracing(settings: LogSettings) -> impl FnOnce() -> anyhow::Result<()> + Send + 'static {
    move || install_subscriber(&settings)
}

/// Stop hook flushing exported spans; a no-op without the `telemetry` feature
pub fn flush_tracing() -> impl FnOnce() + Send + 'static {
    || {
        #[cfg(feature = "telemetry")]
        crate::telemetry::shutdown_telemetry();
        tracing::info!(target: "xserver.bootstrap", "logging flushed");
    }
}
