//! OpenTelemetry export of tracing spans
//!
//! Enabled with the `telemetry` feature. The layer is installed together with
//! the log subscriber by [`crate::bootstrap::hooks::init_tracing`]; the
//! matching stop hook [`crate::bootstrap::hooks::flush_tracing`] flushes
//! pending spans after consumers have drained.

use anyhow::Result;
use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{DEPLOYMENT_ENVIRONMENT, SERVICE_NAME, SERVICE_VERSION};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

/// OpenTelemetry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub endpoint: String,
    /// Service name
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Deployment environment (e.g., "production", "staging")
    pub environment: String,
    /// Sampling rate (0.0 to 1.0)
    pub sampling_rate: f64,
    /// Enable trace propagation
    pub propagation: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            service_name: "xserver-rs".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            sampling_rate: 0.1,
            propagation: true,
        }
    }
}

impl TelemetryConfig {
    /// Read the standard OTEL_* variables, falling back to the defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.endpoint),
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: lookup("OTEL_SERVICE_VERSION").unwrap_or(defaults.service_version),
            environment: lookup("DEPLOYMENT_ENVIRONMENT").unwrap_or(defaults.environment),
            sampling_rate: lookup("OTEL_TRACES_SAMPLER_ARG")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sampling_rate),
            propagation: lookup("OTEL_PROPAGATION_ENABLED")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.propagation),
        }
    }
}

/// Build the OTLP export layer
pub fn layer<S>(config: &TelemetryConfig) -> Result<OpenTelemetryLayer<S, Tracer>>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    if config.propagation {
        global::set_text_map_propagator(TraceContextPropagator::new());
    }

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&config.endpoint);

    let resource = Resource::new(vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, config.service_version.clone()),
        KeyValue::new(DEPLOYMENT_ENVIRONMENT, config.environment.clone()),
    ]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(config.sampling_rate))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush pending spans and shut the tracer provider down
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "xserver-rs");
        assert_eq!(config.sampling_rate, 0.1);
        assert!(config.propagation);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = TelemetryConfig::from_lookup(|key| match key {
            "OTEL_SERVICE_NAME" => Some("billing-consumer".to_string()),
            "OTEL_TRACES_SAMPLER_ARG" => Some("not-a-number".to_string()),
            "OTEL_PROPAGATION_ENABLED" => Some("false".to_string()),
            _ => None,
        });
        assert_eq!(config.service_name, "billing-consumer");
        assert_eq!(config.sampling_rate, 0.1);
        assert!(!config.propagation);
        assert_eq!(config.endpoint, "http://localhost:4317");
    }
}
