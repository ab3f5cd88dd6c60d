use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "timeline-server";
const OTEL_STDOUT_ENV: &str = "TIMELINE_OTEL_STDOUT";

/// Bucket bounds for `timeline_mutation_duration_ms`; store round trips are
/// expected to sit well under a second.
const MUTATION_BUCKETS_MS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Installs the global Prometheus recorder and the tracing subscriber.
    /// Spans are additionally exported to stdout when `TIMELINE_OTEL_STDOUT`
    /// is truthy.
    pub fn init() -> Result<Self> {
        let metrics_handle = prometheus_builder()?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout exporter enabled ({OTEL_STDOUT_ENV}=1)");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(
                    error = %err,
                    "failed to shutdown OpenTelemetry tracer provider"
                );
            }
        }
    }
}

/// A Prometheus handle backed by a recorder that is not installed globally.
/// Embedders and tests use it to serve `/metrics` without touching process
/// state.
pub fn detached_metrics_handle() -> Result<PrometheusHandle> {
    Ok(prometheus_builder()?.build_recorder().handle())
}

fn prometheus_builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("timeline_mutation_duration_ms".to_string()),
            MUTATION_BUCKETS_MS,
        )
        .context("invalid histogram buckets")
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
