//! Tracing subscriber setup with an optional OTLP exporter.
//!
//! The `fmt` layer is always installed. With `[telemetry] enabled = true`
//! an OpenTelemetry layer is added so HTTP requests, client lifecycle
//! transitions and store operations reach a collector.

use std::time::Duration;

use opentelemetry::trace::TracerProvider;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{BatchSpanProcessor, Sampler, SdkTracerProvider};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{OtlpProtocol, TelemetryConfig};

const TRACER_NAME: &str = "tether";

/// Handle returned by [`init`]. Call [`TelemetryGuard::shutdown`] before
/// exit to flush pending spans.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            tracing::warn!(error = %e, "tracer provider shutdown failed");
        }
    }
}

/// `RUST_LOG` wins over the configured directives.
fn env_filter(directives: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(directives))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Install `fmt` only. Used by the operator subcommands.
pub fn init_plain(config: &TelemetryConfig) {
    tracing_subscriber::registry()
        .with(env_filter(&config.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install the global subscriber.
///
/// An exporter that fails to build is logged and the server continues with
/// `fmt` output only.
pub fn init(config: &TelemetryConfig) -> TelemetryGuard {
    if !config.enabled {
        init_plain(config);
        return TelemetryGuard { provider: None };
    }

    let exporter = match build_exporter(config) {
        Ok(exporter) => exporter,
        Err(e) => {
            init_plain(config);
            tracing::error!(
                error = %e,
                endpoint = %config.endpoint,
                protocol = %config.protocol,
                "failed to build OTLP exporter, continuing without it"
            );
            return TelemetryGuard { provider: None };
        }
    };

    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_sampler(sampler(config.sample_ratio))
        .with_resource(resource(config))
        .build();
    global::set_tracer_provider(provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME));

    tracing_subscriber::registry()
        .with(env_filter(&config.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    info!(
        endpoint = %config.endpoint,
        protocol = %config.protocol,
        sample_ratio = config.sample_ratio,
        "OpenTelemetry tracing enabled"
    );

    TelemetryGuard {
        provider: Some(provider),
    }
}

fn resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("process.pid", std::process::id().to_string()),
    ];
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        attributes.push(KeyValue::new("host.name", hostname));
    }
    attributes.extend(
        config
            .resource_attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
    );
    Resource::builder().with_attributes(attributes).build()
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

fn build_exporter(
    config: &TelemetryConfig,
) -> Result<opentelemetry_otlp::SpanExporter, opentelemetry::trace::TraceError> {
    let timeout = Duration::from_secs(config.timeout_seconds);
    let builder = opentelemetry_otlp::SpanExporter::builder();

    match config.protocol {
        OtlpProtocol::Http => builder
            .with_http()
            .with_endpoint(&config.endpoint)
            .with_timeout(timeout)
            .build(),
        OtlpProtocol::Grpc => builder
            .with_tonic()
            .with_endpoint(&config.endpoint)
            .with_timeout(timeout)
            .build(),
    }
}
