use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Transport used to reach the OTLP collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

impl fmt::Display for OtlpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Grpc => "grpc",
            Self::Http => "http",
        })
    }
}

/// `[telemetry]`: log filtering and optional span export.
///
/// Spans cover HTTP requests, client status changes, backups and restores.
/// Only one session is managed, so every span is kept unless
/// `sample_ratio` says otherwise.
///
/// ```toml
/// [telemetry]
/// log_filter = "info,tether_store=debug"
/// enabled = true
/// endpoint = "http://otel-collector:4317"
/// ```
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    pub log_filter: String,
    /// Export spans over OTLP.
    pub enabled: bool,
    pub endpoint: String,
    pub protocol: OtlpProtocol,
    /// Reported as `service.name`.
    pub service_name: String,
    /// Fraction of traces exported, between 0.0 and 1.0.
    pub sample_ratio: f64,
    pub timeout_seconds: u64,
    /// Extra resource attributes, e.g. `deployment.environment`.
    pub resource_attributes: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_owned(),
            enabled: false,
            endpoint: "http://localhost:4317".to_owned(),
            protocol: OtlpProtocol::Grpc,
            service_name: "tether".to_owned(),
            sample_ratio: 1.0,
            timeout_seconds: 10,
            resource_attributes: BTreeMap::new(),
        }
    }
}

impl TelemetryConfig {
    pub(crate) fn sample_ratio_is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.sample_ratio)
    }
}
