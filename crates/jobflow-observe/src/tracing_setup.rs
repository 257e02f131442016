//! Tracing subscriber setup with an optional OpenTelemetry stdout exporter.
//!
//! Call [`init_tracing`] once at host startup and [`shutdown_tracing`] before
//! exit so buffered spans are flushed.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde::Deserialize;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Directive used when neither `RUST_LOG` nor the configuration yields a
/// valid filter.
pub const DEFAULT_FILTER: &str = "info";

/// Held so [`shutdown_tracing`] can flush the exporter.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// The `[logging]` section of the engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG` when set.
    pub filter: String,
    pub format: LogFormat,
    /// Export spans through the OpenTelemetry stdout exporter.
    pub otel: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            otel: false,
        }
    }
}

/// Pick a filter: the environment directive if valid, then the configured
/// one, then [`DEFAULT_FILTER`].
fn filter_from(env_directive: Option<&str>, configured: &str) -> EnvFilter {
    if let Some(directive) = env_directive {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("ignoring invalid RUST_LOG '{directive}': {e}"),
        }
    }
    EnvFilter::try_new(configured).unwrap_or_else(|e| {
        eprintln!("ignoring invalid log filter '{configured}': {e}");
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Build the `EnvFilter` for a logging configuration.
pub fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let env_directive = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    filter_from(env_directive.as_deref(), &config.filter)
}

/// Install the global subscriber.
///
/// Always adds a fmt layer in the configured format. When `config.otel` is
/// set, also adds an OpenTelemetry layer exporting to stdout. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = build_env_filter(config);

    let (pretty_layer, json_layer) = match config.format {
        LogFormat::Pretty => (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
        ),
    };

    let otel_layer = if config.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("jobflow");
        opentelemetry::global::set_tracer_provider(provider.clone());
        // A second init keeps the first provider; the subscriber install
        // below fails in that case anyway.
        let _ = TRACER_PROVIDER.set(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::debug!(log_format = ?config.format, otel = config.otel, "tracing initialized");
    Ok(())
}

/// Flush and shut down the OpenTelemetry provider, if one was installed.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {e:?}");
        }
    }
}
