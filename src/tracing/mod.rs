//! Tracing and logging setup.
//!
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! The `REWARDJOIN_LOG` environment variable, in `EnvFilter` syntax,
//! overrides the configured level. Exporting traces is opt-in through
//! a [`TracingConfig`].
//!
//! Each tracing backend implements `TracerBuilder`, which builds the
//! OpenTelemetry tracer the subscriber exports spans to.
use opentelemetry::sdk::trace::Tracer;
use serde::Deserialize;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::tracked_config_err;
use crate::errors::JoinerError;

pub mod jaeger_tracing;
pub mod otlp_tracing;

pub use jaeger_tracing::JaegerConfig;
pub use otlp_tracing::OtlpTracingConfig;

/// Environment variable overriding the configured log filter.
pub const LOG_ENV_VAR: &str = "REWARDJOIN_LOG";

/// Where to export traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TracingConfig {
    Jaeger(JaegerConfig),
    Otlp(OtlpTracingConfig),
}

impl TracingConfig {
    fn builder(&self) -> &dyn TracerBuilder {
        match self {
            Self::Jaeger(conf) => conf,
            Self::Otlp(conf) => conf,
        }
    }
}

/// Trait that all the tracing config should implement.
/// This function should just return the proper `Tracer` for the backend.
trait TracerBuilder {
    fn build(&self) -> Result<Tracer, JoinerError>;
}

pub(crate) fn get_log_level(level: Option<&str>) -> Result<LevelFilter, JoinerError> {
    match level.map(str::to_lowercase).as_deref() {
        None => Ok(LevelFilter::ERROR),
        Some("trace") => Ok(LevelFilter::TRACE),
        Some("debug") => Ok(LevelFilter::DEBUG),
        Some("info") => Ok(LevelFilter::INFO),
        Some("warn") => Ok(LevelFilter::WARN),
        Some("error") => Ok(LevelFilter::ERROR),
        Some(level) => Err(tracked_config_err(&format!("wrong log level: {level}"))),
    }
}

/// Install the global subscriber.
///
/// Must be called from within a Tokio runtime when a [`TracingConfig`]
/// is given, since exporters batch spans on it. If a global subscriber
/// is already installed this only logs a warning.
pub fn setup_tracing(
    config: Option<&TracingConfig>,
    log_level: Option<&str>,
) -> Result<(), JoinerError> {
    let log_level = get_log_level(log_level)?;
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(format!("rewardjoin={log_level}")));

    // Prepare the log layer
    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_filter(filter);

    // If there is a tracing config, set up the global subscriber with
    // both log and telemetry layers, otherwise just logging.
    if let Some(config) = config {
        let tracer = config.builder().build()?;
        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            // Send all traces from the joiner
            .with_filter(Targets::new().with_target("rewardjoin", LevelFilter::TRACE));
        set_global_subscriber(Registry::default().with(logs).with(telemetry));
    } else {
        set_global_subscriber(Registry::default().with(logs));
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // when a process builds more than one pipeline.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    let err = get_log_level(Some("loud")).unwrap_err();
    assert!(err.to_string().contains("wrong log level: loud"));
}

#[test]
fn tracing_config_is_tagged() {
    let config: TracingConfig = serde_json::from_str(
        r#"{"type": "Otlp", "service_name": "joiner", "url": null, "sampling_ratio": 0.5}"#,
    )
    .unwrap();
    assert_eq!(
        config,
        TracingConfig::Otlp(OtlpTracingConfig {
            service_name: "joiner".into(),
            url: None,
            sampling_ratio: 0.5,
        })
    );
}
