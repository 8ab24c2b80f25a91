use crate::config::Environment;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Initialize the global tracing subscriber.
///
/// Pretty, colored output in development and JSON lines in production so the
/// detector's logs can be shipped next to the robot's other nodes. `RUST_LOG`
/// overrides the default `info` filter.
///
/// The OpenTelemetry layer is always installed; it is inert until a tracer
/// provider is registered (see [`crate::TelemetryGuard`]).
pub fn setup_logging(environment: Environment) {
    if let Err(e) = try_setup_logging(environment) {
        eprintln!("Logging already initialized: {e}");
    }
}

/// Same as [`setup_logging`] but reports a second initialization instead of
/// printing it.
pub fn try_setup_logging(
    environment: Environment,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_opentelemetry::layer());

    match environment {
        Environment::Production => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_level(true)
                    .with_current_span(true),
            )
            .try_init(),
        Environment::Development => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_target(false),
            )
            .try_init(),
    }
}
