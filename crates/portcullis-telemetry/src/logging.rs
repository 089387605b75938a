//! Structured logging: JSON to stdout in production, pretty output for
//! development.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::{LogFormat, TelemetryConfig, TelemetryError};

/// Install the global subscriber.
///
/// `RUST_LOG` replaces the configured directives when set.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.directives())
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?,
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Standard log event names. Every gateway log line carries one of these in
/// its `event` field.
pub mod events {
    /// Gateway is starting up.
    pub const STARTUP: &str = "startup";

    /// Gateway is shutting down.
    pub const SHUTDOWN: &str = "shutdown";

    /// Gateway is listening on a socket.
    pub const LISTENING: &str = "listening";

    /// A new stage became active.
    pub const STAGE_PUBLISHED: &str = "stage_published";

    /// A retained stage was removed.
    pub const STAGE_RETIRED: &str = "stage_retired";

    /// Request has been completed.
    pub const REQUEST_COMPLETED: &str = "request_completed";

    /// Request validation failed.
    pub const VALIDATION_FAILURE: &str = "validation_failure";

    /// An authorizer denied the request.
    pub const AUTH_DENIED: &str = "auth_denied";

    /// The throttle rejected the request.
    pub const THROTTLED: &str = "throttled";

    /// Backend invocation failed.
    pub const INTEGRATION_ERROR: &str = "integration_error";

    /// An authorizer could not reach a decision.
    pub const AUTHORIZER_ERROR: &str = "authorizer_error";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros so that the `event` field is always set.
#[macro_export]
macro_rules! log_startup {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STARTUP,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_shutdown {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SHUTDOWN,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_listening {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LISTENING,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_stage_published {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STAGE_PUBLISHED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_stage_retired {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::STAGE_RETIRED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_request_completed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::REQUEST_COMPLETED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_validation_failure {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::VALIDATION_FAILURE,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_auth_denied {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::AUTH_DENIED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_throttled {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::THROTTLED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_integration_error {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::INTEGRATION_ERROR,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_authorizer_error {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::AUTHORIZER_ERROR,
            $($field)*
        )
    };
}
