//! Observability for the Portcullis API gateway.
//!
//! Structured logs carry a standard `event` field (see [`events`]) and the
//! [`MetricsRegistry`] is rendered in Prometheus text format by the
//! gateway's metrics endpoint.
//!
//! ```ignore
//! let telemetry = Telemetry::init(TelemetryConfig::development())?;
//! let gateway = Gateway::from_config(&config, telemetry.metrics_clone())?;
//! ```

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;
pub use metrics::{MetricsRegistry, PROMETHEUS_CONTENT_TYPE};

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("invalid log format '{0}' (expected json or pretty)")]
    InvalidLogFormat(String),
}

/// Handle returned by [`Telemetry::init`]; owns the shared metrics registry.
pub struct Telemetry {
    metrics: Arc<MetricsRegistry>,
}

impl Telemetry {
    /// Install the global log subscriber and create the metrics registry.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self::without_logging())
    }

    /// Metrics only, for embedders and tests that manage logging themselves.
    pub fn without_logging() -> Self {
        Self {
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn metrics_clone(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_one_registry() {
        let telemetry = Telemetry::without_logging();
        telemetry.metrics_clone().set_active_stage(4);
        assert!(telemetry
            .metrics()
            .render()
            .contains("portcullis_active_stage_version 4"));
    }
}
