//! Telemetry configuration.

use std::fmt;
use std::str::FromStr;

use crate::TelemetryError;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One flattened JSON object per event.
    #[default]
    Json,
    /// Multi-line human-readable output with source locations.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => Err(TelemetryError::InvalidLogFormat(s.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        })
    }
}

/// HTTP stack crates whose debug output drowns gateway events.
const NOISY_TARGETS: [&str; 4] = ["hyper", "hyper_util", "h2", "reqwest"];

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `info` or `portcullis=debug,info`.
    /// `RUST_LOG` takes precedence when set.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Cap the HTTP stack crates at `warn` unless `log_level` names them.
    pub quiet_dependencies: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            quiet_dependencies: true,
        }
    }
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretty output at `debug`, for local runs.
    pub fn development() -> Self {
        Self::new()
            .with_log_level("debug")
            .with_log_format(LogFormat::Pretty)
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn with_quiet_dependencies(mut self, quiet: bool) -> Self {
        self.quiet_dependencies = quiet;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        let mut directives = vec![self.log_level.clone()];
        if self.quiet_dependencies {
            directives.extend(
                NOISY_TARGETS
                    .iter()
                    .filter(|target| !self.names_target(target))
                    .map(|target| format!("{}=warn", target)),
            );
        }
        directives.join(",")
    }

    fn names_target(&self, target: &str) -> bool {
        self.log_level
            .split(',')
            .filter_map(|directive| directive.split_once('='))
            .any(|(name, _)| name.trim() == target)
    }
}
