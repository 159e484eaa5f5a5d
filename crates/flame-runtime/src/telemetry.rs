//! Tracing setup
//!
//! The engine only emits `tracing` events; binaries embedding it call
//! `init_tracing` once to install a subscriber.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use flame_core::{FlameError, FlameResult};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line, for collectors
    Json,
}

/// Logging configuration
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            format: LogFormat::Text,
            filter: "info,flame_runtime=info,flame_registry=info".into(),
        }
    }
}

impl TelemetryConfig {
    pub fn json() -> Self {
        TelemetryConfig {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> FlameResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| FlameError::Validation(format!("log filter {:?}: {e}", config.filter)))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| FlameError::Validation(format!("tracing subscriber: {e}")))
}

/// Render a duration for log fields, e.g. `1m 30s`
pub fn fmt_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig::default().with_filter("warn");
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(fmt_duration(Duration::from_millis(250)), "250ms");
    }
}
