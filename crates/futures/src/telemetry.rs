// Tracing initialization
//
// Console logging through tracing-subscriber with an env-driven filter.
// Worker processes log their pid and thread names, so interleaved output
// from many processes stays attributable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither `RUST_LOG` nor `LOG_LEVEL` is set
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `tpq_futures=debug`
    pub log_filter: Option<String>,
    /// Include thread ids and names in each line
    pub with_threads: bool,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_threads: true,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `LOG_FORMAT`: `json` for JSON lines
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_threads: true,
            json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(config: TelemetryConfig) -> bool {
    let filter = config.filter();

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_thread_ids(config.with_threads)
            .with_thread_names(config.with_threads)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(config.with_threads)
            .with_thread_names(config.with_threads)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_falls_back() {
        let config = TelemetryConfig {
            log_filter: Some("tpq_futures=loudest".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter().to_string(), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_custom_filter() {
        let config = TelemetryConfig {
            log_filter: Some("tpq_futures=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter().to_string(), "tpq_futures=debug");
    }
}
