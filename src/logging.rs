//! Logging setup for the gateway binary.
//!
//! Library code only emits `tracing` events; the binary installs the
//! subscriber once at startup. `RUST_LOG` wins over the configured level.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Level used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Builds the filter: `RUST_LOG` if set and valid, else `level`, else
/// [`DEFAULT_LOG_LEVEL`].
#[must_use]
pub fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_LOG_LEVEL)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

/// Installs the global subscriber, writing to stderr.
///
/// Returns false if a subscriber was already installed.
pub fn init_logging(level: Option<&str>) -> bool {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        let _ = init_logging(Some("debug"));
        assert!(!init_logging(Some("debug")));
    }

    #[test]
    fn test_bad_level_falls_back() {
        let filter = env_filter(Some("not a [valid filter"));
        assert!(!filter.to_string().is_empty());
    }
}
