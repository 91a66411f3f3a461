//! Tracing subscriber setup
//!
//! `PROVBUS_LOG` holds the filter directives (default `info`) and
//! `PROVBUS_LOG_FORMAT=json` switches to JSON lines.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV: &str = "PROVBUS_LOG";
pub const LOG_FORMAT_ENV: &str = "PROVBUS_LOG_FORMAT";

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once; later calls do nothing
pub fn init_tracing() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(std::io::stdout().is_terminal())
                .with_filter(filter)
                .boxed()
        };

        // Another subscriber (an embedding application's) may already be set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }
        tracing::debug!(json, "Logging initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
        assert!(LOGGER_INITIALIZED.get().is_some());
    }
}
