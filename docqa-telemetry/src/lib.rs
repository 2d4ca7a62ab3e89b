//! Logging setup shared by DocQA binaries.
//!
//! Both initialisers install a global `tracing` subscriber filtered by
//! `RUST_LOG` (default `info`) that writes to stderr, leaving stdout free for
//! command output.
//!
//! ```rust,ignore
//! docqa_telemetry::init_telemetry("docqa")?;
//! tracing::info!(user_id = "alice", "ready");
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub use tracing_subscriber::util::TryInitError;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Install a human-readable subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_telemetry(service_name: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()?;

    tracing::debug!(service.name = service_name, "telemetry initialized");
    Ok(())
}

/// Install a subscriber emitting one JSON object per event, for log shippers.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_json(service_name: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    tracing::debug!(service.name = service_name, format = "json", "telemetry initialized");
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialisation_is_an_error_not_a_panic() {
        let _ = init_telemetry("docqa-test");
        assert!(init_json("docqa-test").is_err());
        assert!(init_telemetry("docqa-test").is_err());
    }
}
