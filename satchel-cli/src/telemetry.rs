//! Log subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::CliError;

const DEFAULT_FILTER: &str = "satchel=info,satchel_storage=info,warn";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(json: bool) -> Result<(), CliError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| CliError::Telemetry(e.to_string()))
}
