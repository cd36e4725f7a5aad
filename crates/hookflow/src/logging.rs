//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Filtering comes from `RUST_LOG`
/// (default `info`); `json` switches to one JSON object per line.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
