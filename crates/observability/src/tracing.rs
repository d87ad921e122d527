//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops), which keeps
/// parallel test binaries from fighting over the global subscriber.
/// `RUST_LOG` controls filtering; `LOG_FORMAT=pretty` swaps the JSON
/// output for human-readable lines in local runs.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let pretty = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("pretty"));
    if pretty {
        let _ = builder.pretty().try_init();
    } else {
        let _ = builder.json().try_init();
    }
}
