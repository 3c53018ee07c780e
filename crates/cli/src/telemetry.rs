// Tracing setup for the CLI
//
// Logs go to stderr so JSON output on stdout stays machine readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "raytask=info";
const QUIET_FILTER: &str = "raytask=warn";

/// Resolve the log filter from `RUST_LOG`, then `LOG_LEVEL`, then the default
pub fn log_filter(quiet: bool) -> String {
    std::env::var("RUST_LOG")
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| format!("raytask={}", level))
        })
        .unwrap_or_else(|| {
            if quiet {
                QUIET_FILTER.to_string()
            } else {
                DEFAULT_FILTER.to_string()
            }
        })
}

/// Install the global subscriber
pub fn init_tracing(quiet: bool) {
    let filter = EnvFilter::try_new(log_filter(quiet))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}
