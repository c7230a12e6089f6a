//! Logging initialization.
//!
//! Installs a `tracing` subscriber with an environment-driven filter.
//! `RUST_LOG` always wins; otherwise the verbosity flags select one of the
//! built-in defaults.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "trawl=info,sqlx=warn";

/// Filter used with `-v`.
pub const VERBOSE_LOG_FILTER: &str = "trawl=debug,sqlx=warn";

/// Filter used with `-q`.
pub const QUIET_LOG_FILTER: &str = "trawl=warn,sqlx=warn";

/// Initialize the global subscriber.
///
/// `verbose` and `quiet` come from the CLI; when both are set, verbose wins.
/// Calling this twice is an error from `tracing`, so the binary does it once
/// before anything else.
pub fn init(verbose: bool, quiet: bool) {
    let default_filter = if verbose {
        VERBOSE_LOG_FILTER
    } else if quiet {
        QUIET_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
