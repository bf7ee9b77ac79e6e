#![forbid(unsafe_code)]

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,grabtube=debug";

/// Installs the stdout subscriber. `RUST_LOG` overrides the default filter.
/// Calling it twice is harmless; the second call only prints a warning.
pub fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into());
    if let Err(err) = tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(fmt::layer().with_target(false))
        .try_init()
    {
        eprintln!("Tracing init warning: {err}");
    }
}
