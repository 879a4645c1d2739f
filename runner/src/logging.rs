//! Tracing setup shared by `snip` and `snip-worker`.
//!
//! Everything goes to stderr: stdout belongs to command output in `snip` and
//! to the reply channel in `snip-worker`. Snippet `log(...)` lines are events
//! with target `snip::snippet` at `info`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_filter` when unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=snip::snippet=info,snip_runner=debug snip run --source fix.snip
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
