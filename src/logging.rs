//! Tracing setup for harness test binaries.
//!
//! The harness runs headless, usually under `cargo test` or CI. Diagnostics
//! go to stderr so they land in the same captured stream as test output and
//! guest serial transcripts; there is no log file to chase down afterwards.
//! Verbosity follows `RUST_LOG` and defaults to `warn`, keeping the harness
//! quiet unless a run is being debugged.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr tracing subscriber for this process.
///
/// Safe to call from every test: only the first call installs anything,
/// later calls are no-ops. Tests run in parallel threads within one binary,
/// so none of them can own subscriber setup exclusively.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
