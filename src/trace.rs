//! Log output for the `wsconform` binary.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "wsconform=info";

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `default_filter`. Does nothing if a subscriber is
/// already installed, so tests may call it repeatedly.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}
