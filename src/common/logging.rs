//! Logging and tracing configuration
//!
//! Diagnostics go to stderr so stdout stays reserved for reports
//! (the structured reporter prints a JSON document there).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the CLI
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate (DEBUG with `debug`), WARN for dependencies.
pub fn init_cli(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("toolharness=debug,warn")
        } else {
            EnvFilter::new("toolharness=info,warn")
        }
    });

    // try_init: tests and embedding callers may have installed a subscriber already
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}
