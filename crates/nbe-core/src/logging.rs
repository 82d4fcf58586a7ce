//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `level` when set. With `json` the output
/// is one JSON object per line, otherwise the compact human format.
/// Call once at startup; subsequent calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails if a global subscriber is already set
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

/// Compact stderr subscriber for the window before settings are loaded.
///
/// Install it with [`tracing::subscriber::with_default`] around settings
/// loading so rejected overrides are reported before the global subscriber
/// exists.
pub fn bootstrap_subscriber(level: &str) -> impl tracing::Subscriber + Send + Sync {
    bootstrap_with_writer(level, std::io::stderr)
}

fn bootstrap_with_writer<W>(level: &str, writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_target(true)
        .with_writer(writer)
        .compact()
        .finish()
}
