//! Tracing setup for the server binary and tests.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the non-blocking writer alive. Pending lines are flushed on drop.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Install the global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `level` when set. With `json` the output is one
/// JSON object per line.
pub fn init(level: &str, json: bool) -> anyhow::Result<LoggingGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(false),
            )
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(writer).with_target(true))
            .try_init()?;
    }

    tracing::info!(level, json, "logging initialized");
    Ok(LoggingGuard { _guard: guard })
}

/// Route logs through the test harness. Safe to call repeatedly.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
