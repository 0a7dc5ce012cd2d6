//! Tracing setup: human-readable stderr plus optional JSON file logging.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. When `json_dir` is set, a daily
/// rolling `vigil.log` with one JSON object per event is written there; the
/// returned guard must be held for the lifetime of the process to flush it.
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (json_layer, guard) = match &config.json_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "vigil.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(filter());
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("vigil: cannot create log dir {}: {e}", dir.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init();

    guard
}
