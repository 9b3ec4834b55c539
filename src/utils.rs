use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_FILE: &str = "logs.txt";
pub const LOG_ENV: &str = "PATTERNS_LOG";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Log to stderr (unless quiet) and append everything to `data_dir/logs.txt`.
/// Keep the returned guard alive for the life of the process so the file
/// writer flushes.
pub fn init_logging(data_dir: &Path, quiet: bool) -> Option<WorkerGuard> {
    let console_default = if quiet { "error" } else { "info" };
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter(console_default));

    let (file_layer, guard) = match fs::create_dir_all(data_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(data_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter("info"));
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();
    guard
}

/// Shortens long lists for terminal output: `a, b, c (+4 more)`.
pub fn summarize(items: &[String], keep: usize) -> String {
    if items.len() <= keep {
        return items.join(", ");
    }
    format!("{} (+{} more)", items[..keep].join(", "), items.len() - keep)
}
