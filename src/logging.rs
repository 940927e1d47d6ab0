use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// `RUST_LOG`-style directives from `log_level` and `log_filter`
fn filter_directives(config: &AppConfig) -> String {
    let filter = config.log_filter.trim();
    if filter.is_empty() {
        config.log_level.clone()
    } else {
        format!("{},{}", config.log_level, filter)
    }
}

/// Unknown `rotation` values fall back to a single never-rotated file
fn file_appender(config: &AppConfig) -> RollingFileAppender {
    let (dir, file) = (&config.log_dir, &config.log_file);
    match config.rotation.as_str() {
        "hourly" => rolling::hourly(dir, file),
        "daily" => rolling::daily(dir, file),
        _ => rolling::never(dir, file),
    }
}

/// Install the global subscriber: rolling file output, plus stdout in text mode.
///
/// `RUST_LOG` wins over the configured filter. Keep the returned guard alive
/// for the life of the process; dropping it flushes the background writer.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(config));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}
