//! Process-wide `tracing` subscriber: a non-blocking rolling file sink, plus
//! a colored stdout sink when logging as text.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::AppConfig;

/// Appended to the configured level; sqlx logs every statement at INFO
const QUIET_TARGETS: &[&str] = &["sqlx=warn"];

fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

fn filter_directives(level: &str) -> String {
    std::iter::once(level)
        .chain(QUIET_TARGETS.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Keep the returned guard alive for the lifetime of the process or
/// buffered file output is lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config.log_level)));

    let (json_file, text_file, stdout) = if config.use_json {
        let file = fmt::layer().with_writer(writer).with_ansi(false);
        // target kept for structured queries
        (Some(file.json().with_target(true)), None, None)
    } else {
        let file = fmt::layer().with_writer(writer).with_ansi(false);
        (
            None,
            Some(file.with_target(false)),
            Some(fmt::layer().with_target(false).with_ansi(true)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_file)
        .with(text_file)
        .with(stdout)
        .init();

    guard
}
