//! Log output: stdout always, plus a rolling file when `log_dir` is set.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Config;

/// File name prefix of rotated log files.
const LOG_FILE_PREFIX: &str = "liverelay";

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes
/// the file writer on drop and must live as long as the process logs.
pub fn init(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = file_appender(dir, config.log_max_files)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Daily-rotated `liverelay.YYYY-MM-DD.log` files in `dir`, keeping at
/// most `max_files` of them.
pub fn file_appender(dir: &Path, max_files: usize) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(max_files.max(1))
        .build(dir)?;
    Ok(appender)
}
