use std::path::Path;

use fleet_config::LogLevel;
use tracing_subscriber::EnvFilter;

/// Maps the config's `LogLevel` onto a tracing filter and wires a
/// non-blocking file appender at `log_file_name`. The returned guard must
/// be held for the process's lifetime — dropping it stops the writer
/// thread before buffered lines are flushed.
pub fn init(level: LogLevel, log_file_name: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let directive = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        LogLevel::Error | LogLevel::Critical => "error",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let dir = log_file_name.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = log_file_name
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fleetd.log".to_string());
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(non_blocking)
        .init();

    guard
}
