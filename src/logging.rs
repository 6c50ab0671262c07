//! Logging initialisation for osv-proxy.
//!
//! Structured logs always go to the configured log file. The proxy's own
//! stdout and stderr carry relayed data, so a stderr layer is only added when
//! `OSV_PROXY_LOG_STDERR=1`.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::LogSettings;

pub const STDERR_ENV: &str = "OSV_PROXY_LOG_STDERR";

pub struct LogGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Call once from `main` and keep
/// the returned `LogGuard` until the process exits.
pub fn init(settings: &LogSettings) -> anyhow::Result<LogGuard> {
    let (dir, file_name) = split_log_path(&settings.file);
    std::fs::create_dir_all(&dir)?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let stderr_layer = stderr_enabled().then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter(&settings.level))
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(LogGuard { _file_guard: guard })
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn stderr_enabled() -> bool {
    std::env::var(STDERR_ENV).as_deref() == Ok("1")
}

// A bare file name logs into the current directory.
fn split_log_path(path: &Path) -> (std::path::PathBuf, std::ffi::OsString) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "osv-proxy.log".into());
    (dir, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_splits_into_dir_and_name() {
        let (dir, name) = split_log_path(Path::new("/tmp/orted_lin_proxy.log"));
        assert_eq!(dir, Path::new("/tmp"));
        assert_eq!(name, "orted_lin_proxy.log");

        let (dir, name) = split_log_path(Path::new("proxy.log"));
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "proxy.log");
    }
}
