//! Logging setup: structured output to a session log file plus stdout.
//!
//! The file starts fresh each session so a log always describes exactly one
//! scheduler run. Verbosity comes from `RUST_LOG`, defaulting to `info`.

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keep this alive as long as the process logs; dropping it flushes and
/// closes the file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Wires the global subscriber to `<log_dir>/<log_file>` and stdout.
///
/// # Errors
///
/// Returns an error when the directory cannot be created or the previous
/// log file cannot be truncated. Calling this twice in one process panics,
/// as the global subscriber can only be installed once.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;

    // Truncate rather than delete so an open tail keeps working.
    let log_path = Path::new(log_dir).join(log_file);
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true)
        .compact();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true)
        .compact();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

pub fn default_log_dir() -> &'static str {
    "logs"
}

pub fn default_log_file() -> &'static str {
    "regionflow.log"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = PathBuf::from(format!("target/test_logs_{nanos}"));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_default_paths() {
        assert_eq!(default_log_dir(), "logs");
        assert_eq!(default_log_file(), "regionflow.log");
    }

    #[test]
    fn test_truncates_previous_session_log() {
        // init_logging itself cannot run under `cargo test` because the
        // global subscriber is installed once per process; exercise the file
        // handling it relies on instead.
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.log");
        fs::write(&path, "stale entries").unwrap();

        fs::write(&path, "").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_guard_holds_the_writer() {
        use tracing_appender::non_blocking::NonBlocking;
        let (writer, guard) = NonBlocking::new(std::io::sink());
        drop(writer);
        let _guard = LoggingGuard { _file_guard: guard };
    }
}
