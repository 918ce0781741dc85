//! Logging initialisation for vmkeeper.
//!
//! Structured logs go to stderr and to `vmkeeper.log` under the configured
//! data directory. If that directory cannot be created the file lands in the
//! application log directory, and failing that in the system temp directory.
//! Filtering follows `RUST_LOG` and defaults to `info`.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "vmkeeper.log";

pub struct LogGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
    path: PathBuf,
}

impl LogGuard {
    /// Full path of the log file actually in use.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(data_path: &Path, fallback: Option<&Path>) -> LogGuard {
    let dir = log_dir(data_path, fallback);
    let file_appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: guard,
        path: dir.join(LOG_FILE),
    }
}

/// The first of `data_path` and `fallback` that exists or can be created,
/// the temp directory otherwise.
fn log_dir(data_path: &Path, fallback: Option<&Path>) -> PathBuf {
    for dir in std::iter::once(data_path).chain(fallback) {
        match std::fs::create_dir_all(dir) {
            Ok(()) => return dir.to_path_buf(),
            // The subscriber is not up yet.
            Err(e) => eprintln!("vmkeeper: cannot create {} ({e})", dir.display()),
        }
    }
    eprintln!("vmkeeper: logging to the temp directory");
    std::env::temp_dir()
}
