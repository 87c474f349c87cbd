//! Terminal and per-run file logging.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock, PoisonError},
};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

use crate::context::RunInfo;

type FileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    File { path: PathBuf, source: io::Error },

    #[error("bad log filter: {0}")]
    Filter(String),

    #[error("failed to install logger: {0}")]
    Install(String),
}

static LOGGING_GUARDS: OnceLock<LoggingGuards> = OnceLock::new();

/// Logger thread handles. Log lines are flushed when these are dropped,
/// which for the global logger is at process exit.
pub struct LoggingGuards {
    _stdout: Mutex<WorkerGuard>,
    file: Mutex<WorkerGuard>,

    /// Swaps the file the file layer writes to
    file_reload: reload::Handle<FileLayer, Registry>,
}

impl LoggingGuards {
    /// Point the file logger at a different file.
    fn update_file_layer(&self, logfile: File) -> Result<(), LoggingError> {
        let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);
        let file_layer = build_file_layer(file_writer);

        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        self.file_reload
            .modify(|layer| *layer = file_layer)
            .map_err(|e| LoggingError::Install(e.to_string()))?;

        // Dropping the old guard flushes the previous file
        *guard = file_guard;
        Ok(())
    }
}

fn build_file_layer(file_writer: NonBlocking) -> FileLayer {
    fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(file_writer)
        .with_ansi(false)
}

fn open_log(log_dir: &Path, run_name: &str) -> Result<(PathBuf, File), LoggingError> {
    let path = log_dir.join(format!("{run_name}.log"));
    let file_err = |source| LoggingError::File {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(log_dir).map_err(file_err)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(file_err)?;
    Ok((path, file))
}

/// Set up terminal logging and a log file at `<log_dir>/<run_name>.log`.
///
/// The level comes from `RUST_LOG` and defaults to `info`. Calling this again
/// keeps the terminal logger and moves file logging to the new run's file.
pub fn init_logging(
    log_dir: &Path,
    run_name: &str,
) -> Result<(PathBuf, &'static LoggingGuards), LoggingError> {
    let (log_path, logfile) = open_log(log_dir, run_name)?;

    if let Some(guards) = LOGGING_GUARDS.get() {
        guards.update_file_layer(logfile)?;
        return Ok((log_path, guards));
    }

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| LoggingError::Filter(e.to_string()))?;

    let stdout_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(stdout_writer)
        .with_thread_names(true)
        .with_target(false);

    let (file_layer, file_reload) =
        reload::Layer::<FileLayer, Registry>::new(build_file_layer(file_writer));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    let guards = LOGGING_GUARDS.get_or_init(|| LoggingGuards {
        _stdout: Mutex::new(stdout_guard),
        file: Mutex::new(file_guard),
        file_reload,
    });
    Ok((log_path, guards))
}

/// [`init_logging`] into `<run_dir>/logs`.
pub fn init_run_logging(run: &RunInfo) -> Result<(PathBuf, &'static LoggingGuards), LoggingError> {
    init_logging(&run.run_dir.join("logs"), &run.run_name)
}
