//! Log setup for the `mirror` binary. Logs never reach stdout, which carries
//! the viewer's replayed stream.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

/// Filter directives that replace the level-derived default.
pub const FILTER_ENV: &str = "MIRROR_LOG_FILTER";

/// Crates that follow `--log-level`; everything else stays at warn or quieter.
const WORKSPACE_CRATES: &[&str] = &[
    "mirror_cli",
    "mirror_session",
    "mirror_transport",
    "mirror_proto",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("cannot open log file {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid MIRROR_LOG_FILTER directives: {0}")]
    Filter(#[from] ParseError),
    #[error("a global logger is already installed")]
    AlreadyInstalled,
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the process-wide subscriber. Calls after the first succeed
/// without touching it.
pub fn init(config: &LogConfig) -> Result<(), LogError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_ENV) {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => EnvFilter::new(default_directives(config.level)),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|_| LogError::AlreadyInstalled)?;

    let _ = GUARD.set(guard);
    Ok(())
}

/// Workspace crates log at `level`; dependencies never go past warn.
pub fn default_directives(level: LogLevel) -> String {
    let mut directives = level.min(LogLevel::Warn).directive().to_string();
    for name in WORKSPACE_CRATES {
        directives.push(',');
        directives.push_str(name);
        directives.push('=');
        directives.push_str(level.directive());
    }
    directives
}
