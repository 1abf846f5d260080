use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use mokapapp_core::PanelError;
use time::{format_description, Date, OffsetDateTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogSettings {
    pub logdir: PathBuf,
    /// Overrides `RUST_LOG` when set.
    pub level: Option<String>,
}

/// `{logdir}/{YYMMDD}_mokapapp.log` for the given day.
///
/// # Errors
/// Returns [`PanelError::Configuration`] if the date cannot be formatted.
pub fn log_file_path(logdir: &Path, date: Date) -> Result<PathBuf, PanelError> {
    let format = format_description::parse("[year repr:last_two][month][day]")
        .map_err(|err| PanelError::Configuration(format!("invalid log date format: {err}")))?;
    let stamp = date
        .format(&format)
        .map_err(|err| PanelError::Configuration(format!("failed to format log date: {err}")))?;
    Ok(logdir.join(format!("{stamp}_mokapapp.log")))
}

/// Installs the process-wide subscriber: stderr plus a per-day log file.
/// Call once, at process entry, before any other work.
///
/// # Errors
/// Returns [`PanelError::Configuration`] when `logdir` is not a directory,
/// the log file cannot be created, the filter is invalid, or a subscriber is
/// already installed.
pub fn init(settings: &LogSettings) -> Result<PathBuf, PanelError> {
    if !settings.logdir.is_dir() {
        return Err(PanelError::Configuration(format!(
            "log directory {} does not exist or is not a directory",
            settings.logdir.display()
        )));
    }

    let filter = match settings.level.as_deref() {
        Some(level) => EnvFilter::try_new(level).map_err(|err| {
            PanelError::Configuration(format!("invalid log level {level:?}: {err}"))
        })?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let path = log_file_path(&settings.logdir, OffsetDateTime::now_utc().date())?;
    let file = File::create(&path).map_err(|err| {
        PanelError::Configuration(format!("failed to create log file {}: {err}", path.display()))
    })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .try_init()
        .map_err(|err| PanelError::Configuration(format!("failed to install logger: {err}")))?;

    Ok(path)
}
