//! Per-run NDJSON log files fed by `tracing`.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "PKGBACKUP_LOG";
pub const LOG_DIR_ENV: &str = "PKGBACKUP_LOG_DIR";

static RUN_LOGGER: OnceLock<RunLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Backup,
    ConnectionTest,
}

impl RunKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::ConnectionTest => "connection-test",
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    writer: Option<BufWriter<std::fs::File>>,
}

#[derive(Debug, Default)]
struct RunLogger {
    state: Mutex<RunState>,
}

impl RunLogger {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.writer.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }

        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        guard.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn finish(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// Writes into the active run file, or discards when no run is active.
pub struct RunLogWriter<'a> {
    guard: MutexGuard<'a, RunState>,
}

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.guard.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.guard.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter { guard: self.lock() }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(app_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");

    if let Some(v) = app_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

pub fn init_run_logging() {
    TRACING_INIT.get_or_init(|| {
        let logger = RUN_LOGGER.get_or_init(RunLogger::default);

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger);

        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer)
            .try_init();
    });
}

/// Flushes and closes the run log on drop.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(logger) = RUN_LOGGER.get() {
            let _ = logger.finish();
        }
    }
}

pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_run_logging();

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "run-{}-{}-{}.ndjson",
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    );
    let path = log_dir.join(file_name);

    RUN_LOGGER.get_or_init(RunLogger::default).start(&path)?;
    Ok(RunLogGuard { path })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    match std::env::var(LOG_DIR_ENV) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => data_dir.join("logs"),
    }
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
