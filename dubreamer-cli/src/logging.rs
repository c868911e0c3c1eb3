//! Log sinks: console plus `<log dir>/main.log`.
//!
//! The file is held behind a handle that can be reopened in place, so an
//! external rotator can move `main.log` away and signal the process.

use anyhow::Context;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub const DEFAULT_LOG_FILTER: &str = "dubreamer=info,dubreamer_engine=info";
pub const DEBUG_LOG_FILTER: &str = "dubreamer=debug,dubreamer_engine=debug";
pub const LOG_FILE_NAME: &str = "main.log";

#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Append-mode log file that can be reopened at the same path.
#[derive(Debug, Clone)]
pub struct ReopenableLogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ReopenableLogFile {
    /// Create `dir` if needed and open `dir/main.log` for appending.
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swap in a fresh handle for the configured path. On failure the old
    /// handle stays in use.
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        let mut file = self.file.lock();
        file.flush()?;
        *file = fresh;
        Ok(())
    }
}

impl Write for ReopenableLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

/// Keeps the background writer alive; dropping it flushes pending lines.
pub struct Logging {
    pub file: ReopenableLogFile,
    _guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path, debug: bool) -> anyhow::Result<Logging> {
    let file = ReopenableLogFile::open(log_dir)
        .with_context(|| format!("failed to open log file in {}", log_dir.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file.clone());

    let default_filter = if debug {
        DEBUG_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .context("failed to install the global tracing subscriber")?;

    Ok(Logging {
        file,
        _guard: guard,
    })
}
