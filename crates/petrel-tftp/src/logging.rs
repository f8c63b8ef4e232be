//! Rotating file log sink.
//!
//! Status lines and engine events are emitted through `tracing`; this module
//! installs the subscriber that lands them in `<log_dir>/tftplog`, rotated
//! at 20 000 bytes with five numbered backups (`tftplog.1` is the newest).
//! Failure to set the sink up disables file logging but never the server.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "tftplog";
pub const MAX_LOG_BYTES: u64 = 20_000;
pub const LOG_BACKUPS: u32 = 5;

/// An append-only writer that renames its file away once it would grow past
/// `MAX_LOG_BYTES`, keeping `LOG_BACKUPS` numbered predecessors.
pub struct RotatingLogWriter {
    dir: PathBuf,
    file: File,
    written: u64,
}

impl RotatingLogWriter {
    pub fn open(dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE_NAME))?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            written,
        })
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{LOG_FILE_NAME}.{index}"))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let _ = fs::remove_file(self.backup_path(LOG_BACKUPS));
        for index in (1..LOG_BACKUPS).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                let _ = fs::rename(from, self.backup_path(index + 1));
            }
        }
        let _ = fs::rename(self.dir.join(LOG_FILE_NAME), self.backup_path(1));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE_NAME))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Rotate before the record that would overflow, mirroring the
        // size-based handler this log format comes from. An oversized first
        // record still lands in the fresh file.
        if self.written > 0 && self.written + buf.len() as u64 > MAX_LOG_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Install the global subscriber writing `<timestamp> <level> <message>`
/// lines to the rotating log. Returns the guard keeping the background
/// writer alive, or `None` when the sink could not be set up (the caller
/// keeps serving without file logs).
pub fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let writer = match RotatingLogWriter::open(log_dir) {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!(
                "file logging disabled: cannot open {} in {}: {}",
                LOG_FILE_NAME,
                log_dir.display(),
                e
            );
            return None;
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .try_init();
    if installed.is_err() {
        eprintln!("file logging disabled: a tracing subscriber is already installed");
        return None;
    }
    Some(guard)
}
