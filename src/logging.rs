//! Process-wide log sink.
//!
//! Events go to the console and to a size-rotated log file. The file handle is
//! opened once and shared behind an [`Arc`]; every formatted event is written
//! with a single locked `write` call so concurrent handlers never interleave
//! their lines.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const TIMESTAMP_FORMAT: &str = "%B %d %H:%M:%S";

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("Failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Logger has already been initialized")]
    AlreadyInitialized,
}

/// An append-only log file that rolls over once it would grow past
/// `max_bytes`, keeping at most `backups` old files (`<path>.1` is the newest).
///
/// `backups == 0` or `max_bytes == 0` disables rotation.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(
        path: impl Into<PathBuf>,
        max_bytes: u64,
        backups: usize,
    ) -> Result<Self, LoggingError> {
        let path = path.into();
        let file = open_append(&path).map_err(|source| LoggingError::Open {
            path: path.clone(),
            source,
        })?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(RotatingFile {
            path,
            max_bytes,
            backups,
            state: Mutex::new(FileState { file, written }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotation_enabled(&self) -> bool {
        self.max_bytes > 0 && self.backups > 0
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&self, state: &mut FileState) -> io::Result<()> {
        state.file.flush()?;

        let oldest = self.backup_path(self.backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        state.file = open_append(&self.path)?;
        state.written = 0;
        Ok(())
    }
}

impl Write for &RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;

        let incoming = buf.len() as u64;
        if self.rotation_enabled()
            && state.written > 0
            && state.written + incoming > self.max_bytes
        {
            self.rotate(&mut state)?;
        }

        state.file.write_all(buf)?;
        state.written += incoming;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        state.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Local wall-clock timestamps in the log file, e.g. `October 18 14:02:11`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTimestamp;

impl FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format(TIMESTAMP_FORMAT))
    }
}

/// Default filter when `RUST_LOG` is not set.
pub fn default_filter(level: &str) -> String {
    format!("deploy_hook={level},tower_http={level}")
}

/// Installs the global subscriber: console output plus the rotating file.
pub fn init(level: &str, sink: Arc<RotatingFile>) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_timer(LocalTimestamp)
                .with_writer(sink),
        )
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_line(log: &RotatingFile, line: &str) {
        let mut writer = log;
        writer.write_all(line.as_bytes()).unwrap();
    }

    #[test]
    fn test_appends_without_rotation_under_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hook.log");
        let log = RotatingFile::open(&path, 1024, 2).unwrap();

        write_line(&log, "first\n");
        write_line(&log, "second\n");

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
        assert!(!log.backup_path(1).exists());
    }

    #[test]
    fn test_rotates_when_limit_exceeded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hook.log");
        let log = RotatingFile::open(&path, 10, 2).unwrap();

        write_line(&log, "aaaaaaaa\n");
        write_line(&log, "bbbbbbbb\n");
        write_line(&log, "cccccccc\n");
        write_line(&log, "dddddddd\n");

        assert_eq!(fs::read_to_string(&path).unwrap(), "dddddddd\n");
        assert_eq!(fs::read_to_string(log.backup_path(1)).unwrap(), "cccccccc\n");
        assert_eq!(fs::read_to_string(log.backup_path(2)).unwrap(), "bbbbbbbb\n");
        // Only two backups are retained.
        assert!(!log.backup_path(3).exists());
    }

    #[test]
    fn test_oversized_line_is_written_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hook.log");
        let log = RotatingFile::open(&path, 4, 1).unwrap();

        write_line(&log, "a line longer than the limit\n");

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "a line longer than the limit\n"
        );
    }

    #[test]
    fn test_zero_backups_never_rotates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hook.log");
        let log = RotatingFile::open(&path, 4, 0).unwrap();

        write_line(&log, "one\n");
        write_line(&log, "two\n");

        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert!(!log.backup_path(1).exists());
    }

    #[test]
    fn test_reopen_counts_existing_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hook.log");
        fs::write(&path, "existing\n").unwrap();

        let log = RotatingFile::open(&path, 12, 1).unwrap();
        write_line(&log, "next\n");

        assert_eq!(fs::read_to_string(&path).unwrap(), "next\n");
        assert_eq!(fs::read_to_string(log.backup_path(1)).unwrap(), "existing\n");
    }

    #[test]
    fn test_open_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("hook.log");

        let result = RotatingFile::open(&path, 10, 1);
        assert!(matches!(result, Err(LoggingError::Open { .. })));
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter("debug"), "deploy_hook=debug,tower_http=debug");
    }
}
