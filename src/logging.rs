//! Operational log file.
//!
//! [`init`] installs a global `tracing` subscriber that writes plain-text
//! lines to `<log_dir>/log.txt`. The file is truncated on start and written
//! through a buffer that is flushed every [`FLUSH_EVERY`] lines, on
//! [`flush`], and when the database closes.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
};

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "log.txt";

/// Buffered lines written before the sink flushes on its own.
pub const FLUSH_EVERY: usize = 10;

static SINK: OnceLock<Arc<LogSink>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A global subscriber or sink was already installed.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

// ------------------------------------------------------------------------------------------------
// Sink
// ------------------------------------------------------------------------------------------------

struct SinkState {
    out: BufWriter<File>,
    unflushed_lines: usize,
}

/// Line-counting buffered file writer shared by every subscriber thread.
pub struct LogSink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

impl LogSink {
    /// Creates (truncating) `<log_dir>/log.txt`.
    pub fn create(log_dir: &Path) -> Result<Self, LogError> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(LOG_FILE);
        let file = File::create(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(SinkState {
                out: BufWriter::new(file),
                unflushed_lines: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, SinkState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("log sink mutex poisoned"))
    }

    /// Buffers `buf`, flushing once [`FLUSH_EVERY`] lines have accumulated.
    pub fn append(&self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.lock()?;
        state.out.write_all(buf)?;
        state.unflushed_lines += buf.iter().filter(|&&b| b == b'\n').count();
        if state.unflushed_lines >= FLUSH_EVERY {
            state.out.flush()?;
            state.unflushed_lines = 0;
        }
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.lock()?;
        state.out.flush()?;
        state.unflushed_lines = 0;
        Ok(())
    }
}

/// Per-event writer handed to the fmt layer.
struct SinkWriter(Arc<LogSink>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.append(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Global setup
// ------------------------------------------------------------------------------------------------

/// Installs the log file sink as the global `tracing` subscriber.
///
/// `RUST_LOG` overrides `default_filter` when set.
pub fn init(log_dir: &Path, default_filter: &str) -> Result<(), LogError> {
    let sink = Arc::new(LogSink::create(log_dir)?);
    SINK.set(Arc::clone(&sink))
        .map_err(|_| LogError::AlreadyInitialized("log sink".into()))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(move || SinkWriter(Arc::clone(&sink)))
        .try_init()
        .map_err(|e| LogError::AlreadyInitialized(e.to_string()))
}

/// Flushes the installed sink. No-op when [`init`] was never called.
pub fn flush() {
    if let Some(sink) = SINK.get() {
        if let Err(e) = sink.flush() {
            eprintln!("failed to flush log file: {e}");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line_count(sink: &LogSink) -> usize {
        fs::read_to_string(sink.path()).unwrap().lines().count()
    }

    /// # Scenario
    /// Lines accumulate in the buffer until the tenth one.
    ///
    /// # Expected behavior
    /// Nothing reaches the file after nine lines; all ten are there after
    /// the tenth.
    #[test]
    fn sink__flushes_every_ten_lines() {
        let tmp = TempDir::new().unwrap();
        let sink = LogSink::create(tmp.path()).unwrap();

        for i in 0..FLUSH_EVERY - 1 {
            sink.append(format!("line {i}\n").as_bytes()).unwrap();
        }
        assert_eq!(line_count(&sink), 0);

        sink.append(b"line 9\n").unwrap();
        assert_eq!(line_count(&sink), FLUSH_EVERY);
    }

    #[test]
    fn sink__explicit_flush_writes_partial_buffer() {
        let tmp = TempDir::new().unwrap();
        let sink = LogSink::create(tmp.path()).unwrap();

        sink.append(b"one\ntwo\n").unwrap();
        sink.flush().unwrap();
        assert_eq!(line_count(&sink), 2);
    }

    #[test]
    fn sink__create_truncates_previous_log() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(LOG_FILE), "stale\n").unwrap();

        let sink = LogSink::create(tmp.path()).unwrap();
        assert_eq!(line_count(&sink), 0);
    }

    #[test]
    fn sink__creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("logs");

        let sink = LogSink::create(&dir).unwrap();
        assert!(sink.path().exists());
    }
}
