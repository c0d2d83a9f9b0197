use crate::constants::{DEFAULT_TIME_DIR, DEFAULT_TIME_FILE_PATTERN, TIME_DIR_ENV};
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use thiserror::Error;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Where the monitor gets "now" from. Values must be non-decreasing within one run.
pub trait TimestampSource: Send {
    fn now_ns(&mut self) -> Result<i64, TimestampError>;

    /// Release anything held open. Called once by the monitor during teardown.
    fn close(&mut self) {}
}

/// Wall-clock-free monotonic time straight from the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl TimestampSource for MonotonicClock {
    fn now_ns(&mut self) -> Result<i64, TimestampError> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return Err(TimestampError::Io(std::io::Error::last_os_error()));
        }
        Ok((ts.tv_sec as i64) * NANOS_PER_SEC + (ts.tv_nsec as i64))
    }
}

/// A clock driven from outside, e.g. by a simulator that owns the notion of time.
/// Clones share the same underlying time.
#[derive(Debug, Default, Clone)]
pub struct SimulatedClock {
    now: Arc<AtomicI64>,
}

impl SimulatedClock {
    pub fn new(start_ns: i64) -> Self {
        SimulatedClock {
            now: Arc::new(AtomicI64::new(start_ns)),
        }
    }

    pub fn set(&self, ns: i64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, ns: i64) -> i64 {
        self.now.fetch_add(ns, Ordering::SeqCst) + ns
    }

    pub fn get(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl TimestampSource for SimulatedClock {
    fn now_ns(&mut self) -> Result<i64, TimestampError> {
        Ok(self.get())
    }
}

/// Reads the current time, as decimal text, from a file some other process keeps updated.
#[derive(Debug)]
pub struct FileTimestampSource {
    path: Option<PathBuf>,
}

impl FileTimestampSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        FileTimestampSource {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Scan `dir` for a file whose name matches `pattern`. Names are sorted, so "first"
    /// is stable across runs when more than one file matches.
    #[tracing::instrument]
    pub fn locate(dir: &Path, pattern: &Regex) -> Result<Self, TimestampError> {
        let mut names = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| !t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| pattern.is_match(name))
            .collect::<Vec<_>>();
        names.sort();
        match names.into_iter().next() {
            Some(name) => {
                let path = dir.join(name);
                tracing::debug!("Using time source file {}", path.display());
                Ok(FileTimestampSource::open(path))
            }
            None => Err(TimestampError::NotFound {
                dir: dir.to_path_buf(),
                pattern: pattern.as_str().to_owned(),
            }),
        }
    }

    /// `locate` in `$HEARTBEAT_TIME_DIR` (or /tmp) with the default file name pattern.
    pub fn locate_default() -> Result<Self, TimestampError> {
        let dir = std::env::var_os(TIME_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TIME_DIR));
        let pattern = Regex::new(DEFAULT_TIME_FILE_PATTERN).expect("static regex is valid");
        Self::locate(&dir, &pattern)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl TimestampSource for FileTimestampSource {
    fn now_ns(&mut self) -> Result<i64, TimestampError> {
        let path = self.path.as_ref().ok_or(TimestampError::Closed)?;
        let text = std::fs::read_to_string(path)?;
        parse_timestamp(&text)
    }

    fn close(&mut self) {
        self.path = None;
    }
}

pub fn parse_timestamp(text: &str) -> Result<i64, TimestampError> {
    let trimmed = text.trim();
    trimmed
        .parse::<i64>()
        .map_err(|e| TimestampError::Parse(trimmed.to_owned(), e))
}

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("{0}")]
    Io(
        #[source]
        #[from]
        std::io::Error,
    ),

    #[error("unparsable timestamp {0:?}: {1}")]
    Parse(String, #[source] std::num::ParseIntError),

    #[error("no file matching {pattern:?} in {dir:?}")]
    NotFound { dir: PathBuf, pattern: String },

    #[error("time source was closed")]
    Closed,
}
