use crate::{
    constants::NANOS_PER_SEC,
    discovery::{resolve_enabled_dir, MarkerFile},
    ring::RingCursor,
    shm::ShmBackend,
    state::{BackendError, BeatRecord, LogBlock, MonitorState, StateBackend, StateBlock},
    textlog::{FlushScheduler, TextLog, TextLogError},
    time::{
        clock::{FileTimestampSource, MonotonicClock, TimestampError, TimestampSource},
        window::WindowedRateEstimator,
    },
};
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, HeartbeatError>;

enum ClockSetup {
    Monotonic,
    Given(Box<dyn TimestampSource>),
    TimeFile { dir: PathBuf, pattern: Regex },
    TimeFileDefault,
}

/// Builder for a [`HeartbeatMonitor`].
///
/// ```no_run
/// let monitor = heartbeat::MonitorOptions::new(20, 100)
///     .log_path("heartbeat.log")
///     .targets(30., 60.)
///     .init()?;
/// monitor.record_event(0)?;
/// monitor.finish();
/// # Ok::<(), heartbeat::HeartbeatError>(())
/// ```
pub struct MonitorOptions {
    window_size: usize,
    buffer_depth: usize,
    log_path: Option<PathBuf>,
    min_target: f64,
    max_target: f64,
    id: Option<u32>,
    enabled_dir: Option<PathBuf>,
    backend: Box<dyn StateBackend>,
    clock: ClockSetup,
}

impl MonitorOptions {
    pub fn new(window_size: usize, buffer_depth: usize) -> MonitorOptions {
        MonitorOptions {
            window_size,
            buffer_depth,
            log_path: None,
            min_target: 0.,
            max_target: 0.,
            id: None,
            enabled_dir: None,
            backend: Box::new(ShmBackend),
            clock: ClockSetup::Monotonic,
        }
    }

    /// Write records as tab separated text to this file, in batches.
    pub fn log_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.log_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn targets(mut self, min: f64, max: f64) -> Self {
        self.min_target = min;
        self.max_target = max;
        self
    }

    /// Identifier used for the marker file and for shared memory names. Defaults to the pid.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Discovery directory; when unset, `$HEARTBEAT_ENABLED_DIR` is required.
    pub fn enabled_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.enabled_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn backend<B: StateBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn clock<C: TimestampSource + 'static>(mut self, clock: C) -> Self {
        self.clock = ClockSetup::Given(Box::new(clock));
        self
    }

    /// Read time from the first file in `dir` whose name matches `pattern`.
    pub fn time_file<P: AsRef<Path>>(mut self, dir: P, pattern: Regex) -> Self {
        self.clock = ClockSetup::TimeFile {
            dir: dir.as_ref().to_path_buf(),
            pattern,
        };
        self
    }

    /// Like [`MonitorOptions::time_file`] with `$HEARTBEAT_TIME_DIR` and the default pattern.
    pub fn time_file_default(mut self) -> Self {
        self.clock = ClockSetup::TimeFileDefault;
        self
    }

    /// Acquire everything the monitor needs. Either every resource is acquired or the
    /// ones already held are released (each is a guard) and the error is returned.
    #[tracing::instrument(skip(self), fields(window_size = self.window_size, buffer_depth = self.buffer_depth))]
    pub fn init(self) -> Result<HeartbeatMonitor> {
        if self.window_size == 0 {
            return Err(HeartbeatError::Configuration(
                "window size must be positive".to_owned(),
            ));
        }
        if self.buffer_depth == 0 {
            return Err(HeartbeatError::Configuration(
                "buffer depth must be positive".to_owned(),
            ));
        }
        let id = self
            .id
            .unwrap_or_else(|| nix::unistd::getpid().as_raw() as u32);

        let state = self.backend.allocate_state(id)?;
        let log = self.backend.allocate_log(id, self.buffer_depth)?;
        if log.slots().len() != self.buffer_depth {
            return Err(HeartbeatError::Allocation(BackendError::OutOfMemory(
                self.buffer_depth,
            )));
        }

        let text_log = match self.log_path {
            Some(ref path) => Some(TextLog::create(path)?),
            None => None,
        };

        let enabled_dir = resolve_enabled_dir(self.enabled_dir.as_deref()).ok_or_else(|| {
            HeartbeatError::Configuration(format!(
                "{} is not set",
                crate::constants::ENABLED_DIR_ENV
            ))
        })?;
        let marker = MarkerFile::create(&enabled_dir, id).map_err(|source| HeartbeatError::Io {
            context: format!("creating marker file in {}", enabled_dir.display()),
            source,
        })?;

        let window = WindowedRateEstimator::new(self.window_size);

        state.state().reset(
            id as i64,
            self.window_size,
            self.buffer_depth,
            self.min_target,
            self.max_target,
        );

        let clock: Box<dyn TimestampSource> = match self.clock {
            ClockSetup::Monotonic => Box::new(MonotonicClock),
            ClockSetup::Given(c) => c,
            ClockSetup::TimeFile { dir, pattern } => {
                Box::new(FileTimestampSource::locate(&dir, &pattern).map_err(time_setup_error)?)
            }
            ClockSetup::TimeFileDefault => {
                Box::new(FileTimestampSource::locate_default().map_err(time_setup_error)?)
            }
        };

        tracing::debug!("Heartbeat monitor {} ready", id);
        Ok(HeartbeatMonitor {
            id,
            state,
            marker,
            core: Mutex::new(Core {
                window,
                buffer: RingCursor::new(self.buffer_depth),
                read: RingCursor::new(self.buffer_depth),
                log,
                flusher: FlushScheduler::new(text_log),
                clock,
                first_timestamp: None,
                last_timestamp: 0,
                counter: 0,
            }),
            finished: false,
        })
    }
}

fn time_setup_error(e: TimestampError) -> HeartbeatError {
    match e {
        TimestampError::NotFound { .. } => HeartbeatError::Configuration(e.to_string()),
        e => HeartbeatError::Timestamp(e),
    }
}

// Everything that record_event touches. Guarded by one lock.
struct Core {
    window: WindowedRateEstimator,
    buffer: RingCursor,
    read: RingCursor,
    log: Box<dyn LogBlock>,
    flusher: FlushScheduler,
    clock: Box<dyn TimestampSource>,
    first_timestamp: Option<i64>,
    last_timestamp: i64,
    counter: i64,
}

impl Core {
    fn latest_index(&self) -> Option<usize> {
        if self.counter == 0 {
            return None;
        }
        let depth = self.buffer.len();
        Some((self.buffer.get() + depth - 1) % depth)
    }
}

///
/// Tracks the rate of caller-signalled events.
///
/// Every call to [`HeartbeatMonitor::record_event`] runs as one critical section under a
/// single mutex: read the clock, update the window, write the record, and, when the ring
/// wraps, write the whole ring to the text log. So the text log I/O lands on whichever
/// caller fills the ring.
///
/// The [`MonitorState`] block can be read without the lock (it's all atomics, and may be
/// shared memory that other processes read). Readers get the values as of some recent
/// commit, never a consistent snapshot across fields.
///
/// Constructing and finishing a monitor while other threads are still calling
/// `record_event` on it is the caller's problem; `finish` takes `self` by value so
/// this can't happen in safe code anyway.
///
pub struct HeartbeatMonitor {
    id: u32,
    state: Box<dyn StateBlock>,
    marker: MarkerFile,
    core: Mutex<Core>,
    finished: bool,
}

impl HeartbeatMonitor {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one event with a caller-chosen `tag`. Returns the timestamp used.
    ///
    /// Fails without recording anything if the clock can't be read or went backwards.
    pub fn record_event(&self, tag: i32) -> Result<i64> {
        let mut guard = self.lock();
        let core = &mut *guard;
        let state = self.state.state();

        let time = core.clock.now_ns().map_err(|e| {
            tracing::warn!("Unable to read timestamp for monitor {}: {}", self.id, e);
            HeartbeatError::Timestamp(e)
        })?;

        let record = match core.first_timestamp {
            None => {
                core.first_timestamp = Some(time);
                BeatRecord {
                    beat: core.counter,
                    tag,
                    timestamp: time,
                    global_rate: 0.,
                    window_rate: 0.,
                    instant_rate: 0.,
                }
            }
            Some(first) => {
                if time < core.last_timestamp {
                    return Err(HeartbeatError::NonMonotonic {
                        previous: core.last_timestamp,
                        current: time,
                    });
                }
                let overflow = || HeartbeatError::IntervalOverflow {
                    previous: core.last_timestamp,
                    current: time,
                };
                let delta = time.checked_sub(core.last_timestamp).ok_or_else(overflow)?;
                let elapsed = time.checked_sub(first).ok_or_else(overflow)?;
                let window_rate = core.window.update(delta);
                let global_rate = ((core.counter + 1) as f64 / elapsed as f64) * NANOS_PER_SEC;
                let instant_rate = NANOS_PER_SEC / delta as f64;
                BeatRecord {
                    beat: core.counter,
                    tag,
                    timestamp: time,
                    global_rate,
                    window_rate,
                    instant_rate,
                }
            }
        };

        let is_first = core.counter == 0;
        core.log.slots_mut()[core.buffer.get()] = record;
        core.counter += 1;
        let wrapped = core.buffer.advance();
        if !is_first {
            // the read cursor starts moving with the second event
            core.read.advance();
        }
        if wrapped {
            if let Err(e) = core.flusher.flush(
                core.log.slots(),
                state.min_target_rate(),
                state.max_target_rate(),
            ) {
                tracing::warn!("Unable to flush heartbeat log for monitor {}: {}", self.id, e);
            }
        }
        core.last_timestamp = time;
        state.publish(core.counter, core.buffer.get(), core.read.get());
        Ok(time)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Lock-free view of the shared state block.
    pub fn state(&self) -> &MonitorState {
        self.state.state()
    }

    pub fn marker_path(&self) -> Option<&Path> {
        self.marker.path()
    }

    pub fn last_record(&self) -> Option<BeatRecord> {
        let core = self.lock();
        core.latest_index().map(|i| core.log.slots()[i])
    }

    /// Up to `n` of the most recent records still held in the ring, oldest first.
    pub fn history(&self, n: usize) -> Vec<BeatRecord> {
        let core = self.lock();
        let Some(latest) = core.latest_index() else {
            return vec![];
        };
        let depth = core.buffer.len();
        let available = std::cmp::min(core.counter as usize, depth);
        let n = std::cmp::min(n, available);
        let slots = core.log.slots();
        let mut out = (0..n)
            .map(|k| slots[(latest + depth - k) % depth])
            .collect::<Vec<_>>();
        out.reverse();
        out
    }

    pub fn global_rate(&self) -> f64 {
        self.last_record().map(|r| r.global_rate).unwrap_or(0.)
    }

    pub fn window_rate(&self) -> f64 {
        self.last_record().map(|r| r.window_rate).unwrap_or(0.)
    }

    pub fn instant_rate(&self) -> f64 {
        self.last_record().map(|r| r.instant_rate).unwrap_or(0.)
    }

    /// Change the targets reported in the state block and in subsequent log rows.
    pub fn set_target_rates(&self, min: f64, max: f64) {
        let _core = self.lock();
        self.state.state().set_targets(min, max);
    }

    /// Number of times the ring filled up and was handed to the text log.
    pub fn flushes(&self) -> u64 {
        self.lock().flusher.batches()
    }

    /// Flush what's left of the ring, close the text log, remove the marker file,
    /// close the clock, and release the state and log storage.
    pub fn finish(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let state = self.state.state();
        let core = self.core.get_mut().unwrap_or_else(|e| e.into_inner());

        let pending = core.buffer.get();
        if let Err(e) = core.flusher.finish(
            &core.log.slots()[..pending],
            state.min_target_rate(),
            state.max_target_rate(),
        ) {
            tracing::warn!("Error closing heartbeat log for monitor {}: {}", self.id, e);
        }
        self.marker.remove();
        core.clock.close();
        tracing::debug!("Heartbeat monitor {} finished after {} beats", self.id, core.counter);
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl core::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("id", &self.id)
            .field("counter", &self.state().counter())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("unable to allocate monitor storage: {0}")]
    Allocation(
        #[source]
        #[from]
        BackendError,
    ),

    #[error("{0}")]
    Configuration(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    TextLog(
        #[source]
        #[from]
        TextLogError,
    ),

    #[error("unable to read timestamp: {0}")]
    Timestamp(
        #[source]
        #[from]
        TimestampError,
    ),

    #[error("timestamp went backwards from {previous} to {current}")]
    NonMonotonic { previous: i64, current: i64 },

    #[error("interval from {previous} to {current} does not fit in 64 bits")]
    IntervalOverflow { previous: i64, current: i64 },
}
