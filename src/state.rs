use serde::Serialize;
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;

/// The externally visible state block. Every field is an atomic so the block can sit in
/// memory that other processes map and read while the monitor is writing it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct MonitorState {
    pid: AtomicI64,
    window_size: AtomicI64,
    buffer_depth: AtomicI64,
    min_target_rate: AtomicU64,
    max_target_rate: AtomicU64,
    counter: AtomicI64,
    buffer_index: AtomicI64,
    read_index: AtomicI64,
    valid: AtomicI64,
}

impl MonitorState {
    pub(crate) fn reset(&self, pid: i64, window_size: usize, buffer_depth: usize, min: f64, max: f64) {
        self.pid.store(pid, Ordering::Relaxed);
        self.window_size.store(window_size as i64, Ordering::Relaxed);
        self.buffer_depth.store(buffer_depth as i64, Ordering::Relaxed);
        self.set_targets(min, max);
        self.counter.store(0, Ordering::Relaxed);
        self.buffer_index.store(0, Ordering::Relaxed);
        self.read_index.store(0, Ordering::Relaxed);
        self.valid.store(0, Ordering::Release);
    }

    pub(crate) fn set_targets(&self, min: f64, max: f64) {
        self.min_target_rate.store(min.to_bits(), Ordering::Release);
        self.max_target_rate.store(max.to_bits(), Ordering::Release);
    }

    /// Publish the cursors after a record has been written.
    pub(crate) fn publish(&self, counter: i64, buffer_index: usize, read_index: usize) {
        self.counter.store(counter, Ordering::Release);
        self.buffer_index.store(buffer_index as i64, Ordering::Release);
        self.read_index.store(read_index as i64, Ordering::Release);
        self.valid.store(1, Ordering::Release);
    }

    pub fn pid(&self) -> i64 {
        self.pid.load(Ordering::Acquire)
    }
    pub fn window_size(&self) -> i64 {
        self.window_size.load(Ordering::Acquire)
    }
    pub fn buffer_depth(&self) -> i64 {
        self.buffer_depth.load(Ordering::Acquire)
    }
    pub fn min_target_rate(&self) -> f64 {
        f64::from_bits(self.min_target_rate.load(Ordering::Acquire))
    }
    pub fn max_target_rate(&self) -> f64 {
        f64::from_bits(self.max_target_rate.load(Ordering::Acquire))
    }
    pub fn counter(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }
    pub fn buffer_index(&self) -> i64 {
        self.buffer_index.load(Ordering::Acquire)
    }
    pub fn read_index(&self) -> i64 {
        self.read_index.load(Ordering::Acquire)
    }
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) != 0
    }
}

/// One line of the record log.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct BeatRecord {
    pub beat: i64,
    pub tag: i32,
    pub timestamp: i64,
    pub global_rate: f64,
    pub window_rate: f64,
    pub instant_rate: f64,
}

/// Storage for a [`MonitorState`].
pub trait StateBlock: Send + Sync {
    fn state(&self) -> &MonitorState;
}

/// Storage for the ring of [`BeatRecord`]s. Only the monitor writes to it, while
/// holding its lock.
pub trait LogBlock: Send {
    fn slots(&self) -> &[BeatRecord];
    fn slots_mut(&mut self) -> &mut [BeatRecord];
}

/// Hands out state and log storage for a monitor identifier. Dropping a block releases it.
pub trait StateBackend {
    fn allocate_state(&self, id: u32) -> Result<Box<dyn StateBlock>, BackendError>;
    fn allocate_log(&self, id: u32, depth: usize) -> Result<Box<dyn LogBlock>, BackendError>;
}

/// Process-local storage. Nothing outside the process can see it.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBackend;

struct HeapState(Arc<MonitorState>);

impl StateBlock for HeapState {
    fn state(&self) -> &MonitorState {
        &self.0
    }
}

impl LogBlock for Vec<BeatRecord> {
    fn slots(&self) -> &[BeatRecord] {
        self
    }
    fn slots_mut(&mut self) -> &mut [BeatRecord] {
        self
    }
}

impl StateBackend for HeapBackend {
    fn allocate_state(&self, _id: u32) -> Result<Box<dyn StateBlock>, BackendError> {
        Ok(Box::new(HeapState(Arc::new(MonitorState::default()))))
    }

    fn allocate_log(&self, _id: u32, depth: usize) -> Result<Box<dyn LogBlock>, BackendError> {
        if depth == 0 {
            return Err(BackendError::ZeroDepth);
        }
        let mut v = Vec::new();
        v.try_reserve_exact(depth)
            .map_err(|_| BackendError::OutOfMemory(depth))?;
        v.resize(depth, BeatRecord::default());
        Ok(Box::new(v))
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unable to allocate {0} log records")]
    OutOfMemory(usize),

    #[error("log depth must be positive")]
    ZeroDepth,

    #[error("shared memory segment {name}: {source}")]
    SharedMemory {
        name: String,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("shared memory segment {0} has an unexpected size")]
    SizeMismatch(String),
}
