//! In-process event rate monitor.
//!
//! A program calls [`HeartbeatMonitor::record_event`] every time it finishes a unit of
//! work, and the monitor keeps three rates up to date: instant (from the last interval),
//! windowed (smoothed over the last `window_size` intervals) and global (since the first
//! event). Each event produces a [`BeatRecord`] in a bounded ring; every time the ring
//! fills it is written out to an optional tab separated text log.
//!
//! The state block and the ring live in storage handed out by a [`StateBackend`]. The
//! default is POSIX shared memory named after the process id, so that an outside process
//! (see the `heartbeat-watch` binary) can follow along. An empty file named after the
//! process id in `$HEARTBEAT_ENABLED_DIR` marks the monitor as live.
//!
//! ```no_run
//! let monitor = heartbeat::init(20, 100, Some("heartbeat.log".as_ref()), 0., 0.)?;
//! for i in 0..1000 {
//!     // ... work ...
//!     monitor.record_event(i)?;
//! }
//! println!("{} events/s", monitor.window_rate());
//! monitor.finish();
//! # Ok::<(), heartbeat::HeartbeatError>(())
//! ```
pub mod constants;
pub mod discovery;
pub mod logging;
pub mod monitor;
pub mod ring;
pub mod shm;
pub mod state;
pub mod textlog;
pub mod time;

pub use monitor::{HeartbeatError, HeartbeatMonitor, MonitorOptions, Result};
pub use state::{BeatRecord, HeapBackend, MonitorState, StateBackend};
pub use shm::{ShmAttachment, ShmBackend};
pub use time::clock::{FileTimestampSource, MonotonicClock, SimulatedClock, TimestampSource};

/// Start a monitor keyed by the current process id, backed by shared memory and the
/// monotonic clock, with the discovery directory taken from `$HEARTBEAT_ENABLED_DIR`.
pub fn init(
    window_size: usize,
    buffer_depth: usize,
    log_path: Option<&std::path::Path>,
    min_target: f64,
    max_target: f64,
) -> Result<HeartbeatMonitor> {
    let mut options = MonitorOptions::new(window_size, buffer_depth).targets(min_target, max_target);
    if let Some(path) = log_path {
        options = options.log_path(path);
    }
    options.init()
}
