// POSIX shared memory storage for the state block and the record log, so that tools
// outside the process can watch a monitor by its identifier.
use crate::{
    constants::{SHM_LOG_PREFIX, SHM_STATE_PREFIX},
    state::{BackendError, BeatRecord, LogBlock, MonitorState, StateBackend, StateBlock},
};
use nix::errno::Errno;
use std::ffi::CString;

#[derive(Debug, Default, Clone, Copy)]
pub struct ShmBackend;

pub fn state_segment_name(id: u32) -> String {
    format!("{}{}", SHM_STATE_PREFIX, id)
}

pub fn log_segment_name(id: u32) -> String {
    format!("{}{}", SHM_LOG_PREFIX, id)
}

#[derive(Debug)]
struct Segment {
    name: String,
    ptr: *mut libc::c_void,
    len: usize,
    owner: bool,
}

// The mapping is plain memory. Mutation goes through &mut (LogBlock) or atomics (MonitorState).
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn create(name: &str, len: usize) -> Result<Segment, BackendError> {
        let cname = c_name(name)?;
        let err = |source| BackendError::SharedMemory {
            name: name.to_owned(),
            source,
        };
        unsafe {
            let fd = libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
            if fd < 0 {
                return Err(err(Errno::last()));
            }
            // truncate to zero first so a stale segment with the same name comes back zeroed
            if libc::ftruncate(fd, 0) != 0 || libc::ftruncate(fd, len as libc::off_t) != 0 {
                let e = Errno::last();
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
                return Err(err(e));
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            let e = Errno::last();
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                libc::shm_unlink(cname.as_ptr());
                return Err(err(e));
            }
            Ok(Segment {
                name: name.to_owned(),
                ptr,
                len,
                owner: true,
            })
        }
    }

    fn attach(name: &str) -> Result<Segment, BackendError> {
        let cname = c_name(name)?;
        let err = |source| BackendError::SharedMemory {
            name: name.to_owned(),
            source,
        };
        unsafe {
            let fd = libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0);
            if fd < 0 {
                return Err(err(Errno::last()));
            }
            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) != 0 {
                let e = Errno::last();
                libc::close(fd);
                return Err(err(e));
            }
            let len = st.st_size as usize;
            if len == 0 {
                libc::close(fd);
                return Err(BackendError::SizeMismatch(name.to_owned()));
            }
            let ptr = libc::mmap(std::ptr::null_mut(), len, libc::PROT_READ, libc::MAP_SHARED, fd, 0);
            let e = Errno::last();
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                return Err(err(e));
            }
            Ok(Segment {
                name: name.to_owned(),
                ptr,
                len,
                owner: false,
            })
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.ptr, self.len) != 0 {
                tracing::warn!("munmap of {} failed: {}", self.name, Errno::last());
            }
            if self.owner {
                if let Ok(cname) = CString::new(self.name.as_str()) {
                    if libc::shm_unlink(cname.as_ptr()) != 0 {
                        tracing::warn!("shm_unlink of {} failed: {}", self.name, Errno::last());
                    }
                }
            }
        }
    }
}

fn c_name(name: &str) -> Result<CString, BackendError> {
    CString::new(name).map_err(|_| BackendError::SharedMemory {
        name: name.to_owned(),
        source: Errno::EINVAL,
    })
}

struct ShmState(Segment);

impl StateBlock for ShmState {
    fn state(&self) -> &MonitorState {
        // len was checked at creation/attach time; mmap returns page-aligned memory
        unsafe { &*(self.0.ptr as *const MonitorState) }
    }
}

struct ShmLog {
    segment: Segment,
    depth: usize,
}

impl LogBlock for ShmLog {
    fn slots(&self) -> &[BeatRecord] {
        unsafe { std::slice::from_raw_parts(self.segment.ptr as *const BeatRecord, self.depth) }
    }

    fn slots_mut(&mut self) -> &mut [BeatRecord] {
        unsafe { std::slice::from_raw_parts_mut(self.segment.ptr as *mut BeatRecord, self.depth) }
    }
}

impl StateBackend for ShmBackend {
    fn allocate_state(&self, id: u32) -> Result<Box<dyn StateBlock>, BackendError> {
        let segment = Segment::create(&state_segment_name(id), std::mem::size_of::<MonitorState>())?;
        Ok(Box::new(ShmState(segment)))
    }

    fn allocate_log(&self, id: u32, depth: usize) -> Result<Box<dyn LogBlock>, BackendError> {
        if depth == 0 {
            return Err(BackendError::ZeroDepth);
        }
        let len = depth
            .checked_mul(std::mem::size_of::<BeatRecord>())
            .ok_or(BackendError::OutOfMemory(depth))?;
        let segment = Segment::create(&log_segment_name(id), len)?;
        Ok(Box::new(ShmLog { segment, depth }))
    }
}

/// A read-only view of another monitor's shared state, for external consumers.
/// Reads are not synchronized with the writer: a record can be observed mid-update.
pub struct ShmAttachment {
    state: Segment,
    log: Segment,
    depth: usize,
}

impl ShmAttachment {
    pub fn attach(id: u32) -> Result<ShmAttachment, BackendError> {
        let state_name = state_segment_name(id);
        let state = Segment::attach(&state_name)?;
        if state.len < std::mem::size_of::<MonitorState>() {
            return Err(BackendError::SizeMismatch(state_name));
        }
        let log_name = log_segment_name(id);
        let log = Segment::attach(&log_name)?;
        let depth = log.len / std::mem::size_of::<BeatRecord>();
        let attachment = ShmAttachment { state, log, depth };
        if attachment.state().buffer_depth() as usize != depth {
            return Err(BackendError::SizeMismatch(log_name));
        }
        Ok(attachment)
    }

    pub fn state(&self) -> &MonitorState {
        unsafe { &*(self.state.ptr as *const MonitorState) }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn record(&self, index: usize) -> Option<BeatRecord> {
        if index >= self.depth {
            return None;
        }
        unsafe {
            let base = self.log.ptr as *const BeatRecord;
            Some(std::ptr::read_volatile(base.add(index)))
        }
    }

    /// The most recently committed record, if any beat has been recorded.
    pub fn latest(&self) -> Option<BeatRecord> {
        let state = self.state();
        if !state.valid() {
            return None;
        }
        let index = state.buffer_index() as usize;
        let last = if index == 0 { self.depth - 1 } else { index - 1 };
        self.record(last)
    }

    /// Records with beat numbers `from..counter` that are still in the ring, oldest first.
    /// Beat `b` lives in slot `b % depth`; slots already overwritten by a newer beat are skipped.
    pub fn records_since(&self, from: i64) -> Vec<BeatRecord> {
        let counter = self.state().counter();
        let start = std::cmp::max(from, counter - self.depth as i64).max(0);
        (start..counter)
            .filter_map(|beat| {
                self.record(beat as usize % self.depth)
                    .filter(|r| r.beat == beat)
            })
            .collect()
    }
}

impl core::fmt::Debug for ShmAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmAttachment")
            .field("state", &self.state.name)
            .field("log", &self.log.name)
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // high ids so we don't collide with a real pid-keyed monitor
    const TEST_ID: u32 = 3_900_000_001;

    #[test]
    fn attach_sees_writer() {
        let backend = ShmBackend;
        let state = backend.allocate_state(TEST_ID).unwrap();
        let mut log = backend.allocate_log(TEST_ID, 4).unwrap();
        state.state().reset(TEST_ID as i64, 2, 4, 0., 0.);

        log.slots_mut()[0] = BeatRecord {
            beat: 0,
            tag: 9,
            timestamp: 1234,
            ..Default::default()
        };
        state.state().publish(1, 1, 0);

        let reader = ShmAttachment::attach(TEST_ID).unwrap();
        assert_eq!(reader.depth(), 4);
        assert_eq!(reader.state().counter(), 1);
        assert_eq!(reader.latest().unwrap().timestamp, 1234);
        assert_eq!(reader.latest().unwrap().tag, 9);
        assert!(reader.record(4).is_none());

        drop(reader);

        for beat in 1..6 {
            log.slots_mut()[beat as usize % 4] = BeatRecord {
                beat,
                timestamp: 1234 + beat,
                ..Default::default()
            };
            state.state().publish(beat + 1, (beat as usize + 1) % 4, 0);
        }
        let reader = ShmAttachment::attach(TEST_ID).unwrap();
        let beats = |from| {
            reader
                .records_since(from)
                .iter()
                .map(|r| r.beat)
                .collect::<Vec<_>>()
        };
        // only the last `depth` beats survive
        assert_eq!(beats(0), vec![2, 3, 4, 5]);
        assert_eq!(beats(4), vec![4, 5]);
        assert!(beats(6).is_empty());
        drop(reader);
        drop(log);
        drop(state);
        assert!(ShmAttachment::attach(TEST_ID).is_err());
    }
}
