//! Packet identifier allocation
//!
//! PIDs cycle 1..=65535 (0 is reserved) and are tracked in an outstanding
//! set until the matching ACK arrives, the wait times out, or the session is
//! torn down. A PID still awaiting its ACK is never handed out again.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::protocol::DecodeError;

struct Inner {
    last: u16,
    outstanding: HashSet<u16>,
}

/// Cycling packet identifier allocator with outstanding-ACK tracking
pub struct PidAllocator {
    inner: Mutex<Inner>,
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PidAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: 0,
                outstanding: HashSet::new(),
            }),
        }
    }

    /// Allocate the next PID and mark it outstanding
    pub fn allocate(&self) -> u16 {
        let mut inner = self.inner.lock();
        loop {
            inner.last = if inner.last < 65535 { inner.last + 1 } else { 1 };
            let pid = inner.last;
            if inner.outstanding.insert(pid) {
                return pid;
            }
        }
    }

    /// Process an ACK for `pid`. An ACK for a PID that was never outstanding
    /// is a protocol error.
    pub fn acknowledge(&self, pid: u16) -> Result<(), DecodeError> {
        if self.inner.lock().outstanding.remove(&pid) {
            Ok(())
        } else {
            Err(DecodeError::UnknownPacketId(pid))
        }
    }

    /// Whether `pid` is still awaiting its ACK
    pub fn is_outstanding(&self, pid: u16) -> bool {
        self.inner.lock().outstanding.contains(&pid)
    }

    /// Abandon a PID whose ACK wait was given up
    pub fn release(&self, pid: u16) {
        self.inner.lock().outstanding.remove(&pid);
    }

    /// Drop all outstanding PIDs (session teardown)
    pub fn clear(&self) {
        self.inner.lock().outstanding.clear();
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_yields_zero_and_wraps() {
        let pids = PidAllocator::new();
        let mut last = 0u16;
        for _ in 0..70_000 {
            let pid = pids.allocate();
            assert_ne!(pid, 0);
            pids.acknowledge(pid).unwrap();
            last = pid;
        }
        // 70_000 allocations crossed the 65535 wrap
        assert!(last > 0);
    }

    #[test]
    fn outstanding_pid_is_not_reissued() {
        let pids = PidAllocator::new();
        let held = pids.allocate();
        // Run past the 65535 wrap; the held PID must be skipped over
        for _ in 0..70_000 {
            let pid = pids.allocate();
            assert_ne!(pid, held);
            pids.acknowledge(pid).unwrap();
        }
        pids.acknowledge(held).unwrap();
    }

    #[test]
    fn unknown_ack_is_protocol_error() {
        let pids = PidAllocator::new();
        assert_eq!(
            pids.acknowledge(17),
            Err(DecodeError::UnknownPacketId(17))
        );
    }

    #[test]
    fn double_ack_is_protocol_error() {
        let pids = PidAllocator::new();
        let pid = pids.allocate();
        pids.acknowledge(pid).unwrap();
        assert!(pids.acknowledge(pid).is_err());
    }

    #[test]
    fn clear_releases_everything() {
        let pids = PidAllocator::new();
        for _ in 0..5 {
            pids.allocate();
        }
        assert_eq!(pids.outstanding_count(), 5);
        pids.clear();
        assert_eq!(pids.outstanding_count(), 0);
    }
}
