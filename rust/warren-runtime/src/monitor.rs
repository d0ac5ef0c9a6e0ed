//! Stuck-service detection.
//!
//! Each worker owns a [`WorkerMonitor`] record. The dispatch loop calls
//! [`trigger`] with `(source, destination)` before invoking a callback
//! and `(0, 0)` after it returns; the monitor thread compares the version
//! counter every cycle. A version that has not moved while a destination
//! is recorded means the callback has been running the whole cycle.
//!
//! [`trigger`]: WorkerMonitor::trigger

use std::sync::atomic::{AtomicU32, Ordering};

use warren_core::Handle;

/// Seconds between monitor sweeps.
pub const MONITOR_INTERVAL_SECS: u64 = 5;

/// One worker's in-flight dispatch record.
#[derive(Debug, Default)]
pub struct WorkerMonitor {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

/// A dispatch the monitor judged stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckDispatch {
    pub source: Handle,
    pub destination: Handle,
    pub version: u32,
}

impl WorkerMonitor {
    pub fn new() -> WorkerMonitor {
        WorkerMonitor::default()
    }

    /// Record the message being dispatched (or `(INVALID, INVALID)` on
    /// completion) and bump the version.
    pub fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source.raw(), Ordering::Relaxed);
        self.destination.store(destination.raw(), Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// One monitor sweep. Returns the stuck dispatch if the version has
    /// not moved since the previous sweep while a destination was
    /// recorded; otherwise remembers the current version.
    pub fn check(&self) -> Option<StuckDispatch> {
        let version = self.version.load(Ordering::Acquire);
        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = Handle::from_raw(self.destination.load(Ordering::Relaxed));
            if destination.is_valid() {
                return Some(StuckDispatch {
                    source: Handle::from_raw(self.source.load(Ordering::Relaxed)),
                    destination,
                    version,
                });
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u32) -> Handle {
        Handle::from_raw(raw)
    }

    #[test]
    fn idle_worker_is_never_stuck() {
        let m = WorkerMonitor::new();
        assert_eq!(m.check(), None);
        assert_eq!(m.check(), None);
    }

    #[test]
    fn completed_dispatch_is_not_stuck() {
        let m = WorkerMonitor::new();
        m.trigger(h(1), h(2));
        m.trigger(Handle::INVALID, Handle::INVALID);
        // First sweep records the new version, second sees no progress
        // but also no destination.
        assert_eq!(m.check(), None);
        assert_eq!(m.check(), None);
    }

    #[test]
    fn unfinished_dispatch_is_stuck_on_second_sweep() {
        let m = WorkerMonitor::new();
        m.trigger(h(0x0100_0001), h(0x0100_0002));
        assert_eq!(m.check(), None);
        let stuck = m.check().expect("second sweep flags the dispatch");
        assert_eq!(stuck.destination, h(0x0100_0002));
        assert_eq!(stuck.source, h(0x0100_0001));
    }

    #[test]
    fn progress_between_sweeps_resets_detection() {
        let m = WorkerMonitor::new();
        m.trigger(h(1), h(2));
        assert_eq!(m.check(), None);
        m.trigger(Handle::INVALID, Handle::INVALID);
        m.trigger(h(1), h(3));
        assert_eq!(m.check(), None);
    }
}
