//! Processor Descriptors
//!
//! Based on Mach4 kern/processor.h/c
//!
//! One descriptor per CPU: whether it takes work, which thread it runs, its
//! gate-guarded run queue, and a request flag that interrupts (timer or IPI)
//! check before re-picking.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::error::KernResult;
use crate::kern::lock::{GateCell, Holder};
use crate::kern::runq::RunQueue;
use crate::types::{CpuId, ThreadId};

/// Encodes "no thread" in the `current` mirror
const NO_THREAD: u64 = u64::MAX;

/// Per-CPU scheduling state
pub struct CpuDescriptor {
    id: CpuId,
    enabled: AtomicBool,
    /// Runnable threads assigned to this CPU
    pub(crate) rq: GateCell<RunQueue>,
    /// Lock-free copy of the running thread, read by `Scheduler::holder`
    current: AtomicU64,
    need_resched: AtomicBool,
    /// Threads assigned here, queued or running
    workload: AtomicUsize,
    ticks: AtomicU64,
    switches: AtomicU64,
}

impl CpuDescriptor {
    pub fn new(id: CpuId, levels: usize) -> Self {
        Self {
            id,
            enabled: AtomicBool::new(true),
            rq: GateCell::new(RunQueue::new(levels)),
            current: AtomicU64::new(NO_THREAD),
            need_resched: AtomicBool::new(false),
            workload: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            switches: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Thread running here, if any
    pub fn current(&self) -> Option<ThreadId> {
        match self.current.load(Ordering::Acquire) {
            NO_THREAD => None,
            id => Some(ThreadId(id)),
        }
    }

    pub(crate) fn set_current(&self, thread: Option<ThreadId>) {
        let raw = thread.map_or(NO_THREAD, |t| t.0);
        if self.current.swap(raw, Ordering::AcqRel) != raw {
            self.switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current().is_none()
    }

    /// Ask this CPU to re-pick at its next safe point
    pub fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub(crate) fn clear_resched(&self) {
        self.need_resched.store(false, Ordering::Release);
    }

    pub fn workload(&self) -> usize {
        self.workload.load(Ordering::Relaxed)
    }

    pub(crate) fn add_work(&self) {
        self.workload.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn drop_work(&self) {
        // Never underflows: every drop pairs with an earlier add
        let _ = self
            .workload
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| w.checked_sub(1));
    }

    /// Ticks seen by this CPU
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn advance(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Context switches performed
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Number of queued threads
    pub fn runnable(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.rq.read(holder)?.len())
    }
}

impl core::fmt::Debug for CpuDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuDescriptor")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("current", &self.current())
            .field("workload", &self.workload())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::priority::Priority;

    #[test]
    fn test_current_mirror() {
        let cpu = CpuDescriptor::new(CpuId(1), 4);
        assert!(cpu.is_idle());
        cpu.set_current(Some(ThreadId(7)));
        assert_eq!(cpu.current(), Some(ThreadId(7)));
        cpu.set_current(Some(ThreadId(7)));
        assert_eq!(cpu.switches(), 1);
        cpu.set_current(None);
        assert!(cpu.is_idle());
    }

    #[test]
    fn test_workload_and_resched() {
        let cpu = CpuDescriptor::new(CpuId(0), 4);
        cpu.drop_work();
        assert_eq!(cpu.workload(), 0);
        cpu.add_work();
        cpu.add_work();
        cpu.drop_work();
        assert_eq!(cpu.workload(), 1);

        cpu.request_resched();
        assert!(cpu.need_resched());
        cpu.clear_resched();
        assert!(!cpu.need_resched());
    }

    #[test]
    fn test_gated_run_queue() {
        let cpu = CpuDescriptor::new(CpuId(0), 4);
        let h = Holder::Cpu(CpuId(0));
        cpu.rq.write(h).unwrap().enqueue(ThreadId(1), Priority::new(2, 4)).unwrap();
        assert_eq!(cpu.runnable(h), Ok(1));
    }
}
