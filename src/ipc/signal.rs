//! Signals
//!
//! Asynchronous notifications queued on a process. The kernel generates
//! them for thread death, process exit and IRQ delivery; processes with the
//! right to do so may send their own. Sending never blocks.

use crate::types::{ProcessId, ThreadId};

/// A thread of the process named in `code` died
pub const SIG_THREAD_DEATH: u32 = 1;
/// The process named in `code` exited
pub const SIG_PROCESS_EXIT: u32 = 2;
/// IRQ line `code` fired
pub const SIG_IRQ: u32 = 3;
/// First number available to processes
pub const SIG_USER: u32 = 32;

/// Pending signals a process may accumulate
pub const MAX_PENDING_SIGNALS: usize = 64;

/// A queued signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub signum: u32,
    pub code: u64,
    /// `None` when generated by the kernel
    pub sender: Option<ProcessId>,
}

impl Signal {
    pub const fn kernel(signum: u32, code: u64) -> Self {
        Self {
            signum,
            code,
            sender: None,
        }
    }

    pub const fn thread_death(thread: ThreadId) -> Self {
        Self::kernel(SIG_THREAD_DEATH, thread.0)
    }

    pub const fn process_exit(pid: ProcessId) -> Self {
        Self::kernel(SIG_PROCESS_EXIT, pid.0)
    }

    pub const fn irq(line: u32) -> Self {
        Self::kernel(SIG_IRQ, line as u64)
    }

    pub fn is_kernel(&self) -> bool {
        self.sender.is_none()
    }
}

/// Bounded FIFO of pending signals
pub type SignalQueue = heapless::Deque<Signal, MAX_PENDING_SIGNALS>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_signals() {
        let s = Signal::thread_death(ThreadId(9));
        assert_eq!(s.signum, SIG_THREAD_DEATH);
        assert_eq!(s.code, 9);
        assert!(s.is_kernel());
        assert_eq!(Signal::irq(5).code, 5);
    }

    #[test]
    fn test_queue_is_bounded() {
        let mut q = SignalQueue::new();
        for i in 0..MAX_PENDING_SIGNALS {
            assert!(q.push_back(Signal::irq(i as u32)).is_ok());
        }
        assert!(q.push_back(Signal::irq(0)).is_err());
        assert_eq!(q.pop_front().map(|s| s.code), Some(0));
    }
}
