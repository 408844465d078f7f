//! Run Queue Management
//!
//! Based on Mach4 kern/sched.h run queue structures
//!
//! One FIFO per priority level, plus a cursor at the most urgent non-empty
//! level so that picking the next thread does not scan empty levels. A run
//! queue is owned by one CPU descriptor and guarded by its gate.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{KernError, KernResult};
use crate::kern::priority::Priority;
use crate::types::ThreadId;

/// Multi-level run queue
#[derive(Debug)]
pub struct RunQueue {
    /// One queue per priority level (0 = highest)
    queues: Vec<VecDeque<ThreadId>>,
    /// Lowest-numbered non-empty level, `queues.len()` when empty
    lowest_filled: usize,
    /// Count of queued threads
    count: usize,
}

impl RunQueue {
    pub fn new(levels: usize) -> Self {
        let levels = levels.max(1);
        Self {
            queues: (0..levels).map(|_| VecDeque::new()).collect(),
            lowest_filled: levels,
            count: 0,
        }
    }

    pub fn levels(&self) -> usize {
        self.queues.len()
    }

    fn level_of(&self, priority: Priority) -> usize {
        priority.value().min(self.queues.len() - 1)
    }

    /// Append at the tail of the thread's level
    ///
    /// Fails with `OutOfMemory`, leaving the queue untouched, when the level
    /// cannot grow.
    pub fn enqueue(&mut self, thread: ThreadId, priority: Priority) -> KernResult<()> {
        let level = self.level_of(priority);
        self.queues[level]
            .try_reserve(1)
            .map_err(|_| KernError::OutOfMemory)?;
        self.queues[level].push_back(thread);
        self.count += 1;
        if level < self.lowest_filled {
            self.lowest_filled = level;
        }
        Ok(())
    }

    /// Move a queued thread to the tail of `priority`'s level
    pub fn requeue(&mut self, thread: ThreadId, priority: Priority) -> KernResult<()> {
        let level = self.level_of(priority);
        self.queues[level]
            .try_reserve(1)
            .map_err(|_| KernError::OutOfMemory)?;
        if self.remove(thread) {
            self.enqueue(thread, priority)?;
        }
        Ok(())
    }

    /// Take the head of the most urgent non-empty level
    pub fn dequeue(&mut self) -> Option<ThreadId> {
        let level = self.lowest_filled;
        let thread = self.queues.get_mut(level)?.pop_front()?;
        self.count -= 1;
        self.update_lowest();
        Some(thread)
    }

    /// Remove a specific thread wherever it sits
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        for level in self.lowest_filled..self.queues.len() {
            if let Some(pos) = self.queues[level].iter().position(|&t| t == thread) {
                self.queues[level].remove(pos);
                self.count -= 1;
                self.update_lowest();
                return true;
            }
        }
        false
    }

    /// Empty the queue, most urgent first
    pub fn drain(&mut self) -> KernResult<Vec<ThreadId>> {
        let mut out = Vec::new();
        out.try_reserve_exact(self.count)
            .map_err(|_| KernError::OutOfMemory)?;
        while let Some(t) = self.dequeue() {
            out.push(t);
        }
        Ok(out)
    }

    fn update_lowest(&mut self) {
        while self.lowest_filled < self.queues.len() && self.queues[self.lowest_filled].is_empty() {
            self.lowest_filled += 1;
        }
    }

    /// Most urgent non-empty level
    pub fn lowest_filled(&self) -> Option<Priority> {
        if self.lowest_filled < self.queues.len() {
            Some(Priority::new(self.lowest_filled, self.queues.len()))
        } else {
            None
        }
    }

    /// Threads queued at `level`, head first
    pub fn level(&self, level: usize) -> impl Iterator<Item = ThreadId> + '_ {
        self.queues.get(level).into_iter().flat_map(|q| q.iter().copied())
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.queues.iter().any(|q| q.contains(&thread))
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
