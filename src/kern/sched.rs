//! Scheduler
//!
//! Based on Mach4 kern/sched_prim.c
//!
//! Per-CPU prioritized run queues with timer-driven preemption. Each CPU
//! runs its own dispatch loop: the architecture layer calls [`Scheduler::tick`]
//! from the timer interrupt and [`Scheduler::pick`] whenever the running
//! thread blocks, yields or is asked to by an IPI. Both take the trap-frame
//! registers and swap them for the chosen thread's.
//!
//! ## Lock order
//!
//! thread table -> CPU run queue
//!
//! ## `current`
//!
//! A CPU's current thread is the one whose registers it holds. A running
//! thread that blocks or dies stays current until the next `pick` on that
//! CPU saves its registers.
//!
//! No other CPU may queue a thread while its registers are live somewhere.
//! Moving such a thread records the destination in `Thread::migrate` and
//! interrupts the holding CPU, whose next `pick` saves the registers and
//! hands the thread over.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::KernelConfig;
use crate::error::{KernError, KernResult};
use crate::hal::IpiService;
use crate::kern::lock::{GateCell, Holder};
use crate::kern::priority::Priority;
use crate::kern::processor::CpuDescriptor;
use crate::kern::thread::{BlockReason, Registers, Thread, ThreadInfo, ThreadState};
use crate::types::{CpuId, ProcessId, ThreadId, VirtAddr};

/// Per-CPU multi-level scheduler
pub struct Scheduler {
    levels: usize,
    default_priority: Priority,
    timeslice: u32,
    cpus: Vec<CpuDescriptor>,
    threads: GateCell<BTreeMap<ThreadId, Thread>>,
    next_tid: AtomicU64,
    ipi: Arc<dyn IpiService>,
}

impl Scheduler {
    pub fn new(config: &KernelConfig, ipi: Arc<dyn IpiService>) -> Self {
        let levels = config.sched_priorities;
        Self {
            levels,
            default_priority: Priority::new(config.default_priority, levels),
            timeslice: config.timeslice_ticks.max(1),
            cpus: (0..config.cpus)
                .map(|i| CpuDescriptor::new(CpuId(i as u32), levels))
                .collect(),
            threads: GateCell::new(BTreeMap::new()),
            next_tid: AtomicU64::new(1),
            ipi,
        }
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn cpu(&self, id: CpuId) -> KernResult<&CpuDescriptor> {
        self.cpus.get(id.index()).ok_or(KernError::InvalidArgument)
    }

    pub fn cpus(&self) -> &[CpuDescriptor] {
        &self.cpus
    }

    /// Thread whose registers `cpu` holds
    pub fn current(&self, cpu: CpuId) -> Option<ThreadId> {
        self.cpus.get(cpu.index()).and_then(|c| c.current())
    }

    /// Lock identity of code running on `cpu`
    pub fn holder(&self, cpu: CpuId) -> Holder {
        match self.current(cpu) {
            Some(thread) => Holder::Thread(thread),
            None => Holder::Cpu(cpu),
        }
    }

    // ------------------------------------------------------------------------
    // Internals (thread table held)
    // ------------------------------------------------------------------------

    /// Least loaded enabled CPU, `preferred` if it is enabled
    fn placement(&self, preferred: Option<CpuId>) -> KernResult<CpuId> {
        if let Some(cpu) = preferred {
            if self.cpu(cpu)?.is_enabled() {
                return Ok(cpu);
            }
        }
        self.cpus
            .iter()
            .filter(|c| c.is_enabled())
            .min_by_key(|c| (c.workload(), c.id().0))
            .map(|c| c.id())
            .ok_or(KernError::InvalidState)
    }

    fn caller_cpu(threads: &BTreeMap<ThreadId, Thread>, holder: Holder) -> Option<CpuId> {
        match holder {
            Holder::Cpu(cpu) => Some(cpu),
            Holder::Thread(tid) => threads.get(&tid).map(|t| t.cpu),
        }
    }

    /// Take a runnable thread off its CPU's books
    fn detach(&self, holder: Holder, thread: &Thread) -> KernResult<()> {
        let cpu = self.cpu(thread.cpu)?;
        match thread.state {
            ThreadState::Ready => {
                cpu.rq.write(holder)?.remove(thread.id);
                cpu.drop_work();
            }
            ThreadState::Running => {
                cpu.drop_work();
                if cpu.current() == Some(thread.id) {
                    cpu.request_resched();
                }
            }
            ThreadState::Blocked(_) | ThreadState::Dead => {}
        }
        Ok(())
    }

    /// Is `thread` the current thread of the CPU it is booked on
    fn holds_registers(&self, thread: &Thread) -> bool {
        self.cpus
            .get(thread.cpu.index())
            .is_some_and(|c| c.current() == Some(thread.id))
    }

    /// Queue `thread` at the tail of its level on `cpu`
    ///
    /// Returns false if the thread's registers are still live on another
    /// CPU. It then keeps running there until that CPU's next pick forwards
    /// it to `cpu`.
    fn enqueue(&self, holder: Holder, thread: &mut Thread, cpu: CpuId) -> KernResult<bool> {
        let target = self.cpu(cpu)?;
        if cpu != thread.cpu && self.holds_registers(thread) {
            let owner = self.cpu(thread.cpu)?;
            self.detach(holder, thread)?;
            thread.state = ThreadState::Running;
            thread.migrate = Some(cpu);
            owner.add_work();
            owner.request_resched();
            self.ipi.request_reschedule(owner.id());
            log::trace!("sched: {} leaves {} for {} at its next pick", thread.id, owner.id(), cpu);
            return Ok(false);
        }

        self.detach(holder, thread)?;
        thread.cpu = cpu;
        thread.migrate = None;
        let queued = target.rq.write(holder)?.enqueue(thread.id, thread.priority);
        if let Err(e) = queued {
            // Off every queue; a later wake retries
            thread.state = ThreadState::Blocked(BlockReason::Suspended);
            return Err(e);
        }
        thread.state = ThreadState::Ready;
        target.add_work();
        log::trace!("sched: {} queued on {} at {}", thread.id, cpu, thread.priority);
        Ok(true)
    }

    /// Flag `cpu` for a re-pick if `priority` beats what it runs
    fn preempt_check(
        &self,
        threads: &BTreeMap<ThreadId, Thread>,
        cpu: &CpuDescriptor,
        priority: Priority,
    ) {
        let running = cpu
            .current()
            .and_then(|c| threads.get(&c))
            .filter(|t| t.state == ThreadState::Running && t.cpu == cpu.id())
            .map(|t| t.priority);
        if running.map_or(true, |p| priority.is_higher_than(p)) {
            cpu.request_resched();
        }
    }

    // ------------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------------

    /// Create a ready thread for `pid`
    ///
    /// `cpu` of `None` places it on the least loaded CPU; `priority` of
    /// `None` uses the configured default.
    pub fn thread_new(
        &self,
        holder: Holder,
        pid: ProcessId,
        cpu: Option<CpuId>,
        priority: Option<Priority>,
        regs: Registers,
        stack_base: VirtAddr,
    ) -> KernResult<ThreadId> {
        let mut threads = self.threads.write(holder)?;
        let cpu = self.placement(cpu)?;
        let priority = priority
            .map(|p| Priority::new(p.value(), self.levels))
            .unwrap_or(self.default_priority);
        let id = ThreadId(self.next_tid.fetch_add(1, Ordering::Relaxed));

        let mut thread = Thread::new(id, pid, cpu, priority, regs, stack_base);
        thread.state = ThreadState::Blocked(BlockReason::Suspended);
        self.enqueue(holder, &mut thread, cpu)?;
        let target = self.cpu(cpu)?;
        self.preempt_check(&threads, target, priority);
        threads.insert(id, thread);

        log::debug!("sched: new {} for {} on {} at {}", id, pid, cpu, priority);
        Ok(id)
    }

    /// Put `thread` at the tail of `cpu`'s queue at `priority`
    ///
    /// Unknown and dead threads are ignored. A thread running on another CPU
    /// gets there once that CPU has switched it out.
    pub fn add(&self, holder: Holder, cpu: CpuId, priority: Priority, thread: ThreadId) -> KernResult<()> {
        self.cpu(cpu)?;
        let mut threads = self.threads.write(holder)?;
        let caller = Self::caller_cpu(&threads, holder);
        let Some(t) = threads.get_mut(&thread) else {
            return Ok(());
        };
        if t.state.is_dead() {
            return Ok(());
        }
        t.priority = Priority::new(priority.value(), self.levels);
        let pri = t.priority;
        if self.enqueue(holder, t, cpu)? {
            self.preempt_check(&threads, self.cpu(cpu)?, pri);
            if caller != Some(cpu) {
                self.ipi.request_reschedule(cpu);
            }
        }
        Ok(())
    }

    /// Pull `thread` off the run queues into `state`
    ///
    /// `state` must be `Blocked` or `Dead`. Unknown and dead threads are
    /// ignored. A thread running on another CPU is stopped at that CPU's next
    /// safe point, requested by IPI.
    pub fn remove(&self, holder: Holder, thread: ThreadId, state: ThreadState) -> KernResult<()> {
        if state.is_runnable() {
            return Err(KernError::InvalidArgument);
        }
        let mut threads = self.threads.write(holder)?;
        let caller = Self::caller_cpu(&threads, holder);
        let Some(t) = threads.get_mut(&thread) else {
            return Ok(());
        };
        if t.state.is_dead() {
            return Ok(());
        }
        let was_running = t.state == ThreadState::Running;
        self.detach(holder, t)?;
        t.state = state;
        if was_running && caller != Some(t.cpu) {
            self.ipi.request_reschedule(t.cpu);
        }
        log::trace!("sched: {} -> {:?}", thread, state);
        Ok(())
    }

    pub fn block(&self, holder: Holder, thread: ThreadId, reason: BlockReason) -> KernResult<()> {
        self.remove(holder, thread, ThreadState::Blocked(reason))
    }

    /// Mark `thread` dead; it stays in the table until reaped
    pub fn exit(&self, holder: Holder, thread: ThreadId) -> KernResult<()> {
        self.remove(holder, thread, ThreadState::Dead)
    }

    /// Block `thread` for `ticks` ticks of its CPU
    pub fn sleep(&self, holder: Holder, thread: ThreadId, ticks: u64) -> KernResult<()> {
        let until = {
            let threads = self.threads.read(holder)?;
            let Some(t) = threads.get(&thread) else {
                return Ok(());
            };
            self.cpu(t.cpu)?.ticks() + ticks.max(1)
        };
        self.block(holder, thread, BlockReason::Sleep { until })
    }

    /// Make a blocked thread ready on the CPU it last ran on
    ///
    /// Waking onto another CPU sends it an IPI asking for a re-pick. A thread
    /// whose old CPU still holds its registers resumes there until that CPU
    /// forwards it. Returns false if the thread was not blocked.
    pub fn wake(&self, holder: Holder, thread: ThreadId) -> KernResult<bool> {
        let mut threads = self.threads.write(holder)?;
        let caller = Self::caller_cpu(&threads, holder);
        let Some(t) = threads.get_mut(&thread) else {
            return Ok(false);
        };
        if !matches!(t.state, ThreadState::Blocked(_)) {
            return Ok(false);
        }
        let cpu = self.placement(Some(t.cpu))?;
        let pri = t.priority;
        if self.enqueue(holder, t, cpu)? {
            self.preempt_check(&threads, self.cpu(cpu)?, pri);
            if caller != Some(cpu) {
                self.ipi.request_reschedule(cpu);
            }
        }
        Ok(true)
    }

    /// Remove a dead thread from the table
    pub fn reap(&self, holder: Holder, thread: ThreadId) -> KernResult<Thread> {
        let mut threads = self.threads.write(holder)?;
        match threads.get(&thread) {
            None => Err(KernError::NoSuchThread),
            Some(t) if !t.state.is_dead() => Err(KernError::InvalidState),
            Some(_) => threads.remove(&thread).ok_or(KernError::NoSuchThread),
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Choose what `cpu` runs next
    ///
    /// Saves `regs` into the outgoing thread and loads the incoming thread's
    /// registers into `regs`. A running thread keeps the CPU unless a thread
    /// of equal or higher priority is queued, it has been moved elsewhere, or
    /// this CPU is disabled. Returns `None` when the CPU goes idle.
    pub fn pick(&self, holder: Holder, cpu_id: CpuId, regs: &mut Registers) -> KernResult<Option<ThreadId>> {
        let cpu = self.cpu(cpu_id)?;
        let mut threads = self.threads.write(holder)?;
        cpu.clear_resched();

        if let Some(t) = cpu.current().and_then(|c| threads.get_mut(&c)) {
            if t.cpu == cpu_id {
                t.regs = *regs;
            }
            let running_here = t.state == ThreadState::Running && t.cpu == cpu_id;
            let forward = match t.migrate.take() {
                Some(to) if t.state.is_runnable() => Some(Some(to)),
                None if running_here && !cpu.is_enabled() => Some(None),
                _ => None,
            };

            if let Some(preferred) = forward {
                // Registers are saved; the thread may now run anywhere
                cpu.set_current(None);
                let to = self.placement(preferred)?;
                let pri = t.priority;
                self.enqueue(holder, t, to)?;
                if to != cpu_id {
                    self.preempt_check(&threads, self.cpu(to)?, pri);
                    self.ipi.request_reschedule(to);
                }
            } else if running_here {
                let mut rq = cpu.rq.write(holder)?;
                match rq.lowest_filled() {
                    Some(p) if !t.priority.is_higher_than(p) => {
                        rq.enqueue(t.id, t.priority)?;
                        t.state = ThreadState::Ready;
                    }
                    _ => return Ok(Some(t.id)),
                }
            }
        }

        if !cpu.is_enabled() {
            cpu.set_current(None);
            return Ok(None);
        }

        let mut rq = cpu.rq.write(holder)?;
        let next = loop {
            let Some(tid) = rq.dequeue() else {
                break None;
            };
            if threads.get(&tid).is_some_and(|t| t.state == ThreadState::Ready) {
                break Some(tid);
            }
            log::warn!("sched: stale run-queue entry {} on {}", tid, cpu_id);
        };

        match next.and_then(|tid| threads.get_mut(&tid)) {
            Some(t) => {
                t.state = ThreadState::Running;
                t.cpu = cpu_id;
                t.slice = self.timeslice;
                *regs = t.regs;
                cpu.set_current(Some(t.id));
                Ok(Some(t.id))
            }
            None => {
                cpu.set_current(None);
                Ok(None)
            }
        }
    }

    /// Timer interrupt on `cpu`
    ///
    /// Wakes this CPU's sleepers whose deadline has come and charges the
    /// running thread one tick. An exhausted slice punishes the thread and
    /// sends it to the back of its new level before re-picking.
    pub fn tick(&self, holder: Holder, cpu_id: CpuId, regs: &mut Registers) -> KernResult<Option<ThreadId>> {
        let cpu = self.cpu(cpu_id)?;
        let now = cpu.advance();

        let repick = {
            let mut threads = self.threads.write(holder)?;
            let due: Vec<ThreadId> = threads
                .values()
                .filter(|t| {
                    t.cpu == cpu_id
                        && matches!(t.state, ThreadState::Blocked(BlockReason::Sleep { until }) if until <= now)
                })
                .map(|t| t.id)
                .collect();
            for id in due {
                if let Some(t) = threads.get_mut(&id) {
                    let to = self.placement(Some(cpu_id))?;
                    let pri = t.priority;
                    if self.enqueue(holder, t, to)? {
                        self.preempt_check(&threads, self.cpu(to)?, pri);
                        if to != cpu_id {
                            self.ipi.request_reschedule(to);
                        }
                    }
                }
            }

            match cpu.current().and_then(|c| threads.get_mut(&c)) {
                Some(t) if t.state == ThreadState::Running && t.cpu == cpu_id => {
                    t.slice = t.slice.saturating_sub(1);
                    if t.slice == 0 {
                        t.priority = t.priority.punish(self.levels);
                        t.regs = *regs;
                        cpu.rq.write(holder)?.enqueue(t.id, t.priority)?;
                        t.state = ThreadState::Ready;
                        true
                    } else {
                        false
                    }
                }
                _ => true,
            }
        };

        if repick || cpu.need_resched() {
            self.pick(holder, cpu_id, regs)
        } else {
            Ok(cpu.current())
        }
    }

    /// The running thread gives up the CPU
    ///
    /// `productive` yields (after useful work) are rewarded, bare yields
    /// punished.
    pub fn yield_now(
        &self,
        holder: Holder,
        cpu_id: CpuId,
        regs: &mut Registers,
        productive: bool,
    ) -> KernResult<Option<ThreadId>> {
        let cpu = self.cpu(cpu_id)?;
        {
            let mut threads = self.threads.write(holder)?;
            if let Some(t) = cpu.current().and_then(|c| threads.get_mut(&c)) {
                if t.state == ThreadState::Running && t.cpu == cpu_id {
                    t.priority = if productive {
                        t.priority.reward()
                    } else {
                        t.priority.punish(self.levels)
                    };
                    t.regs = *regs;
                    cpu.rq.write(holder)?.enqueue(t.id, t.priority)?;
                    t.state = ThreadState::Ready;
                }
            }
        }
        self.pick(holder, cpu_id, regs)
    }

    // ------------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------------

    /// Raise `thread` one level, as after a completed message exchange
    pub fn reward(&self, holder: Holder, thread: ThreadId) -> KernResult<()> {
        let mut threads = self.threads.write(holder)?;
        if let Some(t) = threads.get_mut(&thread) {
            let better = t.priority.reward();
            if better != t.priority && t.state == ThreadState::Ready {
                // Re-file at the new level
                self.cpu(t.cpu)?.rq.write(holder)?.requeue(t.id, better)?;
            }
            t.priority = better;
        }
        Ok(())
    }

    /// Store a syscall result in the thread's first argument register
    pub fn set_return(&self, holder: Holder, thread: ThreadId, value: usize) -> KernResult<()> {
        let mut threads = self.threads.write(holder)?;
        let t = threads.get_mut(&thread).ok_or(KernError::NoSuchThread)?;
        t.regs.args[0] = value;
        Ok(())
    }

    pub fn registers(&self, holder: Holder, thread: ThreadId) -> KernResult<Registers> {
        let threads = self.threads.read(holder)?;
        threads.get(&thread).map(|t| t.regs).ok_or(KernError::NoSuchThread)
    }

    pub fn thread(&self, holder: Holder, thread: ThreadId) -> KernResult<ThreadInfo> {
        let threads = self.threads.read(holder)?;
        threads.get(&thread).map(ThreadInfo::from).ok_or(KernError::NoSuchThread)
    }

    pub fn threads_of(&self, holder: Holder, pid: ProcessId) -> KernResult<Vec<ThreadId>> {
        let threads = self.threads.read(holder)?;
        Ok(threads.values().filter(|t| t.pid == pid).map(|t| t.id).collect())
    }

    pub fn thread_count(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.threads.read(holder)?.len())
    }

    /// Record that `thread` drives `irq`
    pub fn add_irq_line(&self, holder: Holder, thread: ThreadId, irq: u32) -> KernResult<()> {
        let mut threads = self.threads.write(holder)?;
        let t = threads.get_mut(&thread).ok_or(KernError::NoSuchThread)?;
        if !t.irq_lines.contains(&irq) {
            t.irq_lines.push(irq);
        }
        Ok(())
    }

    /// Take a CPU in or out of service
    ///
    /// A disabled CPU hands its queued threads to the least loaded enabled
    /// CPU, interrupting each CPU that receives one, and gives up its
    /// running thread at its next pick. The last enabled CPU cannot be
    /// disabled.
    pub fn set_cpu_enabled(&self, holder: Holder, cpu_id: CpuId, enabled: bool) -> KernResult<()> {
        let cpu = self.cpu(cpu_id)?;
        if enabled {
            cpu.set_enabled(true);
            log::info!("sched: {} enabled", cpu_id);
            return Ok(());
        }
        if !self.cpus.iter().any(|c| c.id() != cpu_id && c.is_enabled()) {
            return Err(KernError::InvalidState);
        }

        let mut threads = self.threads.write(holder)?;
        cpu.set_enabled(false);
        let queued = cpu.rq.write(holder)?.drain()?;
        let mut kicked: Vec<CpuId> = Vec::new();
        for id in queued {
            if let Some(t) = threads.get_mut(&id) {
                // Already off the queue; only the bookkeeping remains
                cpu.drop_work();
                t.state = ThreadState::Blocked(BlockReason::Suspended);
                let to = self.placement(None)?;
                let pri = t.priority;
                if self.enqueue(holder, t, to)? {
                    self.preempt_check(&threads, self.cpu(to)?, pri);
                    if !kicked.contains(&to) {
                        kicked.push(to);
                    }
                }
            }
        }
        for to in kicked {
            self.ipi.request_reschedule(to);
        }
        cpu.request_resched();
        self.ipi.request_reschedule(cpu_id);
        log::info!("sched: {} disabled", cpu_id);
        Ok(())
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("levels", &self.levels)
            .field("timeslice", &self.timeslice)
            .field("cpus", &self.cpus)
            .finish_non_exhaustive()
    }
}
