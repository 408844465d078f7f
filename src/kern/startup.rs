//! Kernel Startup
//!
//! Based on Mach4 kern/startup.c by CMU (1988-1991)
//!
//! The [`Kernel`] is the service object the architecture layer drives. It
//! comes up in two steps:
//!
//! 1. [`Kernel::bootstrap`] checks the boot environment, carves lock-pool
//!    page zero and builds the heap on the boot heap window. Nothing has a
//!    thread yet, so every lock is taken as `Holder::Cpu`.
//! 2. [`Kernel::init`] builds the VMA layer, the scheduler, the process
//!    table and the IPC state on top of the heap.
//!
//! Every service accessor returns `NotReady` until both steps are done.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

use crate::boot::BootEnvironment;
use crate::config::KernelConfig;
use crate::error::{KernError, KernResult};
use crate::hal::Platform;
use crate::ipc::signal::Signal;
use crate::ipc::Ipc;
use crate::kern::kheap::Heap;
use crate::kern::lock::{GateCell, Holder};
use crate::kern::lock_pool::LockPool;
use crate::kern::priority::Priority;
use crate::kern::process::{Process, ProcessRights, ProcessTable};
use crate::kern::sched::Scheduler;
use crate::kern::thread::{Registers, Thread, ThreadState};
use crate::panic::{fatal, FatalReason};
use crate::types::{CpuId, Layer, PhysAddr, ProcessId, Role, ThreadId, VirtAddr};
use crate::vm::{AccessFlags, FaultDecision, Vma, VmManager, VmaFlags, VmaInfo};

// ============================================================================
// Boot State
// ============================================================================

/// Kernel initialization phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum InitPhase {
    /// Nothing set up
    Uninitialized = 0,
    /// Lock pool and heap up
    BootstrapReady = 1,
    /// Every service up
    FullyOperational = 2,
}

impl InitPhase {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::BootstrapReady,
            2 => Self::FullyOperational,
            _ => Self::Uninitialized,
        }
    }
}

/// A registered IRQ handler thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqDriver {
    pub pid: ProcessId,
    pub tid: ThreadId,
}

// ============================================================================
// Kernel
// ============================================================================

/// The portable kernel core
pub struct Kernel {
    config: KernelConfig,
    platform: Platform,
    phase: AtomicU32,
    lock_pool: LockPool,
    heap: Once<Arc<Heap>>,
    vm: Once<VmManager>,
    sched: Once<Scheduler>,
    procs: Once<ProcessTable>,
    ipc: Once<Ipc>,
    irqs: GateCell<BTreeMap<u32, IrqDriver>>,
}

impl Kernel {
    pub fn new(config: KernelConfig, platform: Platform) -> KernResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            platform,
            phase: AtomicU32::new(InitPhase::Uninitialized as u32),
            lock_pool: LockPool::new(),
            heap: Once::new(),
            vm: Once::new(),
            sched: Once::new(),
            procs: Once::new(),
            ipc: Once::new(),
            irqs: GateCell::new(BTreeMap::new()),
        })
    }

    pub fn phase(&self) -> InitPhase {
        InitPhase::from_u32(self.phase.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Bring up the lock pool and the heap
    ///
    /// A boot environment that fails validation halts the kernel.
    pub fn bootstrap(&self, env: &BootEnvironment, cpu: CpuId) -> KernResult<()> {
        if self.phase() != InitPhase::Uninitialized {
            return Err(KernError::InvalidState);
        }
        if let Err(err) = env.validate() {
            log::error!("boot: environment rejected: {}", err);
            fatal(FatalReason::BootSanity);
        }

        let holder = Holder::Cpu(cpu);
        let phys = self.platform.phys.as_ref();
        self.lock_pool.bootstrap(phys, holder)?;
        let gate = self.lock_pool.alloc_gate(phys, holder)?;
        let heap = Heap::new(
            env.heap_window,
            self.config.heap_min_block,
            self.config.heap_initial,
            gate,
            holder,
        )?;
        self.heap.call_once(|| Arc::new(heap));

        self.phase
            .store(InitPhase::BootstrapReady as u32, Ordering::Release);
        log::info!(
            "boot: bootstrap ready on {}, {} usable bytes",
            cpu,
            env.usable_bytes()
        );
        Ok(())
    }

    /// Bring up the VMA layer, scheduler, process table and IPC
    pub fn init(&self, cpu: CpuId) -> KernResult<()> {
        match self.phase() {
            InitPhase::Uninitialized => return Err(KernError::NotReady),
            InitPhase::FullyOperational => return Err(KernError::InvalidState),
            InitPhase::BootstrapReady => {}
        }
        let heap = self.heap.get().ok_or(KernError::NotReady)?.clone();

        self.vm.call_once(|| {
            VmManager::new(
                heap,
                self.platform.phys.clone(),
                self.platform.page_tables.clone(),
                self.config.mapping_pool_initial,
            )
        });
        self.sched
            .call_once(|| Scheduler::new(&self.config, self.platform.ipi.clone()));
        self.procs.call_once(ProcessTable::new);
        self.ipc.call_once(Ipc::new);

        self.phase
            .store(InitPhase::FullyOperational as u32, Ordering::Release);
        log::info!("boot: fully operational on {} ({} cpus)", cpu, self.config.cpus);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Service accessors
    // ------------------------------------------------------------------------

    fn ready<'a, T>(&self, cell: &'a Once<T>) -> KernResult<&'a T> {
        if self.phase() != InitPhase::FullyOperational {
            return Err(KernError::NotReady);
        }
        cell.get().ok_or(KernError::NotReady)
    }

    pub fn lock_pool(&self) -> &LockPool {
        &self.lock_pool
    }

    pub fn heap(&self) -> KernResult<&Arc<Heap>> {
        self.ready(&self.heap)
    }

    pub fn vm(&self) -> KernResult<&VmManager> {
        self.ready(&self.vm)
    }

    pub fn scheduler(&self) -> KernResult<&Scheduler> {
        self.ready(&self.sched)
    }

    pub fn processes(&self) -> KernResult<&ProcessTable> {
        self.ready(&self.procs)
    }

    pub(crate) fn ipc(&self) -> KernResult<&Ipc> {
        self.ready(&self.ipc)
    }

    /// Lock identity of code running on `cpu`
    pub fn holder(&self, cpu: CpuId) -> Holder {
        match self.sched.get() {
            Some(sched) => sched.holder(cpu),
            None => Holder::Cpu(cpu),
        }
    }

    pub fn process(&self, holder: Holder, pid: ProcessId) -> KernResult<Arc<Process>> {
        self.processes()?.get(holder, pid)
    }

    /// Refuse with `OutOfMemory` a creation the heap could not finish
    fn admit(&self, holder: Holder, bytes: usize) -> KernResult<()> {
        self.heap()?
            .ensure_room(holder, bytes + self.config.heap_reserve)
    }

    fn add_thread_to(&self, holder: Holder, process: &Process, tid: ThreadId) -> KernResult<()> {
        let mut inner = process.inner.write(holder)?;
        inner
            .threads
            .try_reserve(1)
            .map_err(|_| KernError::OutOfMemory)?;
        inner.threads.push(tid);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Processes and threads
    // ------------------------------------------------------------------------

    pub fn process_new(
        &self,
        holder: Holder,
        parent: Option<ProcessId>,
        role: Option<Role>,
        layer: Layer,
        rights: ProcessRights,
    ) -> KernResult<ProcessId> {
        self.admit(holder, size_of::<Process>())?;
        Ok(self
            .processes()?
            .create(holder, parent, role, layer, rights)?
            .pid())
    }

    /// Create a ready thread in `pid`
    pub fn thread_new(
        &self,
        holder: Holder,
        pid: ProcessId,
        cpu: Option<CpuId>,
        priority: Option<Priority>,
        regs: Registers,
        stack_base: VirtAddr,
    ) -> KernResult<ThreadId> {
        let process = self.process(holder, pid)?;
        self.admit(holder, size_of::<Thread>())?;
        let sched = self.scheduler()?;
        let tid = sched.thread_new(holder, pid, cpu, priority, regs, stack_base)?;
        if let Err(err) = self.add_thread_to(holder, &process, tid) {
            sched.exit(holder, tid)?;
            sched.reap(holder, tid)?;
            return Err(err);
        }
        Ok(tid)
    }

    /// Fork the process owning `thread`
    ///
    /// The child gets a copy of every private VMA (copy-on-write), a new
    /// mapping of every shared VMA, and one thread resuming from `thread`'s
    /// registers with a zero first argument register. Returns the child pid
    /// and thread.
    pub fn fork(&self, holder: Holder, thread: ThreadId) -> KernResult<(ProcessId, ThreadId)> {
        let sched = self.scheduler()?;
        let vm = self.vm()?;
        let info = sched.thread(holder, thread)?;
        let parent = self.process(holder, info.pid)?;
        self.admit(holder, size_of::<Process>() + size_of::<Thread>())?;

        let child = self.processes()?.create(
            holder,
            Some(parent.pid()),
            None,
            parent.layer(),
            parent.rights() - ProcessRights::ASSIGN_ROLE,
        )?;

        let duplicated = {
            let source = parent.inner.read(holder)?;
            let mut target = child.inner.write(holder)?;
            vm.duplicate_vmas(&mut target.space, &source.space, holder)
        };
        if let Err(err) = duplicated {
            vm.unlink_all(&mut child.inner.write(holder)?.space, holder)?;
            self.processes()?.remove(holder, child.pid())?;
            return Err(err);
        }

        let mut regs = sched.registers(holder, thread)?;
        regs.args[0] = 0;
        let tid = sched.thread_new(
            holder,
            child.pid(),
            Some(info.cpu),
            Some(info.priority),
            regs,
            info.stack_base,
        )?;
        self.add_thread_to(holder, &child, tid)?;

        log::debug!("proc: {} forked {} ({})", parent.pid(), child.pid(), tid);
        Ok((child.pid(), tid))
    }

    /// Terminate a thread and tell the executive
    ///
    /// Unknown and dead threads are ignored.
    pub fn thread_exit(&self, holder: Holder, thread: ThreadId) -> KernResult<()> {
        let sched = self.scheduler()?;
        match sched.thread(holder, thread) {
            Ok(info) if info.state != ThreadState::Dead => {}
            _ => return Ok(()),
        }
        sched.exit(holder, thread)?;
        self.ipc_forget(holder, thread)?;
        self.notify_executive(holder, Signal::thread_death(thread));
        Ok(())
    }

    /// Reap a dead thread
    ///
    /// Reaping the last thread of a process tears the process down: every
    /// VMA is unlinked, its IRQ lines are released, it leaves the process
    /// table and the executive is told. Returns true in that case.
    pub fn reap(&self, holder: Holder, thread: ThreadId) -> KernResult<bool> {
        let reaped = self.scheduler()?.reap(holder, thread)?;
        self.irqs.write(holder)?.retain(|_, d| d.tid != thread);

        let Ok(process) = self.process(holder, reaped.pid) else {
            return Ok(false);
        };
        let last = {
            let mut inner = process.inner.write(holder)?;
            inner.threads.retain(|&t| t != thread);
            inner.irqs.retain(|irq| !reaped.irq_lines.contains(irq));
            if inner.threads.is_empty() {
                self.vm()?.unlink_all(&mut inner.space, holder)?;
                true
            } else {
                false
            }
        };
        if !last {
            return Ok(false);
        }

        let pid = process.pid();
        self.irqs.write(holder)?.retain(|_, d| d.pid != pid);
        self.processes()?.remove(holder, pid)?;
        log::debug!("proc: {} torn down", pid);
        self.notify_executive(holder, Signal::process_exit(pid));
        Ok(true)
    }

    fn notify_executive(&self, holder: Holder, signal: Signal) {
        let executive = match self.processes().and_then(|t| t.by_role(holder, Role::Executive)) {
            Ok(Some(pid)) => pid,
            _ => {
                log::warn!("no executive for signal {}", signal.signum);
                return;
            }
        };
        if let Err(err) = self.deliver_signal(holder, executive, signal) {
            log::warn!("signal {} to executive {} lost: {}", signal.signum, executive, err);
        }
    }

    // ------------------------------------------------------------------------
    // IRQ drivers
    // ------------------------------------------------------------------------

    /// Route `irq` to `thread`'s process as `SIG_IRQ` signals
    pub fn register_irq_driver(&self, holder: Holder, thread: ThreadId, irq: u32) -> KernResult<()> {
        let sched = self.scheduler()?;
        let info = sched.thread(holder, thread)?;
        let process = self.process(holder, info.pid)?;
        process.require(ProcessRights::IRQ)?;

        {
            let mut irqs = self.irqs.write(holder)?;
            match irqs.get(&irq) {
                Some(d) if d.tid != thread => return Err(KernError::AlreadyExists),
                Some(_) => return Ok(()),
                None => {}
            }
            irqs.insert(irq, IrqDriver { pid: info.pid, tid: thread });
        }
        sched.add_irq_line(holder, thread, irq)?;
        process.inner.write(holder)?.irqs.push(irq);
        log::debug!("irq {} -> {} ({})", irq, info.pid, thread);
        Ok(())
    }

    /// Forward a hardware interrupt to its driver
    pub fn deliver_irq(&self, holder: Holder, irq: u32) -> KernResult<()> {
        let driver = self
            .irqs
            .read(holder)?
            .get(&irq)
            .copied()
            .ok_or(KernError::NoReceiver)?;
        self.deliver_signal(holder, driver.pid, Signal::irq(irq))
    }

    // ------------------------------------------------------------------------
    // Virtual memory
    // ------------------------------------------------------------------------

    pub fn vma_add(
        &self,
        holder: Holder,
        pid: ProcessId,
        base: VirtAddr,
        size: usize,
        flags: VmaFlags,
        cookie: u64,
    ) -> KernResult<VmaInfo> {
        let process = self.process(holder, pid)?;
        self.admit(holder, size_of::<Vma>())?;
        let mut inner = process.inner.write(holder)?;
        self.vm()?
            .add_vma(&mut inner.space, holder, base, size, flags, cookie)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn vma_add_phys(
        &self,
        holder: Holder,
        pid: ProcessId,
        base: VirtAddr,
        size: usize,
        flags: VmaFlags,
        cookie: u64,
        phys: PhysAddr,
    ) -> KernResult<VmaInfo> {
        let process = self.process(holder, pid)?;
        process.require(ProcessRights::MAP_PHYS)?;
        self.admit(holder, size_of::<Vma>())?;
        let mut inner = process.inner.write(holder)?;
        self.vm()?
            .add_phys_vma(&mut inner.space, holder, base, size, flags, cookie, phys)
    }

    pub fn vma_find(
        &self,
        holder: Holder,
        pid: ProcessId,
        addr: VirtAddr,
        size: usize,
    ) -> KernResult<Option<VmaInfo>> {
        let process = self.process(holder, pid)?;
        let inner = process.inner.read(holder)?;
        self.vm()?.find_vma(&inner.space, holder, addr, size)
    }

    pub fn vma_resize(
        &self,
        holder: Holder,
        pid: ProcessId,
        base: VirtAddr,
        delta: isize,
    ) -> KernResult<usize> {
        let process = self.process(holder, pid)?;
        let inner = process.inner.read(holder)?;
        self.vm()?.resize_vma(&inner.space, holder, base, delta)
    }

    pub fn vma_unlink(&self, holder: Holder, pid: ProcessId, base: VirtAddr) -> KernResult<bool> {
        let process = self.process(holder, pid)?;
        let mut inner = process.inner.write(holder)?;
        self.vm()?.unlink_vma(&mut inner.space, holder, base)
    }

    /// Resolve a page fault taken by `pid`
    pub fn handle_fault(
        &self,
        holder: Holder,
        pid: ProcessId,
        addr: VirtAddr,
        access: AccessFlags,
    ) -> KernResult<FaultDecision> {
        let process = self.process(holder, pid)?;
        let inner = process.inner.read(holder)?;
        self.vm()?.fault(&inner.space, holder, addr, access)
    }

    pub fn copy_in(&self, holder: Holder, pid: ProcessId, src: VirtAddr, dst: &mut [u8]) -> KernResult<()> {
        let process = self.process(holder, pid)?;
        let inner = process.inner.read(holder)?;
        self.vm()?.copy_in(&inner.space, holder, src, dst)
    }

    pub fn copy_out(&self, holder: Holder, pid: ProcessId, dst: VirtAddr, src: &[u8]) -> KernResult<()> {
        let process = self.process(holder, pid)?;
        let inner = process.inner.read(holder)?;
        self.vm()?.copy_out(&inner.space, holder, dst, src)
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("phase", &self.phase())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::hal::hosted::HostedPlatform;
    use crate::types::PAGE_SIZE;

    pub const BOOT: CpuId = CpuId(0);
    pub const H: Holder = Holder::Cpu(BOOT);

    /// A booted kernel on hosted services; `hosted` must outlive `kernel`
    pub struct Booted {
        pub kernel: Kernel,
        pub hosted: HostedPlatform,
    }

    pub fn boot(config: KernelConfig) -> Booted {
        let hosted = HostedPlatform::new(64 * PAGE_SIZE).unwrap();
        let kernel = Kernel::new(config, hosted.platform()).unwrap();
        kernel.bootstrap(&hosted.boot_environment(), BOOT).unwrap();
        kernel.init(BOOT).unwrap();
        Booted { kernel, hosted }
    }
}
