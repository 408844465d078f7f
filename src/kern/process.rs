//! Processes
//!
//! Based on Mach4 kern/task.h/c
//!
//! A process owns an address space (its VMA tree), a list of threads, the
//! IRQ lines its drivers registered and a queue of pending signals. The
//! [`ProcessTable`] indexes processes by pid and by role.
//!
//! ## Lock order
//!
//! process table -> process -> VMA

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{KernError, KernResult};
use crate::ipc::signal::{Signal, SignalQueue};
use crate::kern::lock::{GateCell, Holder};
use crate::types::{Layer, PhysAddr, ProcessId, Role, ThreadId};
use crate::vm::AddressSpace;

bitflags! {
    /// Privileges granted to a process
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProcessRights: u32 {
        /// Create VMAs over fixed physical ranges
        const MAP_PHYS = 1 << 0;
        /// Register IRQ drivers
        const IRQ = 1 << 1;
        /// Signal processes other than itself and its children
        const SIGNAL_ANY = 1 << 2;
        /// Assign roles
        const ASSIGN_ROLE = 1 << 3;
    }
}

/// Gate-guarded part of a process
pub struct ProcessInner {
    pub space: AddressSpace,
    pub threads: Vec<ThreadId>,
    pub irqs: Vec<u32>,
    pub signals: SignalQueue,
    /// Top-level translation table, installed by the architecture layer
    pub page_directory: Option<PhysAddr>,
}

/// A process control block
pub struct Process {
    pid: ProcessId,
    parent: Option<ProcessId>,
    layer: Layer,
    rights: ProcessRights,
    pub(crate) inner: GateCell<ProcessInner>,
}

impl Process {
    pub fn new(pid: ProcessId, parent: Option<ProcessId>, layer: Layer, rights: ProcessRights) -> Self {
        Self {
            pid,
            parent,
            layer,
            rights,
            inner: GateCell::new(ProcessInner {
                space: AddressSpace::new(pid),
                threads: Vec::new(),
                irqs: Vec::new(),
                signals: SignalQueue::new(),
                page_directory: None,
            }),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn rights(&self) -> ProcessRights {
        self.rights
    }

    /// Fail with `BadAccess` unless the process holds `rights`
    pub fn require(&self, rights: ProcessRights) -> KernResult<()> {
        if self.rights.contains(rights) {
            Ok(())
        } else {
            Err(KernError::BadAccess)
        }
    }

    pub fn threads(&self, holder: Holder) -> KernResult<Vec<ThreadId>> {
        Ok(self.inner.read(holder)?.threads.clone())
    }

    pub fn thread_count(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.inner.read(holder)?.threads.len())
    }

    /// Queue a signal; `OutOfMemory` when the queue is full
    pub fn push_signal(&self, holder: Holder, signal: Signal) -> KernResult<()> {
        self.inner
            .write(holder)?
            .signals
            .push_back(signal)
            .map_err(|_| KernError::OutOfMemory)
    }

    pub fn take_signal(&self, holder: Holder) -> KernResult<Option<Signal>> {
        Ok(self.inner.write(holder)?.signals.pop_front())
    }

    pub fn pending_signals(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.inner.read(holder)?.signals.len())
    }

    pub fn set_page_directory(&self, holder: Holder, root: PhysAddr) -> KernResult<()> {
        self.inner.write(holder)?.page_directory = Some(root);
        Ok(())
    }

    pub fn page_directory(&self, holder: Holder) -> KernResult<Option<PhysAddr>> {
        Ok(self.inner.read(holder)?.page_directory)
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .field("layer", &self.layer)
            .field("rights", &self.rights)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Process Table
// ============================================================================

struct TableInner {
    procs: BTreeMap<ProcessId, Arc<Process>>,
    roles: BTreeMap<Role, ProcessId>,
    next_pid: u64,
}

/// All live processes
pub struct ProcessTable {
    inner: GateCell<TableInner>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            inner: GateCell::new(TableInner {
                procs: BTreeMap::new(),
                roles: BTreeMap::new(),
                next_pid: 1,
            }),
        }
    }

    /// Create a process, optionally holding `role`
    pub fn create(
        &self,
        holder: Holder,
        parent: Option<ProcessId>,
        role: Option<Role>,
        layer: Layer,
        rights: ProcessRights,
    ) -> KernResult<Arc<Process>> {
        let mut table = self.inner.write(holder)?;
        if let Some(parent) = parent {
            if !table.procs.contains_key(&parent) {
                return Err(KernError::NoSuchProcess);
            }
        }
        if let Some(role) = role {
            if table.roles.contains_key(&role) {
                return Err(KernError::AlreadyExists);
            }
        }

        let pid = ProcessId(table.next_pid);
        table.next_pid += 1;
        let process = Arc::new(Process::new(pid, parent, layer, rights));
        table.procs.insert(pid, process.clone());
        if let Some(role) = role {
            table.roles.insert(role, pid);
        }
        log::debug!("proc: created {} (parent {:?}, role {:?})", pid, parent, role);
        Ok(process)
    }

    pub fn get(&self, holder: Holder, pid: ProcessId) -> KernResult<Arc<Process>> {
        self.inner
            .read(holder)?
            .procs
            .get(&pid)
            .cloned()
            .ok_or(KernError::NoSuchProcess)
    }

    pub fn by_role(&self, holder: Holder, role: Role) -> KernResult<Option<ProcessId>> {
        Ok(self.inner.read(holder)?.roles.get(&role).copied())
    }

    pub fn role_of(&self, holder: Holder, pid: ProcessId) -> KernResult<Option<Role>> {
        let table = self.inner.read(holder)?;
        Ok(table.roles.iter().find(|(_, &p)| p == pid).map(|(&r, _)| r))
    }

    /// Give `role` to `pid`, taking it from any previous holder
    pub fn assign_role(&self, holder: Holder, pid: ProcessId, role: Role) -> KernResult<()> {
        let mut table = self.inner.write(holder)?;
        if !table.procs.contains_key(&pid) {
            return Err(KernError::NoSuchProcess);
        }
        table.roles.retain(|_, p| *p != pid);
        table.roles.insert(role, pid);
        Ok(())
    }

    /// Drop a process and every role it held
    pub fn remove(&self, holder: Holder, pid: ProcessId) -> KernResult<Option<Arc<Process>>> {
        let mut table = self.inner.write(holder)?;
        table.roles.retain(|_, p| *p != pid);
        Ok(table.procs.remove(&pid))
    }

    pub fn pids(&self, holder: Holder) -> KernResult<Vec<ProcessId>> {
        Ok(self.inner.read(holder)?.procs.keys().copied().collect())
    }

    pub fn len(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.inner.read(holder)?.procs.len())
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
