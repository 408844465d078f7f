//! Locking Primitives
//!
//! Based on Mach4 kern/lock.h/c by Avadis Tevanian, Jr. and Michael Wayne Young
//!
//! Provides:
//! - [`SimpleLock`], the raw exclusive spin lock
//! - [`Gate`], the reentrant readers-writer lock used by every kernel
//!   structure, with typed owner tracking and writer-starvation avoidance
//! - [`GateCell`], data guarded by a gate with RAII read/write guards
//!
//! ## Holder identity
//!
//! Before the scheduler runs a thread on a CPU, the CPU itself is the holder
//! ([`Holder::Cpu`]); afterwards it is the running thread. The same gate can
//! therefore protect boot-time and run-time structures.
//!
//! ## Concurrent readers
//!
//! A gate has one recorded owner. Other holders may join as concurrent
//! readers while no writer holds or waits. Readers are tracked individually
//! so they can reenter, but only the recorded owner may upgrade to WRITE.
//! When the owner leaves, the oldest remaining reader becomes the owner.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

use crate::error::GateError;
use crate::types::{CpuId, ThreadId};

// ============================================================================
// Simple Lock (Spin Lock)
// ============================================================================

/// A simple spin lock
///
/// The raw exclusive primitive underneath every gate. Critical sections
/// under it never block and never allocate.
#[repr(C)]
pub struct SimpleLock {
    lock_data: AtomicBool,
}

impl core::fmt::Debug for SimpleLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimpleLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl SimpleLock {
    /// Create a new unlocked simple lock
    pub const fn new() -> Self {
        Self {
            lock_data: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until available
    pub fn lock(&self) {
        while self
            .lock_data
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock_data.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Release the lock
    pub fn unlock(&self) {
        self.lock_data.store(false, Ordering::Release);
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> bool {
        self.lock_data
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.lock_data.load(Ordering::Relaxed)
    }
}

impl Default for SimpleLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Gate Types
// ============================================================================

/// Identity of whoever holds a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    /// A CPU with no thread running on it yet
    Cpu(CpuId),
    /// A running thread
    Thread(ThreadId),
}

bitflags! {
    /// Gate mode flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GateFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Set once, never cleared; all later acquires fail
        const SELFDESTRUCT = 1 << 2;
        /// A writer is spinning; new non-owner readers are refused
        const WRITE_WAITING = 1 << 3;
    }
}

/// Requested access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Read,
    Write,
}

impl GateMode {
    fn flag(self) -> GateFlags {
        match self {
            GateMode::Read => GateFlags::READ,
            GateMode::Write => GateFlags::WRITE,
        }
    }
}

/// Most concurrent non-owner readers a gate tracks
pub const MAX_SHARED_READERS: usize = 8;

/// Spins before the deadlock detector fires
#[cfg(feature = "gate-deadline")]
pub const GATE_DEADLINE_SPINS: u64 = 1 << 28;

#[derive(Debug, Clone, Copy)]
struct SharedReader {
    holder: Holder,
    depth: u32,
}

#[derive(Debug)]
struct GateState {
    owner: Option<Holder>,
    flags: GateFlags,
    /// Reentrancy depth of `owner`; non-zero iff `owner` is set
    refcount: u32,
    write_waiters: u32,
    readers: heapless::Vec<SharedReader, MAX_SHARED_READERS>,
}

impl GateState {
    const fn new() -> Self {
        Self {
            owner: None,
            flags: GateFlags::empty(),
            refcount: 0,
            write_waiters: 0,
            readers: heapless::Vec::new(),
        }
    }

    fn attempt(&mut self, holder: Holder, mode: GateMode) -> Result<(), GateError> {
        if self.flags.contains(GateFlags::SELFDESTRUCT) {
            return Err(GateError::Destroyed);
        }

        match self.owner {
            None => {
                // An idle gate with writers queued goes to a writer
                if mode == GateMode::Read && self.write_waiters > 0 {
                    return Err(GateError::Contended);
                }
                self.owner = Some(holder);
                self.refcount = 1;
                self.flags.remove(GateFlags::READ | GateFlags::WRITE);
                self.flags.insert(mode.flag());
                Ok(())
            }
            Some(owner) if owner == holder => {
                if mode == GateMode::Write && !self.flags.contains(GateFlags::WRITE) {
                    if !self.readers.is_empty() {
                        return Err(GateError::Contended);
                    }
                }
                self.flags.insert(mode.flag());
                self.refcount += 1;
                Ok(())
            }
            Some(_) => {
                if let Some(reader) = self.readers.iter_mut().find(|r| r.holder == holder) {
                    return match mode {
                        GateMode::Read => {
                            reader.depth += 1;
                            Ok(())
                        }
                        GateMode::Write => Err(GateError::UpgradeDenied),
                    };
                }
                if mode == GateMode::Write
                    || self.flags.contains(GateFlags::WRITE)
                    || self.write_waiters > 0
                {
                    return Err(GateError::Contended);
                }
                self.readers
                    .push(SharedReader { holder, depth: 1 })
                    .map_err(|_| GateError::Contended)
            }
        }
    }

    fn add_waiter(&mut self) {
        self.write_waiters += 1;
        self.flags.insert(GateFlags::WRITE_WAITING);
    }

    fn remove_waiter(&mut self) {
        self.write_waiters = self.write_waiters.saturating_sub(1);
        if self.write_waiters == 0 {
            self.flags.remove(GateFlags::WRITE_WAITING);
        }
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Reentrant readers-writer gate
pub struct Gate {
    spin: SimpleLock,
    state: UnsafeCell<GateState>,
}

// State is only touched under `spin`
unsafe impl Send for Gate {}
unsafe impl Sync for Gate {}

impl core::fmt::Debug for Gate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.locked(|st| {
            f.debug_struct("Gate")
                .field("owner", &st.owner)
                .field("flags", &st.flags)
                .field("refcount", &st.refcount)
                .field("readers", &st.readers.len())
                .finish()
        })
    }
}

impl Gate {
    /// Create an unowned gate. Usable before any allocator exists.
    pub const fn new() -> Self {
        Self {
            spin: SimpleLock::new(),
            state: UnsafeCell::new(GateState::new()),
        }
    }

    fn locked<R>(&self, f: impl FnOnce(&mut GateState) -> R) -> R {
        self.spin.lock();
        // SAFETY: `spin` serializes every access to the state
        let result = f(unsafe { &mut *self.state.get() });
        self.spin.unlock();
        result
    }

    /// Acquire the gate, spinning while another holder has it
    ///
    /// Fails only when the gate has self-destructed or when a concurrent
    /// reader asks for WRITE.
    pub fn acquire(&self, holder: Holder, mode: GateMode) -> Result<(), GateError> {
        let mut registered = false;
        #[cfg(feature = "gate-deadline")]
        let mut spins: u64 = 0;

        loop {
            let outcome = self.locked(|st| {
                let result = st.attempt(holder, mode);
                if result == Err(GateError::Contended) {
                    if mode == GateMode::Write && !registered {
                        st.add_waiter();
                        registered = true;
                    }
                } else if registered {
                    st.remove_waiter();
                    registered = false;
                }
                result
            });

            match outcome {
                Err(GateError::Contended) => {
                    #[cfg(feature = "gate-deadline")]
                    {
                        spins += 1;
                        if spins > GATE_DEADLINE_SPINS {
                            crate::panic::fatal(crate::panic::FatalReason::GateDeadline {
                                waiter: holder,
                                owner: self.owner(),
                            });
                        }
                    }
                    core::hint::spin_loop();
                }
                other => return other,
            }
        }
    }

    /// Single acquisition attempt; never registers as a waiting writer
    pub fn try_acquire(&self, holder: Holder, mode: GateMode) -> Result<(), GateError> {
        self.locked(|st| st.attempt(holder, mode))
    }

    /// Release one level of acquisition
    ///
    /// A holder that is neither the owner nor a reader is ignored.
    pub fn release(&self, holder: Holder, mode: GateMode) {
        let known = self.locked(|st| {
            if st.owner == Some(holder) {
                st.refcount -= 1;
                if st.refcount == 0 {
                    st.owner = None;
                    st.flags &= GateFlags::SELFDESTRUCT | GateFlags::WRITE_WAITING;
                    if !st.readers.is_empty() {
                        let next = st.readers.swap_remove(0);
                        st.owner = Some(next.holder);
                        st.refcount = next.depth;
                        st.flags.insert(GateFlags::READ);
                    }
                }
                true
            } else if let Some(idx) = st.readers.iter().position(|r| r.holder == holder) {
                st.readers[idx].depth -= 1;
                if st.readers[idx].depth == 0 {
                    st.readers.swap_remove(idx);
                }
                true
            } else {
                false
            }
        });

        if !known {
            log::warn!("gate release ({:?}) by non-holder {:?} ignored", mode, holder);
        }
    }

    /// Mark the gate self-destructed; acquires fail from now on
    pub fn destroy(&self) {
        self.locked(|st| st.flags.insert(GateFlags::SELFDESTRUCT));
    }

    /// Hand ownership from `from` to `to` without releasing
    ///
    /// Used when a context switch is forced while `from` is on the CPU.
    pub fn transfer(&self, from: Holder, to: Holder) -> bool {
        self.locked(|st| {
            if st.owner == Some(from) {
                st.owner = Some(to);
                true
            } else if let Some(reader) = st.readers.iter_mut().find(|r| r.holder == from) {
                reader.holder = to;
                true
            } else {
                false
            }
        })
    }

    pub fn owner(&self) -> Option<Holder> {
        self.locked(|st| st.owner)
    }

    pub fn refcount(&self) -> u32 {
        self.locked(|st| st.refcount)
    }

    pub fn flags(&self) -> GateFlags {
        self.locked(|st| st.flags)
    }

    /// Concurrent readers other than the owner
    pub fn reader_count(&self) -> usize {
        self.locked(|st| st.readers.len())
    }

    /// Nobody owns or reads the gate
    pub fn is_idle(&self) -> bool {
        self.locked(|st| st.owner.is_none() && st.readers.is_empty())
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags().contains(GateFlags::SELFDESTRUCT)
    }

    /// Owner or concurrent reader
    pub fn is_held_by(&self, holder: Holder) -> bool {
        self.locked(|st| {
            st.owner == Some(holder) || st.readers.iter().any(|r| r.holder == holder)
        })
    }

    fn owns_for_write(&self, holder: Holder) -> bool {
        self.locked(|st| st.owner == Some(holder) && st.flags.contains(GateFlags::WRITE))
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Gate-guarded data
// ============================================================================

/// Anything that can lend out a gate: an embedded [`Gate`] or a pooled one
pub trait AsGate {
    fn gate(&self) -> &Gate;
}

impl AsGate for Gate {
    fn gate(&self) -> &Gate {
        self
    }
}

/// Data serialized by a gate
///
/// Guards acquire on creation and release on drop. A holder asking for a
/// guard it could alias (write while already inside, read while writing)
/// gets [`GateError::Reentrant`] instead of a deadlock or an aliased `&mut`.
pub struct GateCell<T, G: AsGate = Gate> {
    gate: G,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send, G: AsGate + Send> Send for GateCell<T, G> {}
unsafe impl<T: Send + Sync, G: AsGate + Sync> Sync for GateCell<T, G> {}

impl<T> GateCell<T, Gate> {
    /// Guard `value` with an embedded gate
    pub const fn new(value: T) -> Self {
        Self {
            gate: Gate::new(),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T, G: AsGate> GateCell<T, G> {
    /// Guard `value` with an externally supplied gate
    pub fn with_gate(gate: G, value: T) -> Self {
        Self {
            gate,
            data: UnsafeCell::new(value),
        }
    }

    pub fn gate(&self) -> &Gate {
        self.gate.gate()
    }

    /// Shared access
    pub fn read(&self, holder: Holder) -> Result<GateReadGuard<'_, T, G>, GateError> {
        if self.gate().owns_for_write(holder) {
            return Err(GateError::Reentrant);
        }
        self.gate().acquire(holder, GateMode::Read)?;
        Ok(GateReadGuard { cell: self, holder })
    }

    /// Exclusive access
    pub fn write(&self, holder: Holder) -> Result<GateWriteGuard<'_, T, G>, GateError> {
        if self.gate().is_held_by(holder) {
            return Err(GateError::Reentrant);
        }
        self.gate().acquire(holder, GateMode::Write)?;
        Ok(GateWriteGuard { cell: self, holder })
    }

    pub fn try_read(&self, holder: Holder) -> Result<GateReadGuard<'_, T, G>, GateError> {
        if self.gate().owns_for_write(holder) {
            return Err(GateError::Reentrant);
        }
        self.gate().try_acquire(holder, GateMode::Read)?;
        Ok(GateReadGuard { cell: self, holder })
    }

    pub fn try_write(&self, holder: Holder) -> Result<GateWriteGuard<'_, T, G>, GateError> {
        if self.gate().is_held_by(holder) {
            return Err(GateError::Reentrant);
        }
        self.gate().try_acquire(holder, GateMode::Write)?;
        Ok(GateWriteGuard { cell: self, holder })
    }

    /// Exclusive access through a unique borrow; no locking needed
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_parts(self) -> (G, T) {
        (self.gate, self.data.into_inner())
    }
}

/// RAII guard for shared access
pub struct GateReadGuard<'a, T, G: AsGate = Gate> {
    cell: &'a GateCell<T, G>,
    holder: Holder,
}

impl<T, G: AsGate> GateReadGuard<'_, T, G> {
    pub fn holder(&self) -> Holder {
        self.holder
    }
}

impl<T, G: AsGate> Deref for GateReadGuard<'_, T, G> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the gate is held for READ; no writer exists
        unsafe { &*self.cell.data.get() }
    }
}

impl<T, G: AsGate> Drop for GateReadGuard<'_, T, G> {
    fn drop(&mut self) {
        self.cell.gate().release(self.holder, GateMode::Read);
    }
}

/// RAII guard for exclusive access
pub struct GateWriteGuard<'a, T, G: AsGate = Gate> {
    cell: &'a GateCell<T, G>,
    holder: Holder,
}

impl<T, G: AsGate> GateWriteGuard<'_, T, G> {
    pub fn holder(&self) -> Holder {
        self.holder
    }
}

impl<T, G: AsGate> Deref for GateWriteGuard<'_, T, G> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the gate is held for WRITE by this guard only
        unsafe { &*self.cell.data.get() }
    }
}

impl<T, G: AsGate> DerefMut for GateWriteGuard<'_, T, G> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above
        unsafe { &mut *self.cell.data.get() }
    }
}

impl<T, G: AsGate> Drop for GateWriteGuard<'_, T, G> {
    fn drop(&mut self) {
        self.cell.gate().release(self.holder, GateMode::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    const A: Holder = Holder::Thread(ThreadId(1));
    const B: Holder = Holder::Thread(ThreadId(2));
    const C: Holder = Holder::Thread(ThreadId(3));

    #[test]
    fn test_simple_lock() {
        let lock = SimpleLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_claim_and_release() {
        let gate = Gate::new();
        gate.acquire(A, GateMode::Write).unwrap();
        assert_eq!(gate.owner(), Some(A));
        assert_eq!(gate.refcount(), 1);
        assert!(gate.flags().contains(GateFlags::WRITE));

        gate.release(A, GateMode::Write);
        assert_eq!(gate.owner(), None);
        assert_eq!(gate.refcount(), 0);
        assert!(gate.flags().is_empty());
    }

    #[test]
    fn test_reentrant_refcount() {
        let gate = Gate::new();
        gate.acquire(A, GateMode::Read).unwrap();
        gate.acquire(A, GateMode::Write).unwrap();
        gate.acquire(A, GateMode::Read).unwrap();
        assert_eq!(gate.refcount(), 3);

        gate.release(A, GateMode::Read);
        gate.release(A, GateMode::Write);
        assert_eq!(gate.try_acquire(B, GateMode::Write), Err(GateError::Contended));

        gate.release(A, GateMode::Read);
        assert!(gate.try_acquire(B, GateMode::Write).is_ok());
    }

    #[test]
    fn test_release_by_stranger_is_noop() {
        let gate = Gate::new();
        gate.acquire(A, GateMode::Write).unwrap();
        gate.release(B, GateMode::Write);
        assert_eq!(gate.owner(), Some(A));
        assert_eq!(gate.refcount(), 1);
    }

    #[test]
    fn test_selfdestruct_sticks() {
        let gate = Gate::new();
        gate.acquire(A, GateMode::Read).unwrap();
        gate.destroy();
        assert_eq!(gate.acquire(A, GateMode::Read), Err(GateError::Destroyed));
        assert_eq!(gate.acquire(B, GateMode::Write), Err(GateError::Destroyed));

        gate.release(A, GateMode::Read);
        assert_eq!(gate.flags(), GateFlags::SELFDESTRUCT);
        assert_eq!(gate.try_acquire(A, GateMode::Read), Err(GateError::Destroyed));
    }

    #[test]
    fn test_concurrent_readers() {
        let gate = Gate::new();
        gate.acquire(A, GateMode::Read).unwrap();
        gate.acquire(B, GateMode::Read).unwrap();
        gate.acquire(B, GateMode::Read).unwrap();
        assert_eq!(gate.reader_count(), 1);
        assert_eq!(gate.owner(), Some(A));

        // Readers may not upgrade, and the owner may not while they read
        assert_eq!(gate.try_acquire(B, GateMode::Write), Err(GateError::UpgradeDenied));
        assert_eq!(gate.try_acquire(A, GateMode::Write), Err(GateError::Contended));

        // Owner leaves; B inherits ownership with its depth
        gate.release(A, GateMode::Read);
        assert_eq!(gate.owner(), Some(B));
        assert_eq!(gate.refcount(), 2);
        gate.release(B, GateMode::Read);
        gate.release(B, GateMode::Read);
        assert!(gate.is_idle());
    }

    #[test]
    fn test_no_read_while_written() {
        let gate = Gate::new();
        gate.acquire(A, GateMode::Write).unwrap();
        assert_eq!(gate.try_acquire(B, GateMode::Read), Err(GateError::Contended));
        gate.release(A, GateMode::Write);
        assert!(gate.try_acquire(B, GateMode::Read).is_ok());
    }

    #[test]
    fn test_transfer() {
        let gate = Gate::new();
        let boot = Holder::Cpu(CpuId(0));
        gate.acquire(boot, GateMode::Write).unwrap();
        assert!(gate.transfer(boot, A));
        assert_eq!(gate.owner(), Some(A));
        assert!(!gate.transfer(boot, B));
        gate.release(A, GateMode::Write);
        assert!(gate.is_idle());
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let gate = Gate::new();
        let acquired = AtomicBool::new(false);
        gate.acquire(A, GateMode::Read).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                gate.acquire(B, GateMode::Write).unwrap();
                acquired.store(true, Ordering::SeqCst);
                gate.release(B, GateMode::Write);
            });

            while !gate.flags().contains(GateFlags::WRITE_WAITING) {
                thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(gate.try_acquire(C, GateMode::Read), Err(GateError::Contended));
            // The owner itself may still reenter
            gate.acquire(A, GateMode::Read).unwrap();
            gate.release(A, GateMode::Read);
            assert!(!acquired.load(Ordering::SeqCst));

            gate.release(A, GateMode::Read);
        });

        assert!(acquired.load(Ordering::SeqCst));
        assert!(!gate.flags().contains(GateFlags::WRITE_WAITING));
        assert!(gate.is_idle());
    }

    #[test]
    fn test_cell_guards() {
        let cell = GateCell::new(5u32);
        {
            let mut w = cell.write(A).unwrap();
            *w += 1;
            assert!(matches!(cell.write(A), Err(GateError::Reentrant)));
            assert!(matches!(cell.read(A), Err(GateError::Reentrant)));
            assert!(matches!(cell.try_read(B), Err(GateError::Contended)));
        }
        let r1 = cell.read(A).unwrap();
        let r2 = cell.read(B).unwrap();
        assert_eq!(*r1 + *r2, 12);
        drop(r1);
        drop(r2);
        assert!(cell.gate().is_idle());
    }

    #[test]
    fn test_cell_mutual_exclusion_threads() {
        let cell = GateCell::new(0usize);
        let readers_inside = AtomicUsize::new(0);

        thread::scope(|s| {
            for t in 0..4u64 {
                let cell = &cell;
                let readers_inside = &readers_inside;
                s.spawn(move || {
                    let me = Holder::Thread(ThreadId(10 + t));
                    for i in 0..200 {
                        if (i + t) % 3 == 0 {
                            let mut w = cell.write(me).unwrap();
                            assert_eq!(readers_inside.load(Ordering::SeqCst), 0);
                            *w += 1;
                        } else {
                            let r = cell.read(me).unwrap();
                            readers_inside.fetch_add(1, Ordering::SeqCst);
                            let _ = *r;
                            readers_inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        let total = *cell.read(A).unwrap();
        let expected: usize = (0..4u64)
            .map(|t| (0..200u64).filter(|i| (i + t) % 3 == 0).count())
            .sum();
        assert_eq!(total, expected);
    }
}
