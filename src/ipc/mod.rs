//! Synchronous Message Passing
//!
//! Based on Mach4 ipc/mach_msg.c
//!
//! Rendezvous IPC between threads: a sender hands the kernel a payload in
//! its own address space, the kernel copies it into the buffer a receiver
//! declared, and the sender waits for the receiver's reply. Whichever side
//! arrives first waits in the IPC state for the other.
//!
//! Blocking calls return `Ok(None)` after parking the caller; the result is
//! collected with [`Kernel::take_completion`] once the scheduler runs the
//! thread again. Calls that finish at once return `Ok(Some(..))`.
//!
//! ## Lock order
//!
//! ipc -> process table -> process -> VMA, and ipc -> scheduler. Payloads
//! are copied out of the sender before the IPC gate is taken.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::error::{KernError, KernResult};
use crate::kern::lock::{GateCell, Holder};
use crate::kern::process::ProcessRights;
use crate::kern::startup::Kernel;
use crate::kern::thread::{BlockReason, ThreadState};
use crate::types::{ProcessId, Role, ThreadId, VirtAddr};
use crate::vm::AccessFlags;

pub mod message;
pub mod signal;

pub use message::{IpcCompletion, MessageInfo, RecvRequest, SendFlags, SendRequest, Target};
pub use signal::{Signal, SignalQueue};

use signal::SIG_USER;

// ============================================================================
// Waiting parties
// ============================================================================

/// A thread blocked in `recv`
#[derive(Debug, Clone, Copy)]
struct RecvWaiter {
    tid: ThreadId,
    pid: ProcessId,
    role: Option<Role>,
    filter: Target,
    buf: VirtAddr,
    max: usize,
}

/// A message no receiver has taken yet; the sender is blocked
#[derive(Debug, Clone)]
struct PendingSend {
    sender: ThreadId,
    sender_pid: ProcessId,
    sender_role: Option<Role>,
    target: Target,
    data: Vec<u8>,
    reply_buf: VirtAddr,
    reply_max: usize,
    needs_reply: bool,
}

/// A sender whose message was taken and who waits for `receiver` to reply
#[derive(Debug, Clone, Copy)]
struct ReplyWait {
    receiver: ThreadId,
    buf: VirtAddr,
    max: usize,
}

#[derive(Default)]
struct IpcState {
    receivers: VecDeque<RecvWaiter>,
    pending: VecDeque<PendingSend>,
    /// Keyed by the waiting sender
    replies: BTreeMap<ThreadId, ReplyWait>,
    completions: BTreeMap<ThreadId, IpcCompletion>,
}

impl IpcState {
    /// Does `tid` already have a message in flight
    fn is_busy(&self, tid: ThreadId) -> bool {
        self.replies.contains_key(&tid)
            || self.pending.iter().any(|p| p.sender == tid)
            || self.receivers.iter().any(|w| w.tid == tid)
    }
}

/// Rendezvous state shared by every CPU
pub struct Ipc {
    state: GateCell<IpcState>,
}

impl Ipc {
    pub fn new() -> Self {
        Self {
            state: GateCell::new(IpcState::default()),
        }
    }

    /// Threads blocked in `recv`
    pub fn waiting_receivers(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.state.read(holder)?.receivers.len())
    }

    /// Messages waiting for a receiver
    pub fn pending_messages(&self, holder: Holder) -> KernResult<usize> {
        Ok(self.state.read(holder)?.pending.len())
    }
}

impl Default for Ipc {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Ipc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ipc").finish_non_exhaustive()
    }
}

/// Zeroed bounce buffer for a payload; `OutOfMemory` instead of aborting
fn message_buffer(len: usize) -> KernResult<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| KernError::OutOfMemory)?;
    data.resize(len, 0);
    Ok(data)
}

// ============================================================================
// Kernel entry points
// ============================================================================

impl Kernel {
    /// Fail with `BadAddress` unless `pid` may touch `[addr, addr + len)`
    fn check_user_range(
        &self,
        holder: Holder,
        pid: ProcessId,
        addr: VirtAddr,
        len: usize,
        access: AccessFlags,
    ) -> KernResult<()> {
        let process = self.process(holder, pid)?;
        let inner = process.inner.read(holder)?;
        self.vm()?.check_range(&inner.space, holder, addr, len, access)
    }

    /// Identity of a live thread: its process and that process's role
    fn party(&self, holder: Holder, tid: ThreadId) -> KernResult<(ProcessId, Option<Role>)> {
        let info = self.scheduler()?.thread(holder, tid)?;
        if info.state == ThreadState::Dead {
            return Err(KernError::NoSuchThread);
        }
        let role = self.processes()?.role_of(holder, info.pid)?;
        Ok((info.pid, role))
    }

    /// Is anybody left who could take a message for `target`
    fn target_exists(&self, holder: Holder, target: Target) -> KernResult<bool> {
        Ok(match target {
            Target::Thread(tid) => matches!(
                self.scheduler()?.thread(holder, tid),
                Ok(info) if info.state != ThreadState::Dead
            ),
            Target::Process(pid) => self.process(holder, pid).is_ok(),
            Target::Role(role) => self.processes()?.by_role(holder, role)?.is_some(),
            Target::Any => true,
        })
    }

    /// Finish a parked thread's IPC call and make it runnable
    fn complete(
        &self,
        holder: Holder,
        state: &mut IpcState,
        tid: ThreadId,
        completion: IpcCompletion,
    ) -> KernResult<()> {
        state.completions.insert(tid, completion);
        self.scheduler()?.wake(holder, tid)?;
        Ok(())
    }

    /// Send a message
    ///
    /// The payload is copied out of the sender's address space at once. If
    /// a matching receiver is already waiting the message lands in its
    /// buffer immediately; otherwise it waits for one. A sender expecting a
    /// reply blocks until [`Kernel::reply`]; a fire-and-forget sender blocks
    /// only until a receiver takes the message.
    pub fn send(
        &self,
        holder: Holder,
        sender: ThreadId,
        req: SendRequest,
    ) -> KernResult<Option<IpcCompletion>> {
        let max = self.config().max_message_bytes;
        if req.len > max {
            return Err(KernError::MessageTooLarge { len: req.len, max });
        }
        let (sender_pid, sender_role) = self.party(holder, sender)?;
        let needs_reply = req.wants_reply();
        if needs_reply {
            self.check_user_range(holder, sender_pid, req.reply_buf, req.reply_max, AccessFlags::WRITE)?;
        }
        self.check_user_range(holder, sender_pid, req.payload, req.len, AccessFlags::READ)?;
        let mut data = message_buffer(req.len)?;
        self.copy_in(holder, sender_pid, req.payload, &mut data)?;

        let sched = self.scheduler()?;
        let mut state = self.ipc()?.state.write(holder)?;
        if state.is_busy(sender) {
            return Err(KernError::InvalidState);
        }

        let found = state.receivers.iter().position(|w| {
            req.target.matches(w.tid, w.pid, w.role)
                && w.filter.matches(sender, sender_pid, sender_role)
        });
        let Some(index) = found else {
            if !self.target_exists(holder, req.target)? {
                return Err(KernError::NoReceiver);
            }
            state
                .pending
                .try_reserve(1)
                .map_err(|_| KernError::OutOfMemory)?;
            state.pending.push_back(PendingSend {
                sender,
                sender_pid,
                sender_role,
                target: req.target,
                data,
                reply_buf: req.reply_buf,
                reply_max: req.reply_max,
                needs_reply,
            });
            sched.block(holder, sender, BlockReason::Send)?;
            log::trace!("ipc: {} queued for {:?}", sender, req.target);
            return Ok(None);
        };

        let waiter = state.receivers[index];
        if data.len() > waiter.max {
            return Err(KernError::MessageTooLarge {
                len: data.len(),
                max: waiter.max,
            });
        }
        state.receivers.remove(index);
        if let Err(err) = self.copy_out(holder, waiter.pid, waiter.buf, &data) {
            log::warn!("ipc: receive buffer of {} unusable: {}", waiter.tid, err);
            self.complete(holder, &mut state, waiter.tid, IpcCompletion::Failed(err))?;
            return Err(KernError::NoReceiver);
        }

        let info = MessageInfo {
            sender,
            sender_pid,
            len: data.len(),
            needs_reply,
        };
        sched.set_return(holder, waiter.tid, data.len())?;
        self.complete(holder, &mut state, waiter.tid, IpcCompletion::Received(info))?;
        log::trace!("ipc: {} -> {} ({} bytes)", sender, waiter.tid, data.len());

        if needs_reply {
            state.replies.insert(
                sender,
                ReplyWait {
                    receiver: waiter.tid,
                    buf: req.reply_buf,
                    max: req.reply_max,
                },
            );
            sched.block(holder, sender, BlockReason::Reply)?;
            Ok(None)
        } else {
            Ok(Some(IpcCompletion::Delivered))
        }
    }

    /// Receive a message
    ///
    /// A receiver with an `Any` filter takes a pending signal of its process
    /// before any message. With nothing to take the receiver blocks.
    pub fn recv(
        &self,
        holder: Holder,
        receiver: ThreadId,
        req: RecvRequest,
    ) -> KernResult<Option<IpcCompletion>> {
        if req.max > self.config().max_message_bytes {
            return Err(KernError::InvalidArgument);
        }
        let (pid, role) = self.party(holder, receiver)?;
        self.check_user_range(holder, pid, req.buf, req.max, AccessFlags::WRITE)?;

        let sched = self.scheduler()?;
        let mut state = self.ipc()?.state.write(holder)?;
        if state.is_busy(receiver) {
            return Err(KernError::InvalidState);
        }

        if req.filter == Target::Any {
            if let Some(signal) = self.process(holder, pid)?.take_signal(holder)? {
                return Ok(Some(IpcCompletion::Signal(signal)));
            }
        }

        let found = state.pending.iter().position(|p| {
            p.target.matches(receiver, pid, role)
                && req.filter.matches(p.sender, p.sender_pid, p.sender_role)
        });
        let Some(index) = found else {
            state
                .receivers
                .try_reserve(1)
                .map_err(|_| KernError::OutOfMemory)?;
            state.receivers.push_back(RecvWaiter {
                tid: receiver,
                pid,
                role,
                filter: req.filter,
                buf: req.buf,
                max: req.max,
            });
            sched.block(holder, receiver, BlockReason::Receive)?;
            return Ok(None);
        };

        let len = state.pending[index].data.len();
        if len > req.max {
            return Err(KernError::MessageTooLarge { len, max: req.max });
        }
        self.copy_out(holder, pid, req.buf, &state.pending[index].data)?;
        let Some(msg) = state.pending.remove(index) else {
            return Err(KernError::InvalidState);
        };

        if msg.needs_reply {
            state.replies.insert(
                msg.sender,
                ReplyWait {
                    receiver,
                    buf: msg.reply_buf,
                    max: msg.reply_max,
                },
            );
            sched.block(holder, msg.sender, BlockReason::Reply)?;
        } else {
            self.complete(holder, &mut state, msg.sender, IpcCompletion::Delivered)?;
        }
        log::trace!("ipc: {} took {} bytes from {}", receiver, len, msg.sender);

        Ok(Some(IpcCompletion::Received(MessageInfo {
            sender: msg.sender,
            sender_pid: msg.sender_pid,
            len,
            needs_reply: msg.needs_reply,
        })))
    }

    /// Answer the message `replier` took from `to`
    ///
    /// The payload lands in the reply buffer `to` named when sending; `to`
    /// is released and both partners are rewarded for the exchange.
    pub fn reply(
        &self,
        holder: Holder,
        replier: ThreadId,
        to: ThreadId,
        payload: VirtAddr,
        len: usize,
    ) -> KernResult<()> {
        let (pid, _) = self.party(holder, replier)?;
        self.check_user_range(holder, pid, payload, len, AccessFlags::READ)?;
        let mut data = message_buffer(len)?;
        self.copy_in(holder, pid, payload, &mut data)?;

        let sched = self.scheduler()?;
        let mut state = self.ipc()?.state.write(holder)?;
        let wait = match state.replies.get(&to) {
            None => return Err(KernError::NoReceiver),
            Some(w) if w.receiver != replier => return Err(KernError::InvalidState),
            Some(w) => *w,
        };
        if len > wait.max {
            return Err(KernError::MessageTooLarge { len, max: wait.max });
        }
        state.replies.remove(&to);

        let (to_pid, _) = self.party(holder, to)?;
        if let Err(err) = self.copy_out(holder, to_pid, wait.buf, &data) {
            log::warn!("ipc: reply buffer of {} unusable: {}", to, err);
            self.complete(holder, &mut state, to, IpcCompletion::Failed(err))?;
            return Err(KernError::NoReceiver);
        }

        sched.set_return(holder, to, len)?;
        sched.reward(holder, to)?;
        sched.reward(holder, replier)?;
        self.complete(holder, &mut state, to, IpcCompletion::Replied { len })
    }

    /// Queue a signal on `target`
    ///
    /// `sender` of `None` is the kernel. A process may signal itself and
    /// its children; anything else needs `SIGNAL_ANY`. Numbers below
    /// `SIG_USER` are reserved for the kernel.
    pub fn send_signal(
        &self,
        holder: Holder,
        target: ProcessId,
        sender: Option<ProcessId>,
        signum: u32,
        code: u64,
    ) -> KernResult<()> {
        let process = self.process(holder, target)?;
        if let Some(from) = sender {
            if signum < SIG_USER {
                return Err(KernError::InvalidArgument);
            }
            let related = from == target || process.parent() == Some(from);
            if !related {
                self.process(holder, from)?.require(ProcessRights::SIGNAL_ANY)?;
            }
        }
        self.deliver_signal(holder, target, Signal { signum, code, sender })
    }

    /// Hand `signal` to a receiver of `pid` blocked with an `Any` filter,
    /// or queue it on the process
    pub(crate) fn deliver_signal(&self, holder: Holder, pid: ProcessId, signal: Signal) -> KernResult<()> {
        let process = self.process(holder, pid)?;
        let mut state = self.ipc()?.state.write(holder)?;
        let waiting = state
            .receivers
            .iter()
            .position(|w| w.pid == pid && w.filter == Target::Any);
        if let Some(index) = waiting {
            if let Some(waiter) = state.receivers.remove(index) {
                return self.complete(holder, &mut state, waiter.tid, IpcCompletion::Signal(signal));
            }
        }
        process.push_signal(holder, signal)?;
        log::trace!("ipc: signal {} queued on {}", signal.signum, pid);
        Ok(())
    }

    /// Collect the result of `thread`'s last blocking IPC call
    pub fn take_completion(&self, holder: Holder, thread: ThreadId) -> KernResult<Option<IpcCompletion>> {
        Ok(self.ipc()?.state.write(holder)?.completions.remove(&thread))
    }

    /// Drop every IPC record of a departing thread
    ///
    /// Senders waiting on it, for a reply or with a message addressed to it
    /// alone, fail with `NoReceiver`.
    pub(crate) fn ipc_forget(&self, holder: Holder, thread: ThreadId) -> KernResult<()> {
        let mut state = self.ipc()?.state.write(holder)?;
        state.receivers.retain(|w| w.tid != thread);
        state.pending.retain(|p| p.sender != thread);
        state.replies.remove(&thread);
        state.completions.remove(&thread);

        let mut orphans: Vec<ThreadId> = state
            .replies
            .iter()
            .filter(|(_, w)| w.receiver == thread)
            .map(|(&s, _)| s)
            .collect();
        orphans.extend(
            state
                .pending
                .iter()
                .filter(|p| p.target == Target::Thread(thread))
                .map(|p| p.sender),
        );
        state.replies.retain(|_, w| w.receiver != thread);
        state.pending.retain(|p| p.target != Target::Thread(thread));

        for sender in orphans {
            self.complete(
                holder,
                &mut state,
                sender,
                IpcCompletion::Failed(KernError::NoReceiver),
            )?;
        }
        Ok(())
    }
}
