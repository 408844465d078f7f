//! Message descriptors
//!
//! What a thread hands the kernel to send or receive, and what it gets back.
//! Payloads stay in user memory until the kernel copies them; descriptors
//! only carry addresses and lengths.

use bitflags::bitflags;

use crate::error::KernError;
use crate::types::{ProcessId, Role, ThreadId, VirtAddr};

use super::signal::Signal;

/// Who a message is for, or who a receiver accepts messages from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Thread(ThreadId),
    Process(ProcessId),
    Role(Role),
    /// First willing party
    Any,
}

impl Target {
    /// Does a party with this identity satisfy the target
    pub fn matches(&self, tid: ThreadId, pid: ProcessId, role: Option<Role>) -> bool {
        match *self {
            Target::Thread(t) => t == tid,
            Target::Process(p) => p == pid,
            Target::Role(r) => role == Some(r),
            Target::Any => true,
        }
    }
}

bitflags! {
    /// Send options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SendFlags: u32 {
        /// Fire and forget: release the sender once delivered, no reply
        const NO_REPLY = 1 << 0;
    }
}

/// A send request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub target: Target,
    /// Payload in the sender's address space
    pub payload: VirtAddr,
    pub len: usize,
    /// Where the reply lands in the sender's address space
    pub reply_buf: VirtAddr,
    pub reply_max: usize,
    pub flags: SendFlags,
}

impl SendRequest {
    /// Synchronous call: send and wait for a reply
    pub const fn call(
        target: Target,
        payload: VirtAddr,
        len: usize,
        reply_buf: VirtAddr,
        reply_max: usize,
    ) -> Self {
        Self {
            target,
            payload,
            len,
            reply_buf,
            reply_max,
            flags: SendFlags::empty(),
        }
    }

    /// One-way notification
    pub const fn notify(target: Target, payload: VirtAddr, len: usize) -> Self {
        Self {
            target,
            payload,
            len,
            reply_buf: VirtAddr(0),
            reply_max: 0,
            flags: SendFlags::NO_REPLY,
        }
    }

    pub fn wants_reply(&self) -> bool {
        !self.flags.contains(SendFlags::NO_REPLY)
    }
}

/// A receive request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    /// Senders this receiver accepts
    pub filter: Target,
    /// Buffer in the receiver's address space
    pub buf: VirtAddr,
    /// Largest message the buffer takes
    pub max: usize,
}

/// Header of a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub sender: ThreadId,
    pub sender_pid: ProcessId,
    pub len: usize,
    /// The sender waits for `reply`
    pub needs_reply: bool,
}

/// How a blocking IPC operation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCompletion {
    /// A message landed in the receive buffer
    Received(MessageInfo),
    /// A signal was delivered instead of a message
    Signal(Signal),
    /// A fire-and-forget message was taken by a receiver
    Delivered,
    /// The reply landed in the reply buffer
    Replied { len: usize },
    /// The partner went away
    Failed(KernError),
}
