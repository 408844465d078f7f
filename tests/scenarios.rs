//! End-to-end scenarios
//!
//! Drives a booted kernel on the hosted platform through message exchange,
//! VMA fault and resize, fork sharing and scheduling.

use kcore::hal::hosted::{HostedPlatform, PageTableOp};
use kcore::ipc::{IpcCompletion, RecvRequest, SendRequest, Target};
use kcore::kern::{BlockReason, Priority, ProcessRights, Registers, ThreadState};
use kcore::types::{CpuId, Layer, ProcessId, ThreadId, VirtAddr, PAGE_SIZE};
use kcore::vm::{AccessFlags, FaultDecision, VmaFlags};
use kcore::{Holder, InitPhase, Kernel, KernelConfig};

const CPU0: CpuId = CpuId(0);
const H: Holder = Holder::Cpu(CPU0);

const RW: VmaFlags = VmaFlags::READABLE
    .union(VmaFlags::WRITABLE)
    .union(VmaFlags::MEMORY);

// ════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════

/// `kernel` is declared first so it drops before the services it uses
struct Machine {
    kernel: Kernel,
    hosted: HostedPlatform,
}

fn machine(config: KernelConfig) -> Machine {
    let hosted = HostedPlatform::new(64 * PAGE_SIZE).expect("hosted platform");
    let kernel = Kernel::new(config, hosted.platform()).expect("kernel");
    kernel
        .bootstrap(&hosted.boot_environment(), CPU0)
        .expect("bootstrap");
    kernel.init(CPU0).expect("init");
    assert_eq!(kernel.phase(), InitPhase::FullyOperational);
    Machine { kernel, hosted }
}

fn spawn(k: &Kernel, pid: ProcessId) -> ThreadId {
    k.thread_new(H, pid, None, None, Registers::default(), VirtAddr(0))
        .expect("thread")
}

fn user_process(k: &Kernel) -> ProcessId {
    k.process_new(H, None, None, Layer::USER, ProcessRights::empty())
        .expect("process")
}

fn state(k: &Kernel, tid: ThreadId) -> ThreadState {
    k.scheduler().unwrap().thread(H, tid).unwrap().state
}

// ════════════════════════════════════════════════════════════
// Scenarios
// ════════════════════════════════════════════════════════════

#[test]
fn scenario_send_and_reply() {
    let m = machine(KernelConfig::new());
    let k = &m.kernel;
    let (pa, pb) = (user_process(k), user_process(k));
    let (a, b) = (spawn(k, pa), spawn(k, pb));
    let buf = VirtAddr(0x40_0000);
    let reply_buf = VirtAddr(0x40_1000);
    k.vma_add(H, pa, buf, 2 * PAGE_SIZE, RW, 0).unwrap();
    k.vma_add(H, pb, buf, PAGE_SIZE, RW, 0).unwrap();

    // B waits first
    let recv = RecvRequest { filter: Target::Any, buf, max: 128 };
    assert_eq!(k.recv(H, b, recv).unwrap(), None);
    assert_eq!(state(k, b), ThreadState::Blocked(BlockReason::Receive));

    let request: Vec<u8> = (0..64u8).collect();
    k.copy_out(H, pa, buf, &request).unwrap();
    let send = SendRequest::call(Target::Thread(b), buf, 64, reply_buf, 32);
    assert_eq!(k.send(H, a, send).unwrap(), None);
    assert_eq!(state(k, a), ThreadState::Blocked(BlockReason::Reply));

    let mut landed = [0u8; 64];
    k.copy_in(H, pb, buf, &mut landed).unwrap();
    assert_eq!(&landed[..], &request[..]);
    match k.take_completion(H, b).unwrap() {
        Some(IpcCompletion::Received(info)) => assert_eq!(info.len, 64),
        other => panic!("unexpected completion {:?}", other),
    }

    let answer = [0xA5u8; 32];
    k.copy_out(H, pb, buf, &answer).unwrap();
    k.reply(H, b, a, buf, 32).unwrap();

    assert_eq!(state(k, a), ThreadState::Ready);
    assert_eq!(
        k.take_completion(H, a).unwrap(),
        Some(IpcCompletion::Replied { len: 32 })
    );
    let mut got = [0u8; 32];
    k.copy_in(H, pa, reply_buf, &mut got).unwrap();
    assert_eq!(got, answer);
    // Nothing spilled past the reply
    let mut after = [0u8; 1];
    k.copy_in(H, pa, reply_buf.offset(32), &mut after).unwrap();
    assert_eq!(after, [0]);
}

#[test]
fn scenario_fault_then_shrink() {
    let m = machine(KernelConfig::new());
    let k = &m.kernel;
    let p = user_process(k);
    let base = VirtAddr(0x80_0000);
    k.vma_add(H, p, base, 3 * PAGE_SIZE, RW, 0).unwrap();

    let third = base.offset(2 * PAGE_SIZE);
    let decision = k.handle_fault(H, p, third.offset(0x10), AccessFlags::WRITE).unwrap();
    let frame = match decision {
        FaultDecision::MapNewPage { virt, phys } => {
            assert_eq!(virt, third);
            phys
        }
        other => panic!("unexpected decision {:?}", other),
    };
    assert!(m.hosted.phys.is_allocated(frame));
    m.hosted.page_tables.take();

    let new_size = k.vma_resize(H, p, base, -(PAGE_SIZE as isize)).unwrap();
    assert_eq!(new_size, 2 * PAGE_SIZE);
    assert!(m
        .hosted
        .page_tables
        .ops()
        .contains(&PageTableOp::Unmap { pid: p, virt: third }));
    assert!(!m.hosted.phys.is_allocated(frame));

    assert_eq!(k.vma_find(H, p, third, 1).unwrap(), None);
    let info = k.vma_find(H, p, base, 2 * PAGE_SIZE).unwrap().unwrap();
    assert_eq!(info.size, 2 * PAGE_SIZE);
    assert_eq!(
        k.handle_fault(H, p, third, AccessFlags::READ).unwrap(),
        FaultDecision::BadAccess
    );
}

#[test]
fn scenario_shared_area_across_fork() {
    let m = machine(KernelConfig::new());
    let k = &m.kernel;
    let parent = user_process(k);
    let t = spawn(k, parent);
    let base = VirtAddr(0x100_0000);
    k.vma_add(H, parent, base, PAGE_SIZE, RW | VmaFlags::SHARED, 7)
        .unwrap();

    let (child, _) = k.fork(H, t).unwrap();

    let from_parent = k
        .handle_fault(H, parent, base, AccessFlags::WRITE)
        .unwrap();
    let from_child = k.handle_fault(H, child, base, AccessFlags::WRITE).unwrap();
    let frame = from_parent.frame().unwrap();
    assert!(matches!(from_parent, FaultDecision::MapNewSharedPage { .. }));
    assert!(matches!(from_child, FaultDecision::MapNewSharedPage { .. }));
    assert_eq!(from_child.frame(), Some(frame));

    assert!(!k.vma_unlink(H, parent, base).unwrap());
    assert!(m.hosted.phys.is_allocated(frame));
    assert!(k.vma_find(H, child, base, PAGE_SIZE).unwrap().is_some());
    assert_eq!(
        k.handle_fault(H, child, base, AccessFlags::READ).unwrap().frame(),
        Some(frame)
    );

    assert!(k.vma_unlink(H, child, base).unwrap());
    assert!(!m.hosted.phys.is_allocated(frame));
}

#[test]
fn scenario_round_robin_fairness() {
    let m = machine(KernelConfig::new().with_priorities(8, 4).with_timeslice(1));
    let k = &m.kernel;
    let sched = k.scheduler().unwrap();
    let p = user_process(k);
    let threads: Vec<ThreadId> = (0..4)
        .map(|_| {
            k.thread_new(H, p, Some(CPU0), Some(Priority::new(4, 8)), Registers::default(), VirtAddr(0))
                .unwrap()
        })
        .collect();

    let mut regs = Registers::default();
    let mut seen = vec![sched.pick(H, CPU0, &mut regs).unwrap().unwrap()];
    for _ in 0..7 {
        seen.push(sched.tick(H, CPU0, &mut regs).unwrap().unwrap());
    }
    let expected: Vec<ThreadId> = threads.iter().chain(threads.iter()).copied().collect();
    assert_eq!(seen, expected);
}

#[test]
fn scenario_thread_exit_reaches_executive() {
    let m = machine(KernelConfig::new());
    let k = &m.kernel;
    let exec = k
        .process_new(H, None, Some(kcore::types::Role::Executive), Layer::EXECUTIVE, ProcessRights::all())
        .unwrap();
    let listener = spawn(k, exec);
    k.vma_add(H, exec, VirtAddr(0x10000), PAGE_SIZE, RW, 0).unwrap();

    let recv = RecvRequest { filter: Target::Any, buf: VirtAddr(0x10000), max: 16 };
    assert_eq!(k.recv(H, listener, recv).unwrap(), None);

    let worker_pid = user_process(k);
    let worker = spawn(k, worker_pid);
    k.thread_exit(H, worker).unwrap();

    match k.take_completion(H, listener).unwrap() {
        Some(IpcCompletion::Signal(sig)) => {
            assert_eq!(sig.signum, kcore::ipc::signal::SIG_THREAD_DEATH);
            assert_eq!(sig.code, worker.0);
        }
        other => panic!("unexpected completion {:?}", other),
    }

    assert!(k.reap(H, worker).unwrap());
    let exec_process = k.process(H, exec).unwrap();
    let sig = exec_process.take_signal(H).unwrap().unwrap();
    assert_eq!(sig.signum, kcore::ipc::signal::SIG_PROCESS_EXIT);
    assert_eq!(sig.code, worker_pid.0);
}
