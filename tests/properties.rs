//! Property-based tests for kcore
//!
//! These tests use proptest to drive the gate, the heap, record pools and
//! the VMA tree with generated operation sequences and check the
//! invariants each must keep.

use kcore::hal::hosted::{HostedHeapWindow, HostedPhysPages, HostedPlatform};
use kcore::kern::{Gate, GateMode, Heap, LockPool, Pool, PoolSlot, ProcessRights};
use kcore::types::{CpuId, Layer, ThreadId, VirtAddr, PAGE_SIZE};
use kcore::vm::VmaFlags;
use kcore::{Holder, KernError, Kernel, KernelConfig};
use proptest::prelude::*;

const H: Holder = Holder::Cpu(CpuId(0));

// ════════════════════════════════════════════════════════════
// Fixtures
// ════════════════════════════════════════════════════════════

struct HeapFixture {
    heap: Heap,
    _window: HostedHeapWindow,
    _pool: LockPool,
    _phys: HostedPhysPages,
}

fn heap_fixture(min_block: usize) -> HeapFixture {
    let phys = HostedPhysPages::new();
    let pool = LockPool::new();
    pool.bootstrap(&phys, H).unwrap();
    let window = HostedHeapWindow::reserve(16 * PAGE_SIZE).unwrap();
    let gate = pool.alloc_gate(&phys, H).unwrap();
    let heap = Heap::new(window.window(), min_block, 4 * PAGE_SIZE, gate, H).unwrap();
    HeapFixture {
        heap,
        _window: window,
        _pool: pool,
        _phys: phys,
    }
}

#[derive(Debug, Clone, Copy)]
enum GateOp {
    Acquire(u64, bool),
    Release(usize),
}

fn gate_op() -> impl Strategy<Value = GateOp> {
    prop_oneof![
        (0u64..4, any::<bool>()).prop_map(|(t, write)| GateOp::Acquire(t, write)),
        (0usize..16).prop_map(GateOp::Release),
    ]
}

// ════════════════════════════════════════════════════════════
// Gate Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// No holder shares the gate with a writer
    #[test]
    fn gate_mutual_exclusion(ops in prop::collection::vec(gate_op(), 1..60)) {
        let gate = Gate::new();
        let mut held: Vec<(Holder, GateMode)> = Vec::new();

        for op in ops {
            match op {
                GateOp::Acquire(t, write) => {
                    let holder = Holder::Thread(ThreadId(t));
                    let mode = if write { GateMode::Write } else { GateMode::Read };
                    if gate.try_acquire(holder, mode).is_ok() {
                        held.push((holder, mode));
                    }
                }
                GateOp::Release(i) => {
                    if !held.is_empty() {
                        let (holder, mode) = held.remove(i % held.len());
                        gate.release(holder, mode);
                    }
                }
            }

            let writer = held.iter().find(|(_, m)| *m == GateMode::Write).map(|(h, _)| *h);
            if let Some(writer) = writer {
                prop_assert!(held.iter().all(|(h, _)| *h == writer));
            }
        }

        for (holder, mode) in held.drain(..) {
            gate.release(holder, mode);
        }
        prop_assert!(gate.is_idle());
    }

    /// A holder that entered n times leaves after n releases
    #[test]
    fn gate_reentry_needs_matching_releases(depth in 1usize..6) {
        let gate = Gate::new();
        let a = Holder::Thread(ThreadId(1));
        let b = Holder::Thread(ThreadId(2));
        for _ in 0..depth {
            gate.acquire(a, GateMode::Write).unwrap();
        }
        for _ in 1..depth {
            gate.release(a, GateMode::Write);
            prop_assert!(gate.try_acquire(b, GateMode::Write).is_err());
        }
        gate.release(a, GateMode::Write);
        prop_assert!(gate.try_acquire(b, GateMode::Write).is_ok());
    }
}

// ════════════════════════════════════════════════════════════
// Allocator Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// alloc then free restores the free list exactly
    #[test]
    fn heap_alloc_free_round_trip(
        min_shift in 4u32..7,
        size in 1usize..1024,
        warmup in prop::collection::vec(1usize..256, 0..4),
    ) {
        let f = heap_fixture(1 << min_shift);
        let held: Vec<_> = warmup.iter().map(|&n| f.heap.alloc(H, n).unwrap()).collect();

        let before = f.heap.free_list(H).unwrap();
        let stats_before = f.heap.stats(H).unwrap();
        let p = f.heap.alloc(H, size).unwrap();
        prop_assert!(f.heap.usable_size(H, p).unwrap() >= size);
        f.heap.free(H, p).unwrap();
        prop_assert_eq!(f.heap.free_list(H).unwrap(), before);
        let stats_after = f.heap.stats(H).unwrap();
        prop_assert_eq!(stats_after.free_blocks, stats_before.free_blocks);
        prop_assert_eq!(stats_after.free_bytes, stats_before.free_bytes);

        for p in held {
            f.heap.free(H, p).unwrap();
        }
    }

    /// Growth keeps every live record reachable with its value
    #[test]
    fn pool_grow_preserves_records(
        values in prop::collection::vec(any::<u64>(), 1..12),
        additional in 1usize..16,
        pin in any::<bool>(),
    ) {
        let f = heap_fixture(16);
        let mut pool: Pool<u64> = Pool::create(&f.heap, H, values.len()).unwrap();
        let slots: Vec<PoolSlot> = values
            .iter()
            .map(|&v| pool.alloc(&f.heap, H, v).unwrap())
            .collect();
        let raw: Vec<usize> = slots
            .iter()
            .map(|&s| pool.as_ptr(s).unwrap().as_ptr() as usize)
            .collect();

        let pinned = if pin { Some(f.heap.alloc(H, 16).unwrap()) } else { None };
        let report = pool.grow(&f.heap, H, additional).unwrap();

        for ((&slot, &value), &addr) in slots.iter().zip(&values).zip(&raw) {
            prop_assert_eq!(pool.get(slot), Some(value));
            prop_assert_eq!(report.rebase(addr), pool.as_ptr(slot).unwrap().as_ptr() as usize);
        }
        let order: Vec<u64> = pool.iter().map(|(_, v)| v).collect();
        prop_assert_eq!(order, values);
        prop_assert_eq!(pool.total(), slots.len() + additional);

        pool.destroy(&f.heap, H).unwrap();
        if let Some(p) = pinned {
            f.heap.free(H, p).unwrap();
        }
    }
}

// ════════════════════════════════════════════════════════════
// VMA Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A new VMA fails with AlreadyExists exactly when it overlaps
    #[test]
    fn vma_overlap_rejection(start in 0usize..40, pages in 1usize..10) {
        let hosted = HostedPlatform::new(32 * PAGE_SIZE).unwrap();
        let kernel = Kernel::new(KernelConfig::new(), hosted.platform()).unwrap();
        kernel.bootstrap(&hosted.boot_environment(), CpuId(0)).unwrap();
        kernel.init(CpuId(0)).unwrap();
        let pid = kernel
            .process_new(H, None, None, Layer::USER, ProcessRights::empty())
            .unwrap();

        let origin = 0x100_0000;
        let flags = VmaFlags::READABLE | VmaFlags::MEMORY;
        kernel
            .vma_add(H, pid, VirtAddr(origin + 16 * PAGE_SIZE), 8 * PAGE_SIZE, flags, 0)
            .unwrap();

        let result = kernel.vma_add(
            H,
            pid,
            VirtAddr(origin + start * PAGE_SIZE),
            pages * PAGE_SIZE,
            flags,
            0,
        );
        let overlaps = start < 24 && start + pages > 16;
        if overlaps {
            prop_assert_eq!(result.err(), Some(KernError::AlreadyExists));
        } else {
            prop_assert!(result.is_ok());
        }
        drop(kernel);
    }
}
