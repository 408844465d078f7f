//! Gate behaviour under real OS threads

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use kcore::kern::{GateCell, GateMode, Gate};
use kcore::types::ThreadId;
use kcore::Holder;

/// A writer gets in while readers keep arriving
#[test]
fn writer_is_not_starved_by_reader_flood() {
    let gate = Gate::new();
    let writer_done = AtomicBool::new(false);
    let reads = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..4u64 {
            let (gate, writer_done, reads) = (&gate, &writer_done, &reads);
            s.spawn(move || {
                let me = Holder::Thread(ThreadId(100 + t));
                while !writer_done.load(Ordering::SeqCst) {
                    gate.acquire(me, GateMode::Read).unwrap();
                    reads.fetch_add(1, Ordering::SeqCst);
                    thread::yield_now();
                    gate.release(me, GateMode::Read);
                }
            });
        }

        // Let the flood start before the writer shows up
        while reads.load(Ordering::SeqCst) < 100 {
            thread::yield_now();
        }
        let writer = Holder::Thread(ThreadId(1));
        gate.acquire(writer, GateMode::Write).unwrap();
        assert_eq!(gate.reader_count(), 0);
        assert_eq!(gate.owner(), Some(writer));
        gate.release(writer, GateMode::Write);
        writer_done.store(true, Ordering::SeqCst);
    });

    assert!(gate.is_idle());
}

/// Increments under write guards are never lost
#[test]
fn cell_counts_every_write() {
    let cell = GateCell::new(0u64);
    thread::scope(|s| {
        for t in 0..8u64 {
            let cell = &cell;
            s.spawn(move || {
                let me = Holder::Thread(ThreadId(t + 1));
                for _ in 0..500 {
                    *cell.write(me).unwrap() += 1;
                }
            });
        }
    });
    assert_eq!(*cell.read(Holder::Thread(ThreadId(1))).unwrap(), 4000);
}
