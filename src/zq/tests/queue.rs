mod common;

use std::sync::atomic::Ordering;

use zq::config::LoopbackConfig;
use zq::queue::cq::{CqEntry, CQ_STATUS_REMOTE_ERROR, CQ_STATUS_SUCCESS};
use zq::queue::{ALL_SLICES, MAX_CMP_LEN};
use zq::{free_queue, AccessFlags, AtomicOp, AtomicSize, Domain, Error, Queue};

use common::{counting_runtime, counting_runtime_with, loopback_runtime};

fn poll_all(q: &Queue<'_>, want: usize) -> Vec<zq::Completion> {
    let mut out = Vec::new();
    let mut spins = 0;
    while out.len() < want {
        let remaining = want - out.len();
        q.poll(&mut out, remaining).unwrap();
        spins += 1;
        assert!(spins < 1_000_000, "completions never arrived");
    }
    out
}

#[test]
fn nop_round_trip() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();
    assert_eq!(q.cmd_len(), 4);
    assert_eq!(q.usable_slots(), 3);

    let i = q.reserve(1).unwrap();
    assert_eq!(i, 0);
    unsafe { q.no_op(i, false, 0xdead_beef).unwrap() };
    q.commit(i, 1).unwrap();

    let mut out = Vec::new();
    assert_eq!(q.poll(&mut out, 4).unwrap(), 1);
    assert_eq!(out[0].context, 0xdead_beef);
    assert!(out[0].is_success());
    assert_eq!(q.outstanding(), 0);
    assert_eq!(q.contexts_in_use(), 0);

    // Nothing left to report.
    assert_eq!(q.poll(&mut out, 4).unwrap(), 0);
    q.free().unwrap();
}

#[test]
fn lengths_round_up_to_powers_of_two() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 5, 3, 0, 0, ALL_SLICES).unwrap();
    assert_eq!(q.cmd_len(), 8);
    assert_eq!(q.cmp_len(), 4);
    assert_eq!(q.contexts_free(), 4);
}

#[test]
fn invalid_requests_never_reach_backend() {
    let (backend, rt) = counting_runtime();
    let dom = Domain::open(&rt).unwrap();
    let max = rt.attr().limits.max_tx_qlen;

    let cases = [
        (1, 4, 0, 0, ALL_SLICES),
        (4, 1, 0, 0, ALL_SLICES),
        (max + 1, 4, 0, 0, ALL_SLICES),
        (4, 4, 16, 0, ALL_SLICES),
        (4, 4, 0, 2, ALL_SLICES),
        (4, 4, 0, 0, 0x100),
    ];
    for (cmd, cmp, tc, prio, slices) in cases {
        let err = Queue::allocate(&dom, cmd, cmp, tc, prio, slices).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    }
    assert_eq!(backend.allocs.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_post_allocate_releases_queue() {
    let (backend, rt) = counting_runtime();
    let dom = Domain::open(&rt).unwrap();
    backend.fail_post_allocate.store(true, Ordering::SeqCst);
    assert!(Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).is_err());
    assert_eq!(backend.allocs.load(Ordering::SeqCst), 1);
    assert_eq!(backend.frees.load(Ordering::SeqCst), 1);
    assert_eq!(backend.inner.queues(), 0);

    backend.fail_post_allocate.store(false, Ordering::SeqCst);
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();
    assert_eq!(backend.inner.queues(), 1);
    drop(q);
    assert_eq!(backend.frees.load(Ordering::SeqCst), 2);
    assert_eq!(backend.inner.queues(), 0);
}

#[test]
fn completion_ring_fits_the_index_width() {
    let (backend, rt) = counting_runtime_with(|b| {
        b.advertise_qlen.store(MAX_CMP_LEN * 2, Ordering::SeqCst);
    });
    assert_eq!(rt.attr().limits.max_tx_qlen, MAX_CMP_LEN * 2);
    let dom = Domain::open(&rt).unwrap();

    for cmp in [MAX_CMP_LEN + 1, MAX_CMP_LEN * 2] {
        let err = Queue::allocate(&dom, 4, cmp, 0, 0, ALL_SLICES).unwrap_err();
        assert_eq!(err, Error::InvalidArgument("cmp_len"));
    }
    assert_eq!(backend.allocs.load(Ordering::SeqCst), 0);

    let q = Queue::allocate(&dom, 4, MAX_CMP_LEN, 0, 0, ALL_SLICES).unwrap();
    assert_eq!(q.cmp_len(), MAX_CMP_LEN);
    assert_eq!(q.contexts_free(), MAX_CMP_LEN as usize);
    q.free().unwrap();
}

#[test]
fn oversized_completion_ring_from_backend_is_rolled_back() {
    let (backend, rt) = counting_runtime_with(|b| {
        b.report_cmplq_ent.store(MAX_CMP_LEN * 2, Ordering::SeqCst);
    });
    let dom = Domain::open(&rt).unwrap();
    let err = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    assert_eq!(backend.allocs.load(Ordering::SeqCst), 1);
    assert_eq!(backend.frees.load(Ordering::SeqCst), 1);
    assert_eq!(backend.inner.queues(), 0);
}

#[test]
fn unbound_completion_keeps_collected_entries() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();

    let i = q.reserve(1).unwrap();
    unsafe { q.no_op(i, false, 42).unwrap() };
    q.commit(i, 1).unwrap();
    q.signal().unwrap();

    // Context slot 0 is bound; slot 3 is not.
    let dev = q.device();
    dev.write_completion(1, &CqEntry::new(true, CQ_STATUS_SUCCESS, 3, [0; 32]));

    let mut out = Vec::new();
    assert_eq!(q.poll(&mut out, 4).unwrap(), 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].context, 42);
    assert_eq!(q.contexts_in_use(), 0);

    // With nothing collected ahead of it the failure is reported.
    dev.write_completion(2, &CqEntry::new(true, CQ_STATUS_SUCCESS, 3, [0; 32]));
    let err = q.poll(&mut out, 4).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
    assert_eq!(out.len(), 1);
    assert_eq!(q.poll(&mut out, 4).unwrap(), 0);
    q.free().unwrap();
}

#[test]
fn free_nothing_is_ok() {
    assert_eq!(free_queue(None), Ok(()));
}

#[test]
fn queue_limit_is_enforced() {
    let rt = loopback_runtime(&LoopbackConfig {
        max_tx_queues: 1,
        ..LoopbackConfig::default()
    });
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();
    assert_eq!(
        Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap_err(),
        Error::ResourceExhausted("loopback queues")
    );
    free_queue(Some(q)).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();
    q.free().unwrap();
}

#[test]
fn reservations_are_disjoint_and_bounded() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 8, 8, 0, 0, ALL_SLICES).unwrap();

    assert_eq!(q.reserve(3).unwrap(), 0);
    assert_eq!(q.reserve(3).unwrap(), 3);
    assert_eq!(q.reserve(2), Err(Error::WouldBlock));
    assert_eq!(q.outstanding(), 6);
    assert_eq!(q.reserve(1).unwrap(), 6);
    assert_eq!(q.reserve(1), Err(Error::WouldBlock));

    assert!(matches!(q.reserve(0), Err(Error::InvalidArgument(_))));
    assert!(matches!(q.reserve(8), Err(Error::InvalidArgument(_))));
    assert_eq!(q.outstanding(), 7);

    for i in 0..7 {
        unsafe { q.no_op(i, false, i as u64 + 1).unwrap() };
    }
    q.commit(0, 7).unwrap();
    let out = poll_all(&q, 7);
    let contexts: Vec<u64> = out.iter().map(|c| c.context).collect();
    assert_eq!(contexts, (1..=7).collect::<Vec<_>>());
    assert_eq!(q.outstanding(), 0);
}

#[test]
fn commit_is_in_reservation_order() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 8, 8, 0, 0, ALL_SLICES).unwrap();

    let a = q.reserve(2).unwrap();
    let b = q.reserve(2).unwrap();
    for i in 0..4 {
        unsafe { q.no_op(a + i, false, 100 + i as u64).unwrap() };
    }

    assert_eq!(
        q.commit(b, 2),
        Err(Error::OutOfOrder {
            expected: a,
            found: b
        })
    );
    assert_eq!(q.committed(), a);
    // Nothing was published, so nothing completes.
    let mut out = Vec::new();
    assert_eq!(q.poll(&mut out, 4).unwrap(), 0);

    q.commit(a, 2).unwrap();
    q.commit(b, 2).unwrap();
    assert_eq!(q.committed(), 4);
    // Only reserved slots can be published.
    assert!(matches!(q.commit(4, 1), Err(Error::InvalidArgument(_))));

    let out = poll_all(&q, 4);
    let contexts: Vec<u64> = out.iter().map(|c| c.context).collect();
    assert_eq!(contexts, vec![100, 101, 102, 103]);
}

#[test]
fn toggle_survives_many_wraps() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();

    let mut ctx = 1;
    let mut out = Vec::new();
    for _ in 0..50 {
        let start = q.reserve(3).unwrap();
        for i in 0..3 {
            unsafe { q.no_op(start + i, false, ctx + i as u64).unwrap() };
        }
        q.commit(start, 3).unwrap();
        q.signal().unwrap();

        out.clear();
        assert_eq!(q.poll(&mut out, 8).unwrap(), 3);
        for (i, c) in out.iter().enumerate() {
            assert_eq!(c.context, ctx + i as u64);
        }
        // Last pass's entries are still in the ring with the old polarity.
        assert_eq!(q.poll(&mut out, 8).unwrap(), 0);
        ctx += 3;
    }
    assert_eq!(q.outstanding(), 0);
    assert_eq!(q.contexts_free(), 4);
}

#[test]
fn poll_respects_max_entries() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 8, 8, 0, 0, ALL_SLICES).unwrap();

    let start = q.reserve(5).unwrap();
    for i in 0..5 {
        unsafe { q.no_op(start + i, i == 0, 10 + i as u64).unwrap() };
    }
    q.commit(start, 5).unwrap();
    q.signal().unwrap();

    let mut out = Vec::new();
    assert_eq!(q.poll(&mut out, 0).unwrap(), 0);
    assert_eq!(q.poll(&mut out, 2).unwrap(), 2);
    assert_eq!(q.poll(&mut out, 8).unwrap(), 3);
    assert_eq!(out.len(), 5);
    assert_eq!(out[4].context, 14);
}

#[test]
fn rejected_encodes_leave_no_trace() {
    let rt = loopback_runtime(&LoopbackConfig {
        max_dma_len: 4096,
        ..LoopbackConfig::default()
    });
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();
    let buf = vec![0u8; 8192];
    let i = q.reserve(1).unwrap();

    unsafe {
        assert!(q.no_op(i, false, 0).is_err());
        assert!(q
            .put(i, false, buf.as_ptr() as u64, 4097, 0x1000, 1)
            .is_err());
        assert!(q.put_immediate(i, false, &[0u8; 33], 0x1000, 1).is_err());
        assert!(q.put_immediate(i, false, &[], 0x1000, 1).is_err());
        assert!(q.get_immediate(i, false, 0, 0x1000, 1).is_err());
        assert!(q
            .atomic(i, false, true, AtomicSize::Size64, AtomicOp::CompareAndSwap, 0x1000, &[1], 1)
            .is_err());
    }
    assert_eq!(q.contexts_in_use(), 0);
    assert_eq!(q.contexts_free(), 4);
}

#[test]
fn data_movement_through_loopback() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 16, 16, 0, 0, ALL_SLICES).unwrap();

    let mut remote = vec![0u8; 256];
    let key = dom.register_memory(&remote, AccessFlags::ALL).unwrap();
    let raddr = remote.as_mut_ptr() as u64;
    assert_eq!(key.zaddr, raddr);

    let src: Vec<u8> = (0..64).collect();
    let mut dst = vec![0u8; 64];

    let start = q.reserve(4).unwrap();
    unsafe {
        q.put(start, false, src.as_ptr() as u64, 64, raddr, 1).unwrap();
        q.get(start + 1, true, dst.as_mut_ptr() as u64, 64, raddr, 2)
            .unwrap();
        q.put_immediate(start + 2, false, b"immediate", raddr + 128, 3)
            .unwrap();
        q.get_immediate(start + 3, true, 9, raddr + 128, 4).unwrap();
    }
    q.commit(start, 4).unwrap();
    q.signal().unwrap();

    let out = poll_all(&q, 4);
    assert!(out.iter().all(|c| c.status == CQ_STATUS_SUCCESS));
    assert_eq!(&remote[..64], &src[..]);
    assert_eq!(dst, src);
    assert_eq!(&remote[128..137], b"immediate");
    assert_eq!(out[3].context, 4);
    assert_eq!(&out[3].result[..9], b"immediate");

    dom.deregister_memory(key).unwrap();
}

#[test]
fn atomics_return_prior_values() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 8, 8, 0, 0, ALL_SLICES).unwrap();

    let mut words = vec![0u64; 4];
    words[0] = 40;
    words[1] = 7;
    words[2] = 0xffff_ffff_0000_0005;
    let bytes = unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, 32) };
    let key = dom.register_memory(bytes, AccessFlags::ALL).unwrap();
    let base = words.as_mut_ptr() as u64;

    let start = q.reserve(4).unwrap();
    unsafe {
        q.atomic(start, false, true, AtomicSize::Size64, AtomicOp::Add, base, &[2], 1)
            .unwrap();
        q.atomic(start + 1, false, true, AtomicSize::Size64, AtomicOp::CompareAndSwap, base + 8, &[7, 9], 2)
            .unwrap();
        q.atomic(start + 2, false, true, AtomicSize::Size64, AtomicOp::CompareAndSwap, base + 8, &[7, 11], 3)
            .unwrap();
        // Low half only on little endian.
        q.atomic(start + 3, false, true, AtomicSize::Size32, AtomicOp::Swap, base + 16, &[0x1_0000_0006], 4)
            .unwrap();
    }
    q.commit(start, 4).unwrap();
    q.signal().unwrap();

    let out = poll_all(&q, 4);
    assert!(out.iter().all(|c| c.is_success()));
    assert_eq!(out[0].result_u64(), 40);
    assert_eq!(out[1].result_u64(), 7);
    // Compare failed: the value seen is returned and nothing is written.
    assert_eq!(out[2].result_u64(), 9);
    assert_eq!(out[3].result_u64(), 5);
    assert_eq!(words[0], 42);
    assert_eq!(words[1], 9);
    assert_eq!(words[2], 0xffff_ffff_0000_0006);

    dom.deregister_memory(key).unwrap();
}

#[test]
fn unregistered_target_completes_with_error() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();

    let src = vec![1u8; 16];
    let mut target = vec![0u8; 16];
    let key = dom
        .register_memory(&target, AccessFlags::REMOTE_READ)
        .unwrap();

    let start = q.reserve(2).unwrap();
    unsafe {
        // Registered, but not writable.
        q.put(start, false, src.as_ptr() as u64, 16, target.as_mut_ptr() as u64, 1)
            .unwrap();
        q.no_op(start + 1, false, 2).unwrap();
    }
    q.commit(start, 2).unwrap();
    let out = poll_all(&q, 2);
    assert_eq!(out[0].status, CQ_STATUS_REMOTE_ERROR);
    assert_eq!(out[0].context, 1);
    assert!(out[1].is_success());
    assert_eq!(target, vec![0u8; 16]);
    dom.deregister_memory(key).unwrap();
}

#[test]
fn peers_and_description() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let q = Queue::allocate(&dom, 4, 4, 0, 0, ALL_SLICES).unwrap();

    let local = q.local_address().unwrap();
    let a = q.open_peer(&local).unwrap();
    let b = q.open_peer(&"10.0.0.2:7".parse().unwrap()).unwrap();
    assert_ne!(a, b);
    q.close_peer(a).unwrap();
    assert!(q.close_peer(a).is_err());
    // Closed slots are reused.
    assert_eq!(q.open_peer(&local).unwrap(), a);

    let desc = q.describe().unwrap();
    assert!(desc.starts_with("loopback queue"), "{}", desc);
}

#[test]
fn keys_export_and_import() {
    let rt = loopback_runtime(&LoopbackConfig::default());
    let dom = Domain::open(&rt).unwrap();
    let buf = vec![0u8; 64];
    let key = dom
        .register_memory(&buf, AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE)
        .unwrap();

    let blob = dom.export_remote_key(&key).unwrap();
    let imported = dom.import_remote_key(zq::PeerId(0), &blob, true).unwrap();
    assert_eq!(imported.vaddr, key.vaddr);
    assert_eq!(imported.len, 64);
    assert_eq!(imported.access, key.access);
    assert_eq!(imported.laddr, key.vaddr);

    let mut bad = blob.clone();
    bad[0] ^= 0xff;
    assert!(dom.import_remote_key(zq::PeerId(0), &bad, false).is_err());
    assert!(dom.import_remote_key(zq::PeerId(0), &blob[..8], false).is_err());
    assert_eq!(
        dom.import_fam_key(zq::PeerId(0), false),
        Err(Error::Unsupported("import_fam_key"))
    );

    dom.release_remote_key(imported).unwrap();
    dom.deregister_memory(key).unwrap();
    assert!(dom.deregister_memory(key).is_err());
}
