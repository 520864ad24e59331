//! Delivery order across multi-packet handshakes, and write-blocked
//! servicing order.

use std::time::Instant;

use quic_dispatcher::dispatcher::{DispatchOutcome, DropReason, RouterConfig, Verdict};

use super::common::*;

#[test]
fn test_split_client_hello_keeps_arrival_order() {
    let mut h = Harness::accept_all();
    let long_name = format!("{}.example.com", "a".repeat(200));
    let hello = client_hello(&long_name, &["h3", "hq-interop"]);
    let (head, tail) = hello.split_at(hello.len() / 2);

    let first = initial(20, 0, head);
    let early = zero_rtt(20, 0x0e);
    let second = initial(20, head.len() as u64, tail);
    let late = zero_rtt(20, 0x1a);

    assert_eq!(h.receive(first.clone()), DispatchOutcome::Buffered);
    assert_eq!(h.receive(early.clone()), DispatchOutcome::Buffered);
    assert_eq!(h.receive(second.clone()), DispatchOutcome::SessionCreated);
    assert_eq!(h.receive(late.clone()), DispatchOutcome::Delivered);

    assert_eq!(h.log.delivered_to(20), vec![first, early, second, late]);
}

#[test]
fn test_interleaved_ids_keep_per_id_order() {
    let validator = ManualValidator::default();
    let mut h = Harness::new(RouterConfig::default(), validator.boxed());

    let a = [hello_initial(30), zero_rtt(30, 1), zero_rtt(30, 2)];
    let b = [zero_rtt(31, 1), hello_initial(31), zero_rtt(31, 2)];
    for (pa, pb) in a.iter().zip(b.iter()) {
        h.receive(pa.clone());
        h.receive(pb.clone());
    }

    validator.resolve(31, Verdict::accept());
    validator.resolve(30, Verdict::accept());
    assert_eq!(h.router.process_events(Instant::now()), 2);

    assert_eq!(h.log.delivered_to(30), a.to_vec());
    assert_eq!(h.log.delivered_to(31), b.to_vec());
    assert_eq!(h.log.created.borrow().as_slice(), &[cid(31), cid(30)]);
}

#[test]
fn test_write_blocked_serviced_fifo() {
    let mut h = Harness::accept_all();
    for id in 1..=3 {
        assert_eq!(h.receive(hello_initial(id)), DispatchOutcome::SessionCreated);
    }

    h.log.notifier(3).write_blocked();
    h.log.notifier(1).write_blocked();
    h.log.notifier(3).write_blocked();
    h.router.process_events(Instant::now());
    assert!(h.router.has_write_blocked_sessions());

    assert_eq!(h.router.on_can_write(), 2);
    assert_eq!(h.log.writable.borrow().as_slice(), &[cid(3), cid(1)]);
    assert!(!h.router.has_write_blocked_sessions());
}

#[test]
fn test_reblocked_session_stays_queued() {
    let mut h = Harness::accept_all();
    for id in 1..=2 {
        h.receive(hello_initial(id));
    }
    h.log.stay_blocked.set(true);
    h.log.notifier(1).write_blocked();
    h.log.notifier(2).write_blocked();
    h.router.process_events(Instant::now());

    assert_eq!(h.router.on_can_write(), 2);
    assert!(h.router.has_write_blocked_sessions());

    h.log.stay_blocked.set(false);
    assert_eq!(h.router.on_can_write(), 2);
    assert_eq!(
        h.log.writable.borrow().as_slice(),
        &[cid(1), cid(2), cid(1), cid(2)]
    );
    assert!(!h.router.has_write_blocked_sessions());
}

#[test]
fn test_blocked_writer_drops_responses() {
    let mut h = Harness::accept_all();
    h.wire.blocked.set(true);
    assert!(h.router.is_write_blocked());

    assert_eq!(
        h.receive(short_header(99, 64)),
        DispatchOutcome::Dropped(DropReason::UnknownConnection)
    );
    assert_eq!(h.wire.sent_count(), 0);
    assert_eq!(h.router.stats().snapshot().writes_failed, 1);

    h.router.on_can_write();
    assert!(!h.router.is_write_blocked());
    assert_eq!(h.receive(short_header(99, 64)), DispatchOutcome::StatelessReset);
}
