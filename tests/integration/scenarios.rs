//! End-to-end dispatch scenarios through the public router API.

use std::time::{Duration, Instant};

use quic_dispatcher::dispatcher::{
    AcceptAll, DispatchOutcome, DropReason, Membership, RouterConfig, TimeWaitAction,
    Verdict,
};

use super::common::*;

/// A 0-RTT fragment that overtakes the Initial is replayed before it.
#[test]
fn test_fragment_then_handshake_sync_accept() {
    let mut h = Harness::accept_all();
    let fragment = zero_rtt(7, 0xa1);
    let hello = hello_initial(7);

    assert_eq!(h.receive(fragment.clone()), DispatchOutcome::Buffered);
    assert_eq!(h.router.membership(&cid(7)), Membership::Buffered);

    assert_eq!(h.receive(hello.clone()), DispatchOutcome::SessionCreated);
    assert_eq!(h.router.membership(&cid(7)), Membership::Session);
    assert_eq!(h.log.delivered_to(7), vec![fragment, hello]);
    assert_eq!(h.router.buffered_count(), 0);
}

/// Datagrams arriving during an async validation follow the handshake.
#[test]
fn test_async_validation_replays_in_arrival_order() {
    let validator = ManualValidator::default();
    let mut h = Harness::new(RouterConfig::default(), validator.boxed());
    let hello = hello_initial(9);

    assert_eq!(h.receive(hello.clone()), DispatchOutcome::ValidationPending);
    assert_eq!(h.router.pending_validations(), 1);

    let followers: Vec<_> = (1..=3).map(|tag| zero_rtt(9, tag)).collect();
    for packet in &followers {
        assert_eq!(h.receive(packet.clone()), DispatchOutcome::Buffered);
    }
    assert!(h.log.created.borrow().is_empty());

    validator.resolve(9, Verdict::accept());
    assert_eq!(h.router.process_events(Instant::now()), 1);

    let mut expected = vec![hello];
    expected.extend(followers);
    assert_eq!(h.log.delivered_to(9), expected);
    assert_eq!(h.router.pending_validations(), 0);
    assert_eq!(h.router.membership(&cid(9)), Membership::Session);
}

/// A rejected id is answered from time-wait and never validated again.
#[test]
fn test_rejection_moves_to_time_wait() {
    let (validator, calls) = counting_validator(Verdict::reject("bad proof"));
    let mut h = Harness::new(RouterConfig::default(), validator);

    assert_eq!(h.receive(hello_initial(3)), DispatchOutcome::Rejected);
    assert_eq!(calls.get(), 1);
    assert_eq!(h.wire.sent_count(), 1);
    let close = h.wire.last().unwrap();
    assert_eq!(
        h.router.time_wait().action(&cid(3)),
        Some(TimeWaitAction::SendTerminationPackets)
    );

    assert_eq!(
        h.receive(hello_initial(3)),
        DispatchOutcome::TimeWait { responded: true }
    );
    assert_eq!(calls.get(), 1);
    assert!(h.log.created.borrow().is_empty());
    assert_eq!(h.wire.last().unwrap(), close);
}

/// An idle buffered id is evicted into a silent time-wait entry.
#[test]
fn test_idle_entry_expires_to_drop() {
    let mut h = Harness::accept_all();
    assert_eq!(h.receive(zero_rtt(5, 1)), DispatchOutcome::Buffered);

    h.router
        .on_expiry_tick(Instant::now() + Duration::from_secs(6));
    assert_eq!(h.router.buffered_count(), 0);
    assert_eq!(h.router.membership(&cid(5)), Membership::TimeWait);
    assert_eq!(h.router.time_wait().action(&cid(5)), Some(TimeWaitAction::Drop));

    let sent_before = h.wire.sent_count();
    assert_eq!(
        h.receive(zero_rtt(5, 2)),
        DispatchOutcome::TimeWait { responded: false }
    );
    assert_eq!(
        h.receive(hello_initial(5)),
        DispatchOutcome::TimeWait { responded: false }
    );
    assert_eq!(h.wire.sent_count(), sent_before);
}

/// Closed sessions answer later datagrams with their termination packets.
#[test]
fn test_session_close_then_time_wait() {
    let mut h = Harness::new(RouterConfig::default(), Box::new(AcceptAll));
    assert_eq!(h.receive(hello_initial(11)), DispatchOutcome::SessionCreated);

    h.log.notifier(11).closed();
    assert_eq!(h.router.process_events(Instant::now()), 1);
    assert_eq!(h.router.membership(&cid(11)), Membership::TimeWait);
    assert_eq!(h.router.session_count(), 0);

    assert_eq!(
        h.receive(short_header(11, 64)),
        DispatchOutcome::TimeWait { responded: true }
    );
    assert_eq!(h.wire.last().unwrap().as_ref(), b"connection close");
}

/// Garbage never creates state.
#[test]
fn test_garbage_creates_no_state() {
    let mut h = Harness::accept_all();
    let outcome = h.receive(bytes::Bytes::from_static(&[0xff, 0x00, 0x01]));
    assert!(matches!(outcome, DispatchOutcome::Dropped(DropReason::Unparseable)));
    assert_eq!(h.router.buffered_count(), 0);
    assert_eq!(h.router.session_count(), 0);
    assert_eq!(h.router.time_wait_count(), 0);
}

/// A client opening with a 16-byte id keeps its connection after the
/// handshake, when it switches to the server's 8-byte id.
#[test]
fn test_long_original_id_survives_handshake() {
    let mut h = Harness::accept_all();
    let original = quic_dispatcher::ConnectionId::from_slice(&[0x3c; 16]);
    let hello = hello_initial_for(original.as_bytes());

    assert_eq!(h.receive(hello.clone()), DispatchOutcome::SessionCreated);
    let server_id = h.log.server_id(&original);
    assert_eq!(server_id.len(), 8);

    for len in [60, 1200, 40] {
        assert_eq!(
            h.receive(short_header_for(&server_id, len)),
            DispatchOutcome::Delivered
        );
    }
    assert_eq!(h.wire.sent_count(), 0);
    assert_eq!(h.log.delivered.borrow()[&original].len(), 4);

    h.router.shutdown();
    assert_eq!(h.router.membership(&original), Membership::TimeWait);
    assert_eq!(h.router.membership(&server_id), Membership::TimeWait);
    assert_eq!(
        h.receive(short_header_for(&server_id, 60)),
        DispatchOutcome::TimeWait { responded: true }
    );
    assert_eq!(h.wire.last().unwrap().as_ref(), b"connection close");
}
