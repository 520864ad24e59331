//! Admission control: buffered store caps, the accept toggle and the
//! per-drive session allowance.

use std::time::Duration;

use quic_dispatcher::dispatcher::{
    AcceptAll, BufferedStoreConfig, DispatchOutcome, DropReason, Membership, RouterConfig,
};

use super::common::*;

fn small_store(max_connections: usize, without_handshake: usize, per_id: usize) -> RouterConfig {
    RouterConfig {
        buffer: BufferedStoreConfig {
            max_connections,
            max_connections_without_handshake: without_handshake,
            max_packets_per_connection: per_id,
            idle_timeout: Duration::from_secs(5),
        },
        ..RouterConfig::default()
    }
}

#[test]
fn test_global_and_per_id_caps() {
    let mut h = Harness::new(small_store(3, 3, 2), Box::new(AcceptAll));

    for id in 1..=5u64 {
        for tag in 0..3u8 {
            let outcome = h.receive(zero_rtt(id, tag));
            let expected = if id <= 3 && tag < 2 {
                DispatchOutcome::Buffered
            } else {
                DispatchOutcome::Dropped(DropReason::BufferFull)
            };
            assert_eq!(outcome, expected, "id {id} packet {tag}");
        }
    }

    assert_eq!(h.router.buffered_count(), 3);
    for id in 1..=3u64 {
        let entry = h.router.store().entry(&cid(id)).unwrap();
        let kept: Vec<_> = entry.packets().map(|d| d.payload.clone()).collect();
        assert_eq!(kept, vec![zero_rtt(id, 0), zero_rtt(id, 1)]);
    }
    assert_eq!(h.router.membership(&cid(4)), Membership::None);
    assert_eq!(h.router.stats().snapshot().dropped.buffer_full, 9);
}

#[test]
fn test_handshakes_bypass_without_handshake_cap() {
    let validator = ManualValidator::default();
    let mut h = Harness::new(small_store(10, 2, 4), validator.boxed());

    assert_eq!(h.receive(zero_rtt(1, 0)), DispatchOutcome::Buffered);
    assert_eq!(h.receive(zero_rtt(2, 0)), DispatchOutcome::Buffered);
    assert_eq!(
        h.receive(zero_rtt(3, 0)),
        DispatchOutcome::Dropped(DropReason::BufferFull)
    );

    assert_eq!(h.receive(hello_initial(4)), DispatchOutcome::ValidationPending);
    assert_eq!(h.router.store().without_handshake_count(), 2);
    assert_eq!(h.router.buffered_count(), 3);
}

#[test]
fn test_duplicate_handshake_while_validating() {
    let validator = ManualValidator::default();
    let mut h = Harness::new(RouterConfig::default(), validator.boxed());

    assert_eq!(h.receive(hello_initial(8)), DispatchOutcome::ValidationPending);
    assert_eq!(
        h.receive(hello_initial(8)),
        DispatchOutcome::Dropped(DropReason::DuplicateHandshake)
    );
    assert_eq!(validator.calls(), 1);
    assert_eq!(h.router.store().entry(&cid(8)).unwrap().len(), 0);
}

#[test]
fn test_stop_and_start_accepting() {
    let mut h = Harness::accept_all();
    assert_eq!(h.receive(zero_rtt(1, 0)), DispatchOutcome::Buffered);

    h.router.stop_accepting_new_connections();
    assert!(!h.router.is_accepting());
    assert_eq!(h.router.buffered_count(), 0);

    assert_eq!(h.receive(hello_initial(2)), DispatchOutcome::Rejected);
    assert_eq!(h.wire.sent_count(), 1);
    assert_eq!(h.router.membership(&cid(2)), Membership::TimeWait);
    assert_eq!(
        h.receive(zero_rtt(3, 0)),
        DispatchOutcome::Dropped(DropReason::NotAccepting)
    );

    h.router.start_accepting_new_connections();
    assert_eq!(h.receive(hello_initial(4)), DispatchOutcome::SessionCreated);
}

#[test]
fn test_allowance_parks_then_drives_in_order() {
    let config = RouterConfig {
        max_sessions_per_drive: 2,
        ..RouterConfig::default()
    };
    let mut h = Harness::new(config, Box::new(AcceptAll));

    assert_eq!(h.receive(hello_initial(1)), DispatchOutcome::SessionCreated);
    assert_eq!(h.receive(hello_initial(2)), DispatchOutcome::SessionCreated);
    assert_eq!(h.receive(hello_initial(3)), DispatchOutcome::Buffered);
    assert_eq!(h.receive(hello_initial(4)), DispatchOutcome::Buffered);

    let parked_follower = zero_rtt(3, 0x33);
    assert_eq!(h.receive(parked_follower.clone()), DispatchOutcome::Buffered);
    assert!(h.router.has_ready_handshakes());

    assert_eq!(h.router.process_buffered_connections(1), 1);
    assert_eq!(h.log.created.borrow().as_slice(), &[cid(1), cid(2), cid(3)]);
    assert_eq!(h.log.delivered_to(3), vec![hello_initial(3), parked_follower]);

    assert_eq!(h.router.process_buffered_connections(4), 1);
    assert!(!h.router.has_ready_handshakes());
    assert_eq!(h.router.session_count(), 4);
}

#[test]
fn test_small_initial_dropped() {
    let mut h = Harness::accept_all();
    let payload = initial_padded(6, 0, &client_hello("example.com", &["h3"]), 900);
    assert!(payload.len() < 1200);
    assert_eq!(
        h.receive(payload),
        DispatchOutcome::Dropped(DropReason::TooSmall)
    );
    assert_eq!(h.router.membership(&cid(6)), Membership::None);
}
