//! Time-wait behaviour: response back-off, capacity, retention and
//! stateless resets for unknown ids.

use std::time::{Duration, Instant};

use quic_dispatcher::crypto::{ResetTokenGenerator, RESET_TOKEN_LEN};
use quic_dispatcher::dispatcher::{
    DispatchOutcome, DropReason, Membership, RouterConfig, TimeWaitConfig, Verdict,
};

use super::common::*;

fn rejecting(config: RouterConfig) -> (Harness, std::rc::Rc<std::cell::Cell<usize>>) {
    let (validator, calls) = counting_validator(Verdict::reject("denied"));
    (Harness::new(config, validator), calls)
}

#[test]
fn test_response_backoff() {
    let (mut h, _) = rejecting(RouterConfig::default());
    assert_eq!(h.receive(hello_initial(3)), DispatchOutcome::Rejected);

    let responded: Vec<bool> = (1..=9)
        .map(|tag| match h.receive(zero_rtt(3, tag)) {
            DispatchOutcome::TimeWait { responded } => responded,
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    assert_eq!(
        responded,
        vec![true, true, false, true, false, false, false, true, false]
    );
}

#[test]
fn test_response_budget_exhausted() {
    let config = RouterConfig {
        time_wait: TimeWaitConfig {
            response_budget: 2,
            ..TimeWaitConfig::default()
        },
        ..RouterConfig::default()
    };
    let (mut h, _) = rejecting(config);
    assert_eq!(h.receive(hello_initial(3)), DispatchOutcome::Rejected);

    let mut responses = 0;
    for tag in 0..16 {
        if h.receive(zero_rtt(3, tag)) == (DispatchOutcome::TimeWait { responded: true }) {
            responses += 1;
        }
    }
    assert_eq!(responses, 2);
}

#[test]
fn test_capacity_evicts_oldest() {
    let config = RouterConfig {
        time_wait: TimeWaitConfig {
            max_entries: 2,
            ..TimeWaitConfig::default()
        },
        ..RouterConfig::default()
    };
    let (mut h, _) = rejecting(config);
    for id in 1..=3 {
        assert_eq!(h.receive(hello_initial(id)), DispatchOutcome::Rejected);
    }

    assert_eq!(h.router.time_wait_count(), 2);
    assert_eq!(h.router.membership(&cid(1)), Membership::None);
    assert_eq!(h.router.membership(&cid(2)), Membership::TimeWait);
    assert_eq!(h.router.membership(&cid(3)), Membership::TimeWait);
}

#[test]
fn test_retention_expiry_allows_new_attempt() {
    let (mut h, calls) = rejecting(RouterConfig::default());
    assert_eq!(h.receive(hello_initial(1)), DispatchOutcome::Rejected);

    h.router
        .on_expiry_tick(Instant::now() + Duration::from_secs(100));
    assert_eq!(h.router.membership(&cid(1)), Membership::TimeWait);

    h.router
        .on_expiry_tick(Instant::now() + Duration::from_secs(201));
    assert_eq!(h.router.membership(&cid(1)), Membership::None);

    assert_eq!(h.receive(hello_initial(1)), DispatchOutcome::Rejected);
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_unknown_short_header_reset() {
    let mut h = Harness::accept_all();

    assert_eq!(h.receive(short_header(42, 64)), DispatchOutcome::StatelessReset);
    let reset = h.wire.last().unwrap();
    assert!(reset.len() < 64);
    assert_eq!(reset[0] & 0xc0, 0x40);

    let token = ResetTokenGenerator::new(b"integration".to_vec()).token(&cid(42));
    assert_eq!(&reset[reset.len() - RESET_TOKEN_LEN..], &token);
    assert_eq!(h.router.membership(&cid(42)), Membership::None);

    assert_eq!(
        h.receive(short_header(42, 21)),
        DispatchOutcome::Dropped(DropReason::UnknownConnection)
    );
}

#[test]
fn test_unknown_short_headers_reset_once_per_peer() {
    let mut h = Harness::accept_all();
    let now = Instant::now();

    let mut resets = 0;
    for id in 0..50 {
        match h.router.on_datagram(datagram(short_header(500 + id, 64), now)) {
            DispatchOutcome::StatelessReset => resets += 1,
            DispatchOutcome::Dropped(DropReason::ResetLimited) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(resets, 1);
    assert_eq!(h.wire.sent_count(), 1);

    assert_eq!(
        h.router
            .on_datagram(datagram_from(short_header(600, 64), "192.0.2.55:443", now)),
        DispatchOutcome::StatelessReset
    );

    h.router.on_expiry_tick(now + Duration::from_secs(1));
    assert_eq!(
        h.router.on_datagram(datagram(short_header(500, 64), now + Duration::from_secs(1))),
        DispatchOutcome::StatelessReset
    );
}
