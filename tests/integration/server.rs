//! The tokio event loop over a real loopback socket.

use std::rc::Rc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use quic_dispatcher::config::DispatcherConfig;
use quic_dispatcher::dispatcher::{AcceptAll, Membership};
use quic_dispatcher::server::DispatchServer;

use super::common::*;

fn loopback_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.listen.address = "127.0.0.1:0".parse().unwrap();
    config.dispatch.maintenance_interval_ms = 10;
    config
}

fn unknown_version_packet(id: u64) -> Vec<u8> {
    let mut packet = vec![0xc0];
    packet.extend_from_slice(&0x1a2a_3a4a_u32.to_be_bytes());
    packet.push(8);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.push(0);
    packet.resize(1200, 0);
    packet
}

#[tokio::test]
async fn test_server_answers_and_admits() {
    let log = Rc::new(SessionLog::default());
    let server = DispatchServer::bind(
        &loopback_config(),
        Box::new(AcceptAll),
        Box::new(RecordingFactory(Rc::clone(&log))),
    )
    .await
    .unwrap();
    let server_addr = server.local_addr();
    let shutdown = server.shutdown_handle();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let client_side = async {
        client
            .send_to(&unknown_version_packet(1), server_addr)
            .await
            .unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("version negotiation should arrive")
            .unwrap();
        assert_eq!(from, server_addr);
        assert_eq!(buf[0] & 0x80, 0x80);
        assert_eq!(&buf[1..5], &[0, 0, 0, 0]);
        assert!(n > 7);

        client
            .send_to(&hello_initial(77), server_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.shutdown();
    };

    let (router, ()) = tokio::join!(server.run(), client_side);
    let router = router.unwrap();

    assert_eq!(log.created.borrow().as_slice(), &[cid(77)]);
    assert_eq!(log.closed.borrow().as_slice(), &[cid(77)]);
    assert_eq!(router.session_count(), 0);
    assert_eq!(router.membership(&cid(77)), Membership::TimeWait);
    assert!(!router.is_accepting());
    assert_eq!(router.stats().snapshot().version_negotiations, 1);
}

#[tokio::test]
async fn test_shutdown_before_traffic() {
    let server = DispatchServer::bind(
        &loopback_config(),
        Box::new(AcceptAll),
        Box::new(RecordingFactory(Rc::new(SessionLog::default()))),
    )
    .await
    .unwrap();
    server.shutdown_handle().shutdown();

    let router = timeout(Duration::from_secs(2), server.run())
        .await
        .expect("server should stop")
        .unwrap();
    assert_eq!(router.session_count(), 0);
    assert_eq!(router.stats().packets_received(), 0);
}
