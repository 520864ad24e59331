//! UDP event loop driving a [`Router`]
//!
//! The router itself is synchronous; this module owns the socket and feeds
//! it events:
//!
//! ```text
//!   recv_from ─────────▶ Router::on_datagram
//!   events.notified() ─▶ Router::process_events      (validation completions,
//!                                                     session notifications)
//!   maintenance tick ──▶ Router::on_expiry_tick
//!                        Router::process_buffered_connections
//!   socket writable ───▶ Router::on_can_write        (only while blocked)
//!   shutdown ──────────▶ Router::shutdown, loop exits
//! ```
//!
//! Sessions and validation futures are not `Send`, so the loop runs on a
//! current-thread runtime.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::dispatcher::{
    DispatchOutcome, PacketWriter, ProofValidator, Router, SessionFactory, WriteResult,
};
use crate::error::DispatchError;
use crate::packet::ReceivedDatagram;

/// [`PacketWriter`] over a non-blocking tokio UDP socket.
#[derive(Debug)]
pub struct UdpSocketWriter {
    socket: Arc<UdpSocket>,
    blocked: bool,
}

impl UdpSocketWriter {
    /// Wrap a bound socket.
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            blocked: false,
        }
    }
}

impl PacketWriter for UdpSocketWriter {
    fn write_packet(
        &mut self,
        buf: &[u8],
        _self_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> WriteResult {
        if self.blocked {
            return WriteResult::Blocked;
        }
        match self.socket.try_send_to(buf, peer_addr) {
            Ok(n) => WriteResult::Written(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.blocked = true;
                WriteResult::Blocked
            }
            Err(e) => WriteResult::Error(e),
        }
    }

    fn is_write_blocked(&self) -> bool {
        self.blocked
    }

    fn set_writable(&mut self) {
        self.blocked = false;
    }
}

/// Stops a running [`DispatchServer`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Ask the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// A bound UDP socket plus the router that handles its datagrams.
#[derive(Debug)]
pub struct DispatchServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    router: Router,
    max_datagram_size: usize,
    maintenance_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl DispatchServer {
    /// Bind the configured listen address and build the router.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset secret is invalid or binding fails.
    pub async fn bind(
        config: &DispatcherConfig,
        validator: Box<dyn ProofValidator>,
        factory: Box<dyn SessionFactory>,
    ) -> Result<Self, DispatchError> {
        let reset_tokens = config.reset_token_generator()?;
        let socket = Arc::new(UdpSocket::bind(config.listen.address).await?);
        let local_addr = socket.local_addr()?;
        // try_send_to reports WouldBlock until the reactor has seen the
        // socket writable once
        socket.writable().await?;

        let router = Router::new(
            config.router_config(),
            validator,
            factory,
            Box::new(UdpSocketWriter::new(Arc::clone(&socket))),
            reset_tokens,
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        info!("Dispatcher listening on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            router,
            max_datagram_size: config.listen.max_datagram_size,
            maintenance_interval: config.dispatch.maintenance_interval(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The router.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The router, mutably (e.g. to stop accepting before running).
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Handle that stops [`run`](Self::run).
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until a shutdown is requested.
    ///
    /// Returns the router after it has been shut down so that callers can
    /// inspect its final state.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; receive errors are logged and the
    /// loop continues.
    pub async fn run(self) -> Result<Router, DispatchError> {
        let Self {
            socket,
            local_addr,
            mut router,
            max_datagram_size,
            maintenance_interval,
            mut shutdown_rx,
            ..
        } = self;

        let events = router.events();
        let drive_limit = router.config().max_sessions_per_drive;
        let mut tick = time::interval(maintenance_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; max_datagram_size];

        loop {
            let wants_write = router.is_write_blocked() || router.has_write_blocked_sessions();

            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, peer_addr)) => {
                        let datagram = ReceivedDatagram::new(
                            local_addr,
                            peer_addr,
                            Instant::now(),
                            Bytes::copy_from_slice(&buf[..n]),
                        );
                        let outcome = router.on_datagram(datagram);
                        trace!("{} bytes from {}: {:?}", n, peer_addr, outcome);
                        if let DispatchOutcome::Dropped(reason) = outcome {
                            debug!("Dropped datagram from {}: {}", peer_addr, reason);
                        }
                    }
                    // ICMP errors from earlier sends surface here on some platforms
                    Err(e) => warn!("UDP recv error on {}: {}", local_addr, e),
                },
                () = events.notified() => {
                    router.process_events(Instant::now());
                }
                _ = tick.tick() => {
                    router.on_expiry_tick(Instant::now());
                    router.process_buffered_connections(drive_limit);
                }
                result = socket.writable(), if wants_write => match result {
                    Ok(()) => {
                        let serviced = router.on_can_write();
                        trace!("Serviced {} write-blocked sessions", serviced);
                    }
                    Err(e) => warn!("UDP writable error on {}: {}", local_addr, e),
                },
                _ = shutdown_rx.recv() => {
                    info!("Dispatcher shutdown signal received");
                    router.shutdown();
                    let snapshot = router.stats().snapshot();
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => info!("Final stats: {}", json),
                        Err(e) => warn!("Failed to serialize stats: {}", e),
                    }
                    return Ok(router);
                }
            }

            if router.has_ready_handshakes() {
                router.process_buffered_connections(drive_limit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_sends_datagram() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        server.writable().await.unwrap();
        let mut writer = UdpSocketWriter::new(Arc::clone(&server));

        let result = writer.write_packet(
            b"hello",
            server.local_addr().unwrap(),
            client.local_addr().unwrap(),
        );
        assert!(matches!(result, WriteResult::Written(5)));
        assert!(!writer.is_write_blocked());

        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, server.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bound_server_writes_immediately() {
        let mut config = DispatcherConfig::default();
        config.listen.address = "127.0.0.1:0".parse().unwrap();
        let server = DispatchServer::bind(
            &config,
            Box::new(crate::dispatcher::AcceptAll),
            Box::new(NoSessions),
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut writer = UdpSocketWriter::new(Arc::clone(&server.socket));
        assert!(matches!(
            writer.write_packet(b"ready", server.local_addr(), client.local_addr().unwrap()),
            WriteResult::Written(5)
        ));
    }

    struct NoSessions;

    impl SessionFactory for NoSessions {
        fn create(
            &mut self,
            _context: crate::dispatcher::SessionContext,
        ) -> Result<Box<dyn crate::dispatcher::Session>, crate::error::SessionError> {
            Err(crate::error::SessionError::create_failed("unused"))
        }
    }

    #[tokio::test]
    async fn test_blocked_writer_refuses_until_writable() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = socket.local_addr().unwrap();
        socket.writable().await.unwrap();
        let mut writer = UdpSocketWriter::new(socket);
        writer.blocked = true;

        assert!(matches!(
            writer.write_packet(b"x", peer, peer),
            WriteResult::Blocked
        ));
        writer.set_writable();
        assert!(matches!(
            writer.write_packet(b"x", peer, peer),
            WriteResult::Written(1)
        ));
    }
}
