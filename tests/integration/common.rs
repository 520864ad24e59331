//! Shared fixtures: packet builders, a recording writer, a recording
//! session factory and a validator whose verdicts are resolved by hand.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use bytes::{BufMut, Bytes};
use futures::channel::oneshot;
use futures::FutureExt;

use quic_dispatcher::crypto::{seal_initial, InitialKeys, InitialPacket, ResetTokenGenerator, Side};
use quic_dispatcher::dispatcher::{
    AcceptAll, PacketWriter, ProofValidator, Router, RouterConfig, Session, SessionContext,
    SessionFactory, SessionNotifier, ValidationRequest, Verdict, WriteResult, WriteStatus,
};
use quic_dispatcher::error::SessionError;
use quic_dispatcher::packet::{varint, ConnectionId, QuicVersion, ReceivedDatagram};

pub const SERVER: &str = "198.51.100.1:443";
pub const CLIENT: &str = "192.0.2.1:50000";

// ============================================================================
// Packet builders
// ============================================================================

/// Encode a TLS 1.3 `ClientHello` offering `server_name` and `alpn`.
#[allow(clippy::cast_possible_truncation)]
pub fn client_hello(server_name: &str, alpn: &[&str]) -> Vec<u8> {
    let mut extensions = Vec::new();

    // server_name
    extensions.put_u16(0);
    extensions.put_u16(server_name.len() as u16 + 5);
    extensions.put_u16(server_name.len() as u16 + 3);
    extensions.put_u8(0);
    extensions.put_u16(server_name.len() as u16);
    extensions.extend_from_slice(server_name.as_bytes());

    if !alpn.is_empty() {
        let mut list = Vec::new();
        for proto in alpn {
            list.put_u8(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        extensions.put_u16(16);
        extensions.put_u16(list.len() as u16 + 2);
        extensions.put_u16(list.len() as u16);
        extensions.extend_from_slice(&list);
    }

    let mut body = Vec::new();
    body.put_u16(0x0303);
    body.extend_from_slice(&[0x42; 32]);
    body.put_u8(0);
    body.put_u16(2);
    body.put_u16(0x1301);
    body.put_u8(1);
    body.put_u8(0);
    body.put_u16(extensions.len() as u16);
    body.extend_from_slice(&extensions);

    let mut msg = vec![0x01];
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);
    msg
}

/// Client Initial for `id` carrying `crypto` at `offset`, padded to 1200 bytes.
pub fn initial(id: u64, offset: u64, crypto: &[u8]) -> Bytes {
    initial_padded(id, offset, crypto, 1200)
}

/// Client Initial whose frames are padded to `frames_len` bytes.
pub fn initial_padded(id: u64, offset: u64, crypto: &[u8], frames_len: usize) -> Bytes {
    initial_with_dcid(&id.to_be_bytes(), offset, crypto, frames_len)
}

/// Client Initial carrying a complete `ClientHello` to destination `dcid`.
pub fn hello_initial_for(dcid: &[u8]) -> Bytes {
    initial_with_dcid(dcid, 0, &client_hello("example.com", &["h3"]), 1200)
}

fn initial_with_dcid(dcid: &[u8], offset: u64, crypto: &[u8], frames_len: usize) -> Bytes {
    let mut frames = Vec::new();
    frames.put_u8(0x06);
    varint::encode(offset, &mut frames);
    varint::encode(crypto.len() as u64, &mut frames);
    frames.extend_from_slice(crypto);
    if frames.len() < frames_len {
        frames.resize(frames_len, 0);
    }

    let keys = InitialKeys::derive(dcid, QuicVersion::V1, Side::Client).unwrap();
    let packet = seal_initial(
        &keys,
        &InitialPacket {
            version: QuicVersion::V1,
            dcid,
            scid: &[0xcc; 8],
            token: &[],
            packet_number: 0,
        },
        &frames,
    )
    .unwrap();
    Bytes::from(packet)
}

/// Client Initial for `id` carrying a complete `ClientHello`.
pub fn hello_initial(id: u64) -> Bytes {
    initial(id, 0, &client_hello("example.com", &["h3"]))
}

/// 0-RTT packet for `id`; `tag` fills the payload so packets are distinguishable.
pub fn zero_rtt(id: u64, tag: u8) -> Bytes {
    let mut packet = vec![0xd0];
    packet.extend_from_slice(&1u32.to_be_bytes());
    packet.push(8);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.push(0);
    packet.extend_from_slice(&[tag; 60]);
    Bytes::from(packet)
}

/// Short-header packet for `id` of `len` bytes.
pub fn short_header(id: u64, len: usize) -> Bytes {
    short_header_for(&cid(id), len)
}

/// Short-header packet for an arbitrary destination id.
pub fn short_header_for(id: &ConnectionId, len: usize) -> Bytes {
    let mut packet = vec![0x40];
    packet.extend_from_slice(id.as_bytes());
    packet.resize(len, 0x5a);
    Bytes::from(packet)
}

pub fn datagram_from(payload: impl Into<Bytes>, peer: &str, at: Instant) -> ReceivedDatagram {
    ReceivedDatagram::new(SERVER.parse().unwrap(), peer.parse().unwrap(), at, payload)
}

pub fn datagram(payload: impl Into<Bytes>, at: Instant) -> ReceivedDatagram {
    ReceivedDatagram::new(
        SERVER.parse().unwrap(),
        CLIENT.parse().unwrap(),
        at,
        payload,
    )
}

pub fn cid(id: u64) -> ConnectionId {
    ConnectionId::from_u64(id)
}

// ============================================================================
// Recording writer
// ============================================================================

#[derive(Default)]
pub struct Wire {
    pub sent: RefCell<Vec<(Bytes, SocketAddr)>>,
    pub blocked: Cell<bool>,
}

impl Wire {
    pub fn sent_count(&self) -> usize {
        self.sent.borrow().len()
    }

    pub fn last(&self) -> Option<Bytes> {
        self.sent.borrow().last().map(|(packet, _)| packet.clone())
    }
}

pub struct RecordingWriter(pub Rc<Wire>);

impl PacketWriter for RecordingWriter {
    fn write_packet(&mut self, buf: &[u8], _: SocketAddr, peer_addr: SocketAddr) -> WriteResult {
        if self.0.blocked.get() {
            return WriteResult::Blocked;
        }
        self.0
            .sent
            .borrow_mut()
            .push((Bytes::copy_from_slice(buf), peer_addr));
        WriteResult::Written(buf.len())
    }

    fn is_write_blocked(&self) -> bool {
        self.0.blocked.get()
    }

    fn set_writable(&mut self) {
        self.0.blocked.set(false);
    }
}

// ============================================================================
// Recording sessions
// ============================================================================

#[derive(Default)]
pub struct SessionLog {
    pub created: RefCell<Vec<ConnectionId>>,
    pub delivered: RefCell<HashMap<ConnectionId, Vec<Bytes>>>,
    pub notifiers: RefCell<HashMap<ConnectionId, SessionNotifier>>,
    pub server_ids: RefCell<HashMap<ConnectionId, ConnectionId>>,
    pub writable: RefCell<Vec<ConnectionId>>,
    pub closed: RefCell<Vec<ConnectionId>>,
    pub stay_blocked: Cell<bool>,
}

impl SessionLog {
    pub fn delivered_to(&self, id: u64) -> Vec<Bytes> {
        self.delivered
            .borrow()
            .get(&cid(id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn notifier(&self, id: u64) -> SessionNotifier {
        self.notifiers.borrow()[&cid(id)].clone()
    }

    /// Server id handed to the session whose original id is `original`.
    pub fn server_id(&self, original: &ConnectionId) -> ConnectionId {
        self.server_ids.borrow()[original].clone()
    }
}

pub struct RecordingSession {
    id: ConnectionId,
    log: Rc<SessionLog>,
}

impl Session for RecordingSession {
    fn deliver(&mut self, datagram: ReceivedDatagram) {
        self.log
            .delivered
            .borrow_mut()
            .entry(self.id.clone())
            .or_default()
            .push(datagram.payload);
    }

    fn on_writable(&mut self) -> WriteStatus {
        self.log.writable.borrow_mut().push(self.id.clone());
        if self.log.stay_blocked.get() {
            WriteStatus::Blocked
        } else {
            WriteStatus::Done
        }
    }

    fn is_closing(&self) -> bool {
        false
    }

    fn close(&mut self) {
        self.log.closed.borrow_mut().push(self.id.clone());
    }

    fn take_termination_datagrams(&mut self) -> Vec<Bytes> {
        vec![Bytes::from_static(b"connection close")]
    }
}

pub struct RecordingFactory(pub Rc<SessionLog>);

impl SessionFactory for RecordingFactory {
    fn create(&mut self, context: SessionContext) -> Result<Box<dyn Session>, SessionError> {
        self.0
            .created
            .borrow_mut()
            .push(context.connection_id.clone());
        self.0
            .notifiers
            .borrow_mut()
            .insert(context.connection_id.clone(), context.notifier.clone());
        self.0.server_ids.borrow_mut().insert(
            context.connection_id.clone(),
            context.server_connection_id.clone(),
        );
        Ok(Box::new(RecordingSession {
            id: context.connection_id,
            log: Rc::clone(&self.0),
        }))
    }
}

// ============================================================================
// Validators
// ============================================================================

/// Validator whose verdicts are delivered later through `resolve`.
#[derive(Clone, Default)]
pub struct ManualValidator {
    requests: Rc<RefCell<Vec<(ConnectionId, oneshot::Sender<Verdict>)>>>,
    calls: Rc<Cell<usize>>,
}

impl ManualValidator {
    pub fn boxed(&self) -> Box<dyn ProofValidator> {
        let requests = Rc::clone(&self.requests);
        let calls = Rc::clone(&self.calls);
        Box::new(move |request: ValidationRequest| {
            calls.set(calls.get() + 1);
            let (tx, rx) = oneshot::channel();
            requests.borrow_mut().push((request.connection_id, tx));
            rx.map(|verdict| verdict.unwrap_or_else(|_| Verdict::reject("cancelled")))
                .boxed_local()
        })
    }

    /// Resolve the pending validation for `id`.
    pub fn resolve(&self, id: u64, verdict: Verdict) {
        let mut requests = self.requests.borrow_mut();
        let index = requests
            .iter()
            .position(|(pending, _)| *pending == cid(id))
            .expect("no pending validation for id");
        let (_, tx) = requests.remove(index);
        let _ = tx.send(verdict);
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

/// Validator that counts calls and answers synchronously.
pub fn counting_validator(verdict: Verdict) -> (Box<dyn ProofValidator>, Rc<Cell<usize>>) {
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let validator = move |_request: ValidationRequest| {
        counter.set(counter.get() + 1);
        futures::future::ready(verdict.clone()).boxed_local()
    };
    (Box::new(validator), calls)
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub router: Router,
    pub wire: Rc<Wire>,
    pub log: Rc<SessionLog>,
    pub start: Instant,
}

impl Harness {
    pub fn new(config: RouterConfig, validator: Box<dyn ProofValidator>) -> Self {
        let wire = Rc::new(Wire::default());
        let log = Rc::new(SessionLog::default());
        let router = Router::new(
            config,
            validator,
            Box::new(RecordingFactory(Rc::clone(&log))),
            Box::new(RecordingWriter(Rc::clone(&wire))),
            ResetTokenGenerator::new(b"integration".to_vec()),
        );
        Self {
            router,
            wire,
            log,
            start: Instant::now(),
        }
    }

    pub fn accept_all() -> Self {
        Self::new(RouterConfig::default(), Box::new(AcceptAll))
    }

    pub fn receive(&mut self, payload: Bytes) -> quic_dispatcher::DispatchOutcome {
        self.router.on_datagram(datagram(payload, Instant::now()))
    }
}
