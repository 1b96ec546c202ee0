//! The connection object. A connection is shared between the caller
//! threads and the reactor: creation-time fields are read lock-free, the
//! status and fault are atomics/latches, and everything the reactor
//! mutates lives behind the inner mutex. User callbacks are never invoked
//! while that mutex is held.

use crate::buffer::{BufferPool, PacketBuffer};
use crate::error::{ConnResult, ErrorKind, Fault, NetError, NetResult};
use crate::frame;
use crate::handshake::{Phase, Session};
use crate::mainloop;
use crate::mainloop::Request;
use crate::registry;
use ion::choose;
use ion::event::Event;
use ion::identity::ClientKeys;
use ion::logging;
use ion::logging::Logger;
use mio::net::TcpStream;
use prost::Message;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type ConnectionId = u32;

/// How long `destroy` waits for the reactor to acknowledge the close
/// before falling back to tearing the stream down itself.
const DESTROY_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Grid,
    Peer,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Status {
    Closed = 0,
    Connecting = 1,
    Forwarding = 2,
    Handshaking = 3,
    Connected = 4,
    Error = 5,
}

impl Status {
    #[inline]
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::Closed,
            1 => Status::Connecting,
            2 => Status::Forwarding,
            3 => Status::Handshaking,
            4 => Status::Connected,
            5 => Status::Error,
            _ => unreachable!(),
        }
    }
}

/// A server to try connecting to, in the caller-listed order.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[inline]
    pub fn new<H: Into<String>>(host: H, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

pub type DataHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Everything the reactor drives for one connection: the protocol state
/// machine, the receive buffer and the staging pool.
pub(crate) struct Link {
    pub mode: Mode,
    pub phase: Phase,
    pub session: Session,
    pub recv: PacketBuffer,
    pub pool: BufferPool,
    pub tunnel_id: Option<Vec<u8>>,
    pub buffer_size: usize,
    pub log: Logger,
}

impl Link {
    pub(crate) fn new(keys: ClientKeys, buffer_size: usize, log: Logger) -> Link {
        Link {
            mode: Mode::Grid,
            phase: Phase::Idle,
            session: Session::new(keys),
            recv: PacketBuffer::new(buffer_size),
            pool: BufferPool::new(buffer_size),
            tunnel_id: None,
            buffer_size,
            log,
        }
    }

    /// Reads and dispatches one complete packet. `Wait` parks the cursor
    /// until the next readiness event.
    pub(crate) fn pump<S: Read + Write>(&mut self, stream: &mut S) -> NetResult<LinkEvent> {
        self.recv.read_packet(stream)?;

        if self.phase == Phase::Forwarding {
            self.handle_data_frame(stream)
        } else {
            self.handle_packet(stream)
        }
    }
}

/// Outcome of dispatching one packet, surfaced to the reactor.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum LinkEvent {
    None,
    Handshaking,
    Connected,
    Data(Vec<u8>),
}

pub(crate) struct Inner {
    pub stream: Option<TcpStream>,
    pub link: Link,
}

pub struct Connection {
    uid: ConnectionId,
    status: AtomicU8,
    fault: Mutex<Option<Fault>>,
    dying: AtomicBool,
    ready: Event,
    handler: Mutex<Option<DataHandler>>,
    log: Logger,
    pub(crate) inner: Mutex<Inner>,
}

impl Connection {
    /// Creates a connection with the process keypair and a caller-sized
    /// packet buffer, and registers it. The buffer must fit the largest
    /// handshake packet.
    pub fn create(keys: ClientKeys, buffer_size: usize) -> ConnResult<Arc<Connection>> {
        if buffer_size < frame::MIN_BUFFER_SIZE || buffer_size > u16::max_value() as usize + 2 {
            return Err(Fault::new(ErrorKind::InvalidParameters));
        }

        let root = mainloop::logger();

        let conn = registry::register(|uid| {
            let log = root.new(logging::o!("uid" => uid));

            Arc::new(Connection {
                uid,
                status: AtomicU8::new(Status::Closed as u8),
                fault: Mutex::new(None),
                dying: AtomicBool::new(false),
                ready: Event::new(),
                handler: Mutex::new(None),
                log: log.clone(),
                inner: Mutex::new(Inner {
                    stream: None,
                    link: Link::new(keys.clone(), buffer_size, log),
                }),
            })
        });

        logging::debug!(conn.log, "connection created";
                        "context" => "create",
                        "buffer_size" => buffer_size);

        Ok(conn)
    }

    #[inline]
    pub fn uid(&self) -> ConnectionId {
        self.uid
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// The fault recorded when the connection failed, if any.
    #[inline]
    pub fn error(&self) -> Option<Fault> {
        *self.fault.lock().expect("Fault lock poisoned")
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.inner.lock().expect("Connection lock poisoned").link.mode
    }

    /// Switches the connection to peer mode. Only valid before `connect`.
    pub fn set_tunnel_id(&self, tunnel_id: &[u8]) -> ConnResult<()> {
        if self.status() != Status::Closed {
            return Err(Fault::new(ErrorKind::WrongState));
        }
        if tunnel_id.is_empty() {
            return Err(Fault::new(ErrorKind::InvalidParameters));
        }

        let mut inner = self.inner.lock().expect("Connection lock poisoned");
        inner.link.tunnel_id = Some(tunnel_id.to_vec());
        inner.link.mode = Mode::Peer;
        Ok(())
    }

    /// Installs the upper-layer handler for decrypted MESG payloads. The
    /// first payload byte is the data type.
    pub fn set_data_handler<F: Fn(&[u8]) + Send + Sync + 'static>(&self, handler: F) {
        *self.handler.lock().expect("Handler lock poisoned") = Some(Arc::new(handler));
    }

    /// Queues the connect request onto the reactor, which tries the
    /// endpoints in order at the TCP level. Completion is observed through
    /// `status` and `wait_ready`.
    pub fn connect(&self, endpoints: &[Endpoint]) -> ConnResult<()> {
        if endpoints.is_empty() {
            return Err(Fault::new(ErrorKind::InvalidParameters));
        }
        if self.status() != Status::Closed {
            return Err(Fault::new(ErrorKind::WrongState));
        }

        // The registry resolves us back to the shared handle the reactor
        // will hold on to.
        let conn = match registry::find(self.uid) {
            Some(conn) => conn,
            None => return Err(Fault::new(ErrorKind::WrongState)),
        };

        self.set_status(Status::Connecting);

        let result = mainloop::submit(Request::Connect {
            conn,
            endpoints: endpoints.to_vec(),
        });

        if result.is_err() {
            self.set_status(Status::Closed);
        }

        result
    }

    /// Blocks until the connection reaches `Connected` or `Error`.
    pub fn wait_ready(&self) -> ConnResult<()> {
        self.ready.wait();
        self.ready_result()
    }

    /// Like `wait_ready`, but gives up after the timeout.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> ConnResult<()> {
        if !self.ready.wait_timeout(timeout) {
            return Err(Fault::new(ErrorKind::System));
        }
        self.ready_result()
    }

    fn ready_result(&self) -> ConnResult<()> {
        match self.status() {
            Status::Connected => Ok(()),
            _ => Err(self.error().unwrap_or_else(|| Fault::new(ErrorKind::System))),
        }
    }

    /// Packs a protobuf message behind the data-type byte, encrypts it and
    /// transmits it inline. Only valid on a connected grid or peer link.
    pub fn send<M: Message>(&self, data_type: u8, message: &M) -> ConnResult<()> {
        if self.status() != Status::Connected {
            return Err(Fault::new(ErrorKind::WrongState));
        }

        let mut inner = self.inner.lock().expect("Connection lock poisoned");

        let result = {
            let Inner { stream, link } = &mut *inner;
            match stream.as_mut() {
                Some(stream) => link.send_mesg(stream, data_type, message),
                None => return Err(Fault::new(ErrorKind::WrongState)),
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(NetError::Wait) => Err(Fault::new(ErrorKind::System)),
            Err(NetError::Fatal(fault)) => {
                // Caller-side misuse never tears the connection down;
                // transport and crypto failures do.
                if fault.kind != ErrorKind::BufferExceeded {
                    inner.stream = None;
                    self.fail(fault);
                }
                Err(fault)
            }
        }
    }

    /// Queues the close onto the reactor.
    pub fn close(&self) {
        if mainloop::submit(Request::Close {
            uid: self.uid,
            ack: None,
        })
        .is_err()
        {
            self.detach();
        }
    }

    /// Closes the connection, waits until the reactor has let go of it,
    /// deregisters the uid and wipes all key material.
    pub fn destroy(&self) {
        self.dying.store(true, Ordering::Release);

        let ack = Arc::new(Event::new());
        let submitted = mainloop::submit(Request::Close {
            uid: self.uid,
            ack: Some(ack.clone()),
        });

        match submitted {
            Ok(()) => {
                if !ack.wait_timeout(DESTROY_ACK_TIMEOUT) {
                    self.detach();
                }
            }
            Err(_) => self.detach(),
        }

        registry::remove(self.uid);

        let mut inner = self.inner.lock().expect("Connection lock poisoned");
        inner.link.session.wipe();
        inner.link.tunnel_id = None;

        logging::debug!(self.log, "connection destroyed"; "context" => "destroy");
    }

    #[inline]
    pub(crate) fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn data_handler(&self) -> Option<DataHandler> {
        self.handler.lock().expect("Handler lock poisoned").clone()
    }

    /// Records a fault, transitions to the absorbing error state, drops
    /// the socket and releases waiters.
    pub(crate) fn fail(&self, fault: Fault) {
        {
            let mut slot = self.fault.lock().expect("Fault lock poisoned");
            if slot.is_none() {
                *slot = Some(fault);
            }
        }

        logging::debug!(self.log, "connection failed";
                        "context" => "fail",
                        "kind" => ?fault.kind,
                        "code" => fault.code);

        self.set_status(Status::Error);
    }

    /// Status transitions are monotone towards connected; error absorbs
    /// everything.
    pub(crate) fn set_status(&self, status: Status) {
        if self.status() == Status::Error {
            return;
        }

        self.status.store(status as u8, Ordering::Release);

        if status == Status::Connected || status == Status::Error {
            self.ready.signal();
        }
    }

    /// Hands the freshly connected stream to the link.
    pub(crate) fn attach(&self, stream: TcpStream) {
        let mut inner = self.inner.lock().expect("Connection lock poisoned");
        inner.stream = Some(stream);
    }

    /// Drops the socket and marks the connection closed (unless it already
    /// failed).
    pub(crate) fn detach(&self) {
        let mut inner = self.inner.lock().expect("Connection lock poisoned");
        inner.stream = None;

        if self.status() != Status::Error {
            self.status.store(Status::Closed as u8, Ordering::Release);
        }
    }

    /// Emits the first packet of the connection: FORWARD_REMOTE in peer
    /// mode, TELL in grid mode.
    pub(crate) fn start_link(&self) -> Result<(), Fault> {
        let mut inner = self.inner.lock().expect("Connection lock poisoned");

        let result = {
            let Inner { stream, link } = &mut *inner;
            let stream = stream.as_mut().expect("Stream must be attached before start");
            link.start(stream)
        };

        match result {
            Ok(forwarding) => {
                self.set_status(choose!(forwarding => Status::Forwarding, Status::Handshaking));
                Ok(())
            }
            Err(NetError::Wait) => Ok(()),
            Err(NetError::Fatal(fault)) => {
                inner.stream = None;
                self.fail(fault);
                Err(fault)
            }
        }
    }

    /// Drains the socket, feeding the state machine until it would block.
    /// Returns the decrypted payloads to hand to the upper layer once the
    /// lock is released.
    pub(crate) fn drive(&self) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        let mut inner = self.inner.lock().expect("Connection lock poisoned");

        loop {
            let result = {
                let Inner { stream, link } = &mut *inner;
                let stream = match stream.as_mut() {
                    Some(stream) => stream,
                    None => break,
                };
                link.pump(stream)
            };

            match result {
                Ok(LinkEvent::None) => (),
                Ok(LinkEvent::Handshaking) => self.set_status(Status::Handshaking),
                Ok(LinkEvent::Connected) => self.set_status(Status::Connected),
                Ok(LinkEvent::Data(data)) => delivered.push(data),
                Err(NetError::Wait) => break,
                Err(NetError::Fatal(fault)) => {
                    inner.stream = None;
                    if self.is_dying() {
                        self.set_status(Status::Closed);
                    } else {
                        self.fail(fault);
                    }
                    break;
                }
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::proto::ProtocolVersion;

    fn test_connection() -> Arc<Connection> {
        Connection::create(ClientKeys::generate(), 1536).unwrap()
    }

    #[test]
    fn test_create_rejects_small_buffer() {
        let result = Connection::create(ClientKeys::generate(), frame::MIN_BUFFER_SIZE - 1);
        assert_eq!(result.err().unwrap().kind, ErrorKind::InvalidParameters);
    }

    #[test]
    fn test_create_accepts_minimum_buffer() {
        let conn = Connection::create(ClientKeys::generate(), frame::MIN_BUFFER_SIZE).unwrap();
        assert_eq!(conn.status(), Status::Closed);
        conn.destroy();
    }

    #[test]
    fn test_tunnel_id_switches_mode() {
        let conn = test_connection();

        assert_eq!(conn.mode(), Mode::Grid);
        conn.set_tunnel_id(&[0xAA, 0xBB]).unwrap();
        assert_eq!(conn.mode(), Mode::Peer);

        conn.destroy();
    }

    #[test]
    fn test_tunnel_id_rejects_empty() {
        let conn = test_connection();
        assert_eq!(
            conn.set_tunnel_id(&[]).err().unwrap().kind,
            ErrorKind::InvalidParameters
        );
        conn.destroy();
    }

    #[test]
    fn test_send_requires_connected() {
        let conn = test_connection();
        let message = ProtocolVersion {
            magic: 0,
            major: 1,
            minor: 0,
        };

        assert_eq!(
            conn.send(1, &message).err().unwrap().kind,
            ErrorKind::WrongState
        );
        conn.destroy();
    }

    #[test]
    fn test_connect_rejects_empty_endpoints() {
        let conn = test_connection();
        assert_eq!(
            conn.connect(&[]).err().unwrap().kind,
            ErrorKind::InvalidParameters
        );
        conn.destroy();
    }

    #[test]
    fn test_error_status_is_absorbing() {
        let conn = test_connection();

        conn.fail(Fault::new(ErrorKind::Protocol));
        assert_eq!(conn.status(), Status::Error);

        conn.set_status(Status::Connected);
        assert_eq!(conn.status(), Status::Error);
        assert_eq!(conn.error().unwrap().kind, ErrorKind::Protocol);

        conn.destroy();
    }

    #[test]
    fn test_first_fault_is_kept() {
        let conn = test_connection();

        conn.fail(Fault::new(ErrorKind::Decryption));
        conn.fail(Fault::new(ErrorKind::Socket));

        assert_eq!(conn.error().unwrap().kind, ErrorKind::Decryption);
        conn.destroy();
    }

    #[test]
    fn test_fail_releases_waiters() {
        let conn = test_connection();
        conn.fail(Fault::new(ErrorKind::PeerTimeout));

        let result = conn.wait_ready();
        assert_eq!(result.err().unwrap().kind, ErrorKind::PeerTimeout);
        conn.destroy();
    }

    #[test]
    fn test_destroy_unregisters_and_wipes() {
        let conn = test_connection();
        let uid = conn.uid();

        assert!(registry::find(uid).is_some());
        conn.destroy();

        assert!(registry::find(uid).is_none());
        let inner = conn.inner.lock().unwrap();
        assert!(inner.link.session.is_wiped());
    }
}
