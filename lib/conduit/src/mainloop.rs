//! The event pump. A single reactor thread blocks on the poll, drives the
//! per-connection readers on readiness, and picks up caller requests
//! (connect, close, shutdown) through a queue paired with the waker.

use crate::connection::{Connection, ConnectionId, Endpoint};
use crate::error::{ConnResult, ErrorKind, Fault};
use indexmap::IndexMap;
use ion::crypto;
use ion::event::Event;
use ion::logging;
use ion::logging::Logger;
use lazy_static::lazy_static;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::mem;
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const WAKER_TOKEN: Token = Token(0);

pub(crate) enum Request {
    Connect {
        conn: Arc<Connection>,
        endpoints: Vec<Endpoint>,
    },
    Close {
        uid: ConnectionId,
        ack: Option<Arc<Event>>,
    },
    Shutdown,
}

/// Process-wide reactor context. The external contract is one
/// `init`/`shutdown` pair per process; the queue and waker live here so
/// caller threads can reach the loop without holding a reference to it.
struct Context {
    requests: Mutex<Vec<Request>>,
    waker: Mutex<Option<Arc<Waker>>>,
    running: AtomicBool,
    log: Mutex<Option<Logger>>,
}

lazy_static! {
    static ref CONTEXT: Context = Context {
        requests: Mutex::new(Vec::new()),
        waker: Mutex::new(None),
        running: AtomicBool::new(false),
        log: Mutex::new(None),
    };
}

/// The root logger configured at `init`.
pub(crate) fn logger() -> Logger {
    CONTEXT
        .log
        .lock()
        .expect("Context lock poisoned")
        .clone()
        .unwrap_or_else(logging::null)
}

/// Queues a request and wakes the reactor.
pub(crate) fn submit(request: Request) -> ConnResult<()> {
    if !CONTEXT.running.load(Ordering::Acquire) {
        return Err(Fault::new(ErrorKind::WrongState));
    }

    CONTEXT
        .requests
        .lock()
        .expect("Context lock poisoned")
        .push(request);

    if let Some(waker) = CONTEXT
        .waker
        .lock()
        .expect("Context lock poisoned")
        .as_ref()
    {
        if waker.wake().is_err() {
            return Err(Fault::new(ErrorKind::System));
        }
    }

    Ok(())
}

/// Initializes the crypto library and the event primitives, and hands back
/// the loop to run. Call once per process, paired with `shutdown`.
pub fn init() -> ConnResult<MainLoop> {
    init_with_logger(logging::init())
}

pub fn init_with_logger(log: Logger) -> ConnResult<MainLoop> {
    if !crypto::init() {
        return Err(Fault::new(ErrorKind::CryptoCore));
    }

    let poll = Poll::new().map_err(|_| Fault::new(ErrorKind::System))?;
    let waker =
        Waker::new(poll.registry(), WAKER_TOKEN).map_err(|_| Fault::new(ErrorKind::System))?;

    *CONTEXT.waker.lock().expect("Context lock poisoned") = Some(Arc::new(waker));
    *CONTEXT.log.lock().expect("Context lock poisoned") = Some(log.clone());
    CONTEXT.running.store(true, Ordering::Release);

    Ok(MainLoop {
        poll,
        events: Events::with_capacity(256),
        live: IndexMap::new(),
        log,
    })
}

/// Stops the loop; `run` returns once the request is picked up.
pub fn shutdown() {
    let _ = submit(Request::Shutdown);
}

pub struct MainLoop {
    poll: Poll,
    events: Events,
    live: IndexMap<ConnectionId, Arc<Connection>>,
    log: Logger,
}

impl MainLoop {
    /// Blocks driving the reactor until `shutdown` is requested.
    pub fn run(&mut self) {
        logging::info!(self.log, "main loop running"; "context" => "run");

        loop {
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "poll failed"; "context" => "run", "error" => %err);
                break;
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();

            if tokens.contains(&WAKER_TOKEN) && self.drain_requests() {
                break;
            }

            for token in tokens {
                if token != WAKER_TOKEN {
                    self.dispatch(token);
                }
            }
        }

        self.teardown();
        logging::info!(self.log, "main loop stopped"; "context" => "run");
    }

    /// Processes all queued requests; returns true on shutdown.
    fn drain_requests(&mut self) -> bool {
        let batch = mem::replace(
            &mut *CONTEXT.requests.lock().expect("Context lock poisoned"),
            Vec::new(),
        );

        let mut stop = false;

        for request in batch {
            match request {
                Request::Connect { conn, endpoints } => self.do_connect(conn, &endpoints),
                Request::Close { uid, ack } => {
                    self.do_close(uid);
                    if let Some(ack) = ack {
                        ack.signal();
                    }
                }
                Request::Shutdown => stop = true,
            }
        }

        stop
    }

    /// Tries the endpoints in listed order at the TCP level; the first
    /// established stream is registered readable and the opening packet is
    /// sent. Handshake failures never fall back to the next endpoint.
    fn do_connect(&mut self, conn: Arc<Connection>, endpoints: &[Endpoint]) {
        let uid = conn.uid();
        let mut last_code = 0;
        let mut connected = None;

        for endpoint in endpoints {
            logging::debug!(self.log, "trying endpoint";
                            "context" => "connect",
                            "uid" => uid,
                            "host" => endpoint.host.as_str(),
                            "port" => endpoint.port);

            match net::TcpStream::connect((endpoint.host.as_str(), endpoint.port)) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(err) => {
                    last_code = err.raw_os_error().unwrap_or(0);
                    logging::debug!(self.log, "endpoint unreachable";
                                    "context" => "connect",
                                    "uid" => uid,
                                    "error" => %err);
                }
            }
        }

        let stream = match connected {
            Some(stream) => stream,
            None => {
                conn.fail(Fault {
                    kind: ErrorKind::ConnectionRefused,
                    code: last_code,
                });
                return;
            }
        };

        if let Err(err) = stream.set_nonblocking(true) {
            conn.fail(Fault::socket(&err));
            return;
        }

        let mut stream = TcpStream::from_std(stream);
        let token = Token(uid as usize + 1);

        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            conn.fail(Fault::socket(&err));
            return;
        }

        conn.attach(stream);

        if conn.start_link().is_ok() {
            self.live.insert(uid, conn);
        }
    }

    fn do_close(&mut self, uid: ConnectionId) {
        if let Some(conn) = self.live.swap_remove(&uid) {
            conn.detach();
        } else if let Some(conn) = crate::registry::find(uid) {
            conn.detach();
        }
    }

    fn dispatch(&mut self, token: Token) {
        let uid = (token.0 - 1) as ConnectionId;

        let conn = match self.live.get(&uid) {
            Some(conn) => conn.clone(),
            None => return,
        };

        let delivered = conn.drive();

        // Hand payloads to the upper layer with no internal lock held
        if !delivered.is_empty() {
            if let Some(handler) = conn.data_handler() {
                for data in &delivered {
                    handler(data);
                }
            }
        }

        match conn.status() {
            crate::Status::Error | crate::Status::Closed => {
                self.live.swap_remove(&uid);
            }
            _ => (),
        }
    }

    fn teardown(&mut self) {
        CONTEXT.running.store(false, Ordering::Release);
        *CONTEXT.waker.lock().expect("Context lock poisoned") = None;

        let leftovers = mem::replace(
            &mut *CONTEXT.requests.lock().expect("Context lock poisoned"),
            Vec::new(),
        );
        for request in leftovers {
            if let Request::Close { ack: Some(ack), .. } = request {
                ack.signal();
            }
        }

        for (_, conn) in self.live.drain(..) {
            conn.detach();
        }
    }
}
