//! The per-connection engine.
//!
//! One `Connection` owns one transport and three cooperative tasks: the
//! receive pump ([`recv`]) frames inbound bytes, the dispatcher
//! ([`dispatch`]) owns the stream table and applies the protocol rules,
//! and the transmit pump ([`transmit`]) drains the prioritised outbound
//! queues through the shared header compressor. Per-stream state and the
//! blocking reader/writer surfaces live in [`stream`].
//!
//! Data flows socket → receive pump → dispatcher → stream receive
//! buffers, and stream writers / dispatcher → priority queues → transmit
//! pump → socket.

pub(crate) mod dispatch;
pub(crate) mod recv;
pub mod stream;
pub(crate) mod transmit;

pub use stream::{Handler, RequestStream, ResponseWriter, StreamReader, StreamWriter};

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::trace;

use crate::error::{Error, SessionError};
use crate::http::{Request, RequestExtra};

use dispatch::Dispatcher;
use stream::{cond_wait, RequestHead, StreamInit, StreamState};
use transmit::TxQueues;

/// Protocol versions this engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    V2,
    #[default]
    V3,
}

impl Version {
    /// The 15-bit version word carried in control frame headers.
    pub const fn wire(self) -> u16 {
        match self {
            Version::V2 => 2,
            Version::V3 => 3,
        }
    }
}

/// Which side of the connection this engine drives. Decides stream-id
/// and ping-id parity: servers allocate even ids, clients odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct Config {
    pub version: Version,
    /// Initial per-stream transmit window, replaced by the peer's
    /// SETTINGS initial-window value once one arrives.
    pub initial_window: i32,
    /// Upper bound on a single buffered inbound frame. Larger frames are
    /// delivered truncated and their tails discarded.
    pub max_frame_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: Version::V3,
            initial_window: 64 * 1024,
            max_frame_buffer: 256 * 1024,
        }
    }
}

/// Snapshot of negotiated TLS state, taken by the acceptor before the
/// engine starts and attached to inbound requests.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
    pub version: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<String>,
}

/// A connected bidirectional transport, split for the two pumps.
///
/// The read half belongs to the receive pump, the write half to the
/// transmit pump, and the shutdown hook lets the dispatcher close the
/// transport (which unblocks the receive pump) during teardown. The hook
/// must tolerate being called more than once.
pub struct Socket {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    shutdown: Box<dyn Fn() + Send>,
    peer_addr: Option<SocketAddr>,
    tls: Option<TlsState>,
}

impl Socket {
    /// Wrap a TCP stream, cloning handles for the two halves.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Socket> {
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Socket {
            reader: Box::new(reader),
            writer: Box::new(stream),
            shutdown: Box::new(move || {
                let _ = closer.shutdown(Shutdown::Both);
            }),
            peer_addr,
            tls: None,
        })
    }

    /// Assemble a socket from arbitrary halves (in-memory transports,
    /// TLS streams split by the caller).
    pub fn from_parts<R, W, F>(reader: R, writer: W, shutdown: F) -> Socket
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        F: Fn() + Send + 'static,
    {
        Socket {
            reader: Box::new(reader),
            writer: Box::new(writer),
            shutdown: Box::new(shutdown),
            peer_addr: None,
            tls: None,
        }
    }

    /// Attach the TLS state snapshot negotiated on this transport.
    pub fn with_tls(mut self, tls: TlsState) -> Socket {
        self.tls = Some(tls);
        self
    }

    /// Override the peer address reported on inbound requests.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Socket {
        self.peer_addr = Some(addr);
        self
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Latched once the session starts going away; never clears.
pub(crate) struct GoAwayLatch {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl GoAwayLatch {
    pub(crate) fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn latch(&self) {
        let mut flag = match self.flag.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *flag = true;
        drop(flag);
        self.cond.notify_all();
    }

    pub(crate) fn is_latched(&self) -> bool {
        match self.flag.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn wait(&self) {
        let mut flag = match self.flag.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*flag {
            flag = cond_wait(&self.cond, flag);
        }
    }
}

/// Events feeding the dispatcher. A single FIFO queue serialises the
/// four sources, so stream-id allocation order matches SYN_STREAM
/// transmission order and inbound frames apply in wire order.
#[derive(Debug)]
pub(crate) enum Event {
    /// An application wants to open an outgoing stream.
    StartRequest {
        stream: Arc<StreamState>,
        parent: Option<Arc<StreamState>>,
        reply: SyncSender<Result<(), Error>>,
    },
    /// A stream surface closed its end.
    StreamFinished { stream: Arc<StreamState> },
    /// One framed buffer from the receive pump, acked via `reply`.
    Frame {
        buf: Vec<u8>,
        reply: SyncSender<Result<(), Error>>,
    },
    /// Fatal receive error: tear the session down.
    RecvError(Error),
}

/// Cloneable handle for starting streams and observing shutdown.
#[derive(Clone)]
pub struct Handle {
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) queues: Arc<TxQueues>,
    pub(crate) go_away: Arc<GoAwayLatch>,
    pub(crate) version: u16,
    pub(crate) default_window: i32,
}

impl Handle {
    /// Open an outgoing stream carrying `req`. Blocks until the
    /// dispatcher has allocated the stream id and queued SYN_STREAM.
    ///
    /// Fails with `GoAway` once the session is going away or the 31-bit
    /// stream-id space is exhausted.
    pub fn start_request(&self, req: Request, extra: RequestExtra) -> Result<RequestStream, Error> {
        self.start_request_with_parent(req, extra, None)
    }

    pub(crate) fn start_request_with_parent(
        &self,
        req: Request,
        extra: RequestExtra,
        parent: Option<Arc<StreamState>>,
    ) -> Result<RequestStream, Error> {
        let state = Arc::new(StreamState::new(StreamInit {
            is_recipient: false,
            head: RequestHead {
                method: req.method,
                url: req.url,
                proto: req.proto,
                headers: req.headers,
            },
            child_handler: extra.child_handler.clone(),
            priority: extra.priority,
            compressed: extra.compressed,
            window: self.default_window,
            tx_finished: !extra.has_body,
            rx_finished: extra.unidirectional,
        }));

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.events
            .send(Event::StartRequest {
                stream: state.clone(),
                parent,
                reply: reply_tx,
            })
            .map_err(|_| Error::Session(SessionError::GoAway))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Session(SessionError::GoAway))??;

        Ok(RequestStream::new(
            state,
            self.clone(),
            !extra.unidirectional,
        ))
    }

    /// Whether the session has latched go-away.
    pub fn is_closed(&self) -> bool {
        self.go_away.is_latched()
    }

    /// Block until the session latches go-away.
    pub fn wait_closed(&self) {
        self.go_away.wait()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("version", &self.version)
            .field("closed", &self.go_away.is_latched())
            .finish()
    }
}

/// One SPDY connection over one transport.
///
/// Construction wires the queues and event channel; [`Connection::run`]
/// starts the pumps and drives the dispatcher until teardown. Local
/// streams are started through the [`Handle`] from another thread.
pub struct Connection {
    socket: Socket,
    role: Role,
    config: Config,
    handler: Option<Arc<dyn Handler>>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    queues: Arc<TxQueues>,
    go_away: Arc<GoAwayLatch>,
}

impl Connection {
    /// Create a connection around an already-connected transport.
    ///
    /// `handler` serves streams the peer opens; without one, inbound
    /// streams are refused. A TLS transport should be handshaken by the
    /// caller first, with the negotiated state attached via
    /// [`Socket::with_tls`].
    pub fn new(
        socket: Socket,
        handler: Option<Arc<dyn Handler>>,
        role: Role,
        config: Config,
    ) -> Connection {
        let (events_tx, events_rx) = mpsc::channel();
        Connection {
            socket,
            role,
            config,
            handler,
            events_tx,
            events_rx,
            queues: Arc::new(TxQueues::new()),
            go_away: Arc::new(GoAwayLatch::new()),
        }
    }

    /// A handle for starting requests on this connection.
    pub fn handle(&self) -> Handle {
        Handle {
            events: self.events_tx.clone(),
            queues: self.queues.clone(),
            go_away: self.go_away.clone(),
            version: self.config.version.wire(),
            default_window: self.config.initial_window,
        }
    }

    /// Drive the connection until teardown.
    ///
    /// Spawns the receive and transmit pumps and runs the dispatcher on
    /// the calling thread. Returns `Ok` for an orderly end of session
    /// (go-away plus drained table) and the fatal session error
    /// otherwise. There is no explicit local shutdown operation: a
    /// session ends when the peer's GO_AWAY drains the table or the
    /// transport drops.
    pub fn run(self) -> Result<(), Error> {
        let handle = self.handle();
        let Socket {
            reader,
            writer,
            shutdown,
            peer_addr,
            tls,
        } = self.socket;

        let version = self.config.version.wire();
        let max_frame = self.config.max_frame_buffer;

        let events = self.events_tx.clone();
        let rx_pump = thread::Builder::new()
            .name("spdy-recv".to_string())
            .spawn(move || recv::recv_pump(reader, events, max_frame))
            .map_err(|e| Error::Session(SessionError::from(e)))?;

        let queues = self.queues.clone();
        let tx_pump = thread::Builder::new()
            .name("spdy-transmit".to_string())
            .spawn(move || transmit::tx_pump(writer, &queues, version))
            .map_err(|e| Error::Session(SessionError::from(e)))?;

        let dispatcher = Dispatcher::new(
            self.role,
            self.handler.clone(),
            handle,
            self.config.initial_window,
            shutdown,
            peer_addr,
            tls,
        );
        let result = dispatcher.run(self.events_rx);

        // Teardown closed the queues and the socket, so both pumps wind
        // down on their own.
        let _ = tx_pump.join();
        let _ = rx_pump.join();
        trace!("spdy: connection finished");
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("version", &self.config.version)
            .field("socket", &self.socket)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_handle() -> (Handle, mpsc::Receiver<Event>) {
    let (events, events_rx) = mpsc::channel();
    let handle = Handle {
        events,
        queues: Arc::new(TxQueues::new()),
        go_away: Arc::new(GoAwayLatch::new()),
        version: 3,
        default_window: 64 * 1024,
    };
    (handle, events_rx)
}
