//! End-to-end tests exercising the connection engine over loopback TCP.
//!
//! One side is a real `Connection` (client or server role); the other is
//! a raw peer speaking hand-assembled frames through its own compression
//! context, so the tests observe exactly what reaches the wire.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use milli_spdy::frame::{
    self, Compressor, DataFrame, Decompressor, Frame, GoAwayFrame, PingFrame, SynReplyFrame,
    WindowUpdateFrame,
};
use milli_spdy::{
    Config, Connection, Error, Handler, Headers, Method, Request, RequestExtra, ResetCode,
    ResponseWriter, Role, SessionError, Socket, StatusCode,
};
use url::Url;

// ---------------------------------------------------------------------------
// Test infrastructure
// ---------------------------------------------------------------------------

fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr).expect("connect loopback");
    let (accept, _) = listener.accept().expect("accept loopback");
    (connect, accept)
}

/// The raw side of the connection: reads and writes frames directly,
/// with its own persistent header compression contexts.
struct RawPeer {
    sock: TcpStream,
    zip: Compressor,
    unzip: Decompressor,
}

impl RawPeer {
    fn new(sock: TcpStream, version: u16) -> Self {
        Self {
            sock,
            zip: Compressor::new(version),
            unzip: Decompressor::new(version),
        }
    }

    fn send(&mut self, frame: &Frame) {
        frame.write(&mut self.sock, &mut self.zip).expect("peer write");
        self.sock.flush().unwrap();
    }

    /// Write raw bytes, bypassing the frame encoder.
    fn send_raw(&mut self, bytes: &[u8]) {
        self.sock.write_all(bytes).expect("peer raw write");
        self.sock.flush().unwrap();
    }

    fn recv(&mut self) -> Frame {
        let mut hdr = [0u8; frame::HEADER_SIZE];
        self.sock.read_exact(&mut hdr).expect("peer read header");
        let len = frame::payload_length(&hdr);
        let mut buf = vec![0u8; frame::HEADER_SIZE + len];
        buf[..frame::HEADER_SIZE].copy_from_slice(&hdr);
        self.sock
            .read_exact(&mut buf[frame::HEADER_SIZE..])
            .expect("peer read payload");
        frame::parse_frame(&buf, &mut self.unzip)
            .expect("peer parse")
            .expect("known frame type")
    }

    /// Read frames until one matches, failing the test on unexpected
    /// session teardown.
    fn recv_until<F: Fn(&Frame) -> bool>(&mut self, what: &str, pred: F) -> Frame {
        for _ in 0..32 {
            let frame = self.recv();
            if pred(&frame) {
                return frame;
            }
        }
        panic!("gave up waiting for {what}");
    }

    /// Assert that nothing but window updates arrives within the given
    /// window of time.
    fn expect_quiet(&mut self, dur: Duration) {
        self.sock.set_read_timeout(Some(dur)).unwrap();
        loop {
            let mut hdr = [0u8; frame::HEADER_SIZE];
            match self.sock.read_exact(&mut hdr) {
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => panic!("unexpected read error while expecting quiet: {e}"),
                Ok(()) => {
                    assert!(
                        !frame::is_control(&hdr) || frame::control_kind(&hdr) == frame::FRAME_WINDOW_UPDATE,
                        "unexpected frame while expecting quiet"
                    );
                    let len = frame::payload_length(&hdr);
                    let mut rest = vec![0u8; len];
                    self.sock.read_exact(&mut rest).unwrap();
                }
            }
        }
        self.sock.set_read_timeout(None).unwrap();
    }
}

fn client_engine(
    config: Config,
) -> (milli_spdy::Handle, RawPeer, thread::JoinHandle<Result<(), Error>>) {
    let (ours, theirs) = socket_pair();
    let version = config.version.wire();
    let conn = Connection::new(
        Socket::from_tcp(ours).unwrap(),
        None,
        Role::Client,
        config,
    );
    let handle = conn.handle();
    let run = thread::spawn(move || conn.run());
    (handle, RawPeer::new(theirs, version), run)
}

fn server_engine(
    handler: Arc<dyn Handler>,
    config: Config,
) -> (RawPeer, thread::JoinHandle<Result<(), Error>>) {
    let (ours, theirs) = socket_pair();
    let version = config.version.wire();
    let conn = Connection::new(
        Socket::from_tcp(ours).unwrap(),
        Some(handler),
        Role::Server,
        config,
    );
    let run = thread::spawn(move || conn.run());
    (RawPeer::new(theirs, version), run)
}

fn get_request(path: &str) -> Request {
    Request::new(
        Method::GET,
        Url::parse(&format!("http://example.com{path}")).unwrap(),
    )
}

fn syn_reply(stream_id: u32, status: &str, finished: bool) -> Frame {
    Frame::SynReply(SynReplyFrame {
        version: 3,
        stream_id,
        finished,
        status: status.to_string(),
        proto: "HTTP/1.1".to_string(),
        headers: Headers::new(),
    })
}

fn data(stream_id: u32, bytes: &[u8], finished: bool) -> Frame {
    Frame::Data(DataFrame {
        stream_id,
        finished,
        compressed: false,
        data: bytes.to_vec(),
    })
}

fn push_syn_stream(stream_id: u32, associated: u32, path: &str) -> Frame {
    Frame::SynStream(milli_spdy::frame::SynStreamFrame {
        version: 3,
        stream_id,
        associated_stream_id: associated,
        finished: false,
        unidirectional: true,
        priority: 0,
        method: "GET".to_string(),
        url: Url::parse(&format!("http://example.com{path}")).unwrap(),
        proto: "HTTP/1.1".to_string(),
        headers: Headers::new(),
    })
}

// ---------------------------------------------------------------------------
// Scenario: happy GET
// ---------------------------------------------------------------------------

#[test]
fn happy_get() {
    let (handle, mut peer, _run) = client_engine(Config::default());

    let mut stream = handle
        .start_request(get_request("/x"), RequestExtra::default())
        .unwrap();

    let syn = peer.recv();
    let Frame::SynStream(syn) = syn else {
        panic!("expected SYN_STREAM, got {syn:?}");
    };
    assert_eq!(syn.stream_id, 1);
    assert!(syn.finished, "a bodyless request finishes at open");
    assert!(!syn.unidirectional);
    assert_eq!(syn.method, "GET");
    assert_eq!(syn.url.path(), "/x");

    peer.send(&syn_reply(1, "200 OK", false));
    peer.send(&data(1, b"hi", true));

    let mut response = stream.response().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.status_text, "200 OK");

    let mut body = String::new();
    response.body.read_to_string(&mut body).unwrap();
    assert_eq!(body, "hi");

    // A completed stream is retired without a reset; only window credit
    // may flow back.
    drop(response);
    peer.expect_quiet(Duration::from_millis(200));
}

// ---------------------------------------------------------------------------
// Scenario: cancel
// ---------------------------------------------------------------------------

#[test]
fn dropping_the_response_body_cancels_the_stream() {
    let (handle, mut peer, _run) = client_engine(Config::default());

    let mut stream = handle
        .start_request(get_request("/slow"), RequestExtra::default())
        .unwrap();
    peer.recv_until("SYN_STREAM", |f| matches!(f, Frame::SynStream(_)));

    peer.send(&syn_reply(1, "200 OK", false));
    peer.send(&data(1, b"part", false));

    let mut response = stream.response().unwrap();
    let mut chunk = [0u8; 4];
    response.body.read_exact(&mut chunk).unwrap();
    assert_eq!(&chunk, b"part");

    // Close the reader before the stream finished.
    drop(response);

    let reset = peer.recv_until("RST_STREAM", |f| matches!(f, Frame::RstStream(_)));
    let Frame::RstStream(reset) = reset else { unreachable!() };
    assert_eq!(reset.stream_id, 1);
    assert_eq!(reset.status, ResetCode::Cancel.to_code());

    // Late DATA for the cancelled stream is dropped on the floor; the
    // session stays healthy, which the ping echo proves.
    peer.send(&data(1, b"late", true));
    peer.send(&Frame::Ping(PingFrame { version: 3, id: 2 }));
    let pong = peer.recv_until("PING echo", |f| matches!(f, Frame::Ping(_)));
    let Frame::Ping(pong) = pong else { unreachable!() };
    assert_eq!(pong.id, 2);
}

// ---------------------------------------------------------------------------
// Scenario: server push into a child handler
// ---------------------------------------------------------------------------

#[test]
fn push_stream_is_served_by_the_child_handler() {
    let (handle, mut peer, _run) = client_engine(Config::default());

    let pushed: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = pushed.clone();
    let (done_tx, done_rx) = mpsc::channel();
    let child: Arc<dyn Handler> = Arc::new(move |req: Request, _w: ResponseWriter| {
        let mut body = String::new();
        if let Some(mut reader) = req.body {
            reader.read_to_string(&mut body).unwrap();
        }
        record.lock().unwrap().push((req.url.path().to_string(), body));
        done_tx.send(()).unwrap();
    });

    let extra = RequestExtra {
        child_handler: Some(child),
        ..RequestExtra::default()
    };
    let mut stream = handle.start_request(get_request("/page"), extra).unwrap();
    peer.recv_until("SYN_STREAM", |f| matches!(f, Frame::SynStream(_)));

    // Push an associated stream, stream its body, then answer the
    // original request.
    peer.send(&push_syn_stream(2, 1, "/pushed.css"));
    peer.send(&data(2, b"body{}", true));
    peer.send(&syn_reply(1, "200 OK", false));
    peer.send(&data(1, b"page", true));

    let mut response = stream.response().unwrap();
    let mut body = String::new();
    response.body.read_to_string(&mut body).unwrap();
    assert_eq!(body, "page");

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("child handler never ran");
    assert_eq!(
        pushed.lock().unwrap().as_slice(),
        [("/pushed.css".to_string(), "body{}".to_string())]
    );
}

// ---------------------------------------------------------------------------
// Scenario: reset on protocol violation
// ---------------------------------------------------------------------------

#[test]
fn reopening_a_stream_id_yields_stream_in_use() {
    // Hold the first handler open so stream 3 is still live when the
    // duplicate SYN_STREAM arrives.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate = Mutex::new(Some(gate_rx));
    let handler: Arc<dyn Handler> = Arc::new(move |_req: Request, _w: ResponseWriter| {
        if let Some(gate) = gate.lock().unwrap().take() {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
    });
    let (mut peer, _run) = server_engine(handler, Config::default());

    let open = |id| {
        Frame::SynStream(milli_spdy::frame::SynStreamFrame {
            version: 3,
            stream_id: id,
            associated_stream_id: 0,
            finished: true,
            unidirectional: false,
            priority: 0,
            method: "GET".to_string(),
            url: Url::parse("http://example.com/dup").unwrap(),
            proto: "HTTP/1.1".to_string(),
            headers: Headers::new(),
        })
    };
    peer.send(&open(3));
    peer.send(&open(3));

    let reset = peer.recv_until("RST_STREAM", |f| matches!(f, Frame::RstStream(_)));
    let Frame::RstStream(reset) = reset else { unreachable!() };
    assert_eq!(reset.stream_id, 3);
    assert_eq!(reset.status, ResetCode::StreamInUse.to_code());

    gate_tx.send(()).ok();
}

// ---------------------------------------------------------------------------
// Scenario: graceful go-away
// ---------------------------------------------------------------------------

#[test]
fn go_away_drains_accepted_streams_then_closes() {
    let (handle, mut peer, run) = client_engine(Config::default());

    let mut first = handle
        .start_request(get_request("/a"), RequestExtra::default())
        .unwrap();
    let mut second = handle
        .start_request(get_request("/b"), RequestExtra::default())
        .unwrap();
    let mut third = handle
        .start_request(get_request("/c"), RequestExtra::default())
        .unwrap();
    assert_eq!(first.stream_id(), 1);
    assert_eq!(second.stream_id(), 3);
    assert_eq!(third.stream_id(), 5);
    for _ in 0..3 {
        peer.recv_until("SYN_STREAM", |f| matches!(f, Frame::SynStream(_)));
    }

    // The peer accepted only stream 1.
    peer.send(&Frame::GoAway(GoAwayFrame {
        version: 3,
        last_stream_id: 1,
        status: 0,
    }));

    // Streams past the high-water mark fail with GoAway...
    assert_eq!(
        second.response().unwrap_err(),
        Error::Session(SessionError::GoAway)
    );
    assert_eq!(
        third.response().unwrap_err(),
        Error::Session(SessionError::GoAway)
    );
    assert!(handle.is_closed());

    // ...and new requests are rejected.
    let err = handle
        .start_request(get_request("/late"), RequestExtra::default())
        .unwrap_err();
    assert_eq!(err, Error::Session(SessionError::GoAway));

    // Stream 1 runs to completion.
    peer.send(&syn_reply(1, "200 OK", false));
    peer.send(&data(1, b"done", true));
    let mut response = first.response().unwrap();
    let mut body = String::new();
    response.body.read_to_string(&mut body).unwrap();
    assert_eq!(body, "done");
    drop(response);

    // With the table drained under go-away the engine closes the socket
    // and reports an orderly end of session.
    assert_eq!(run.join().unwrap(), Ok(()));

    // The peer observes the close as EOF.
    let mut probe = [0u8; 1];
    loop {
        match peer.sock.read(&mut probe) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue, // residual window updates
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario: session flow-control violation
// ---------------------------------------------------------------------------

#[test]
fn truncated_control_frame_aborts_the_session() {
    let handler: Arc<dyn Handler> = Arc::new(|_req: Request, _w: ResponseWriter| {});
    let config = Config {
        max_frame_buffer: frame::HEADER_SIZE + 40,
        ..Config::default()
    };
    let (mut peer, run) = server_engine(handler, config);

    // A SETTINGS frame declaring 100 payload bytes. The engine's receive
    // pump buffers only 40 of them, and the dispatcher treats the length
    // mismatch as a session flow-control violation.
    let mut bytes = vec![0x80, 3, 0, 4, 0, 0, 0, 100];
    bytes.resize(bytes.len() + 100, 0);
    peer.send_raw(&bytes);

    assert_eq!(
        run.join().unwrap(),
        Err(Error::Session(SessionError::FlowControl))
    );

    // Teardown closed the transport.
    let mut probe = [0u8; 1];
    assert!(matches!(peer.sock.read(&mut probe), Ok(0) | Err(_)));
}

// ---------------------------------------------------------------------------
// Flow control end-to-end
// ---------------------------------------------------------------------------

#[test]
fn request_body_respects_the_transmit_window() {
    let config = Config {
        initial_window: 4,
        ..Config::default()
    };
    let (handle, mut peer, _run) = client_engine(config);

    let extra = RequestExtra {
        has_body: true,
        ..RequestExtra::default()
    };
    let stream = handle.start_request(get_request("/upload"), extra).unwrap();
    let mut writer = stream.writer().expect("request has a body");

    let sender = thread::spawn(move || {
        writer.write_all(b"0123456789").unwrap();
        writer.close();
    });

    peer.recv_until("SYN_STREAM", |f| matches!(f, Frame::SynStream(_)));

    // The first chunk is clipped to the 4-byte window.
    let mut received = Vec::new();
    let first = peer.recv_until("DATA", |f| matches!(f, Frame::Data(_)));
    let Frame::Data(first) = first else { unreachable!() };
    assert!(first.data.len() <= 4, "first chunk exceeds the window");
    received.extend_from_slice(&first.data);

    // Feed credit until the full body lands.
    while received.len() < 10 {
        peer.send(&Frame::WindowUpdate(WindowUpdateFrame {
            version: 3,
            stream_id: 1,
            delta: 4,
        }));
        let next = peer.recv_until("DATA", |f| matches!(f, Frame::Data(_)));
        let Frame::Data(next) = next else { unreachable!() };
        received.extend_from_slice(&next.data);
    }
    assert_eq!(received, b"0123456789");

    // The writer closes with an empty FIN frame.
    let fin = peer.recv_until("DATA FIN", |f| matches!(f, Frame::Data(d) if d.finished));
    let Frame::Data(fin) = fin else { unreachable!() };
    assert!(fin.data.is_empty());

    sender.join().unwrap();
}

// ---------------------------------------------------------------------------
// Ping parity
// ---------------------------------------------------------------------------

#[test]
fn only_peer_originated_pings_are_echoed() {
    let (_handle, mut peer, _run) = client_engine(Config::default());

    // Even ids are peer-originated for a client engine; odd ids look
    // like our own pings coming back and are dropped.
    peer.send(&Frame::Ping(PingFrame { version: 3, id: 2 }));
    peer.send(&Frame::Ping(PingFrame { version: 3, id: 3 }));
    peer.send(&Frame::Ping(PingFrame { version: 3, id: 4 }));

    let mut echoed = Vec::new();
    for _ in 0..2 {
        let pong = peer.recv_until("PING echo", |f| matches!(f, Frame::Ping(_)));
        let Frame::Ping(pong) = pong else { unreachable!() };
        echoed.push(pong.id);
    }
    assert_eq!(echoed, [2, 4]);
}

// ---------------------------------------------------------------------------
// Server-side: respond and push
// ---------------------------------------------------------------------------

#[test]
fn server_responds_and_pushes_an_associated_stream() {
    let handler: Arc<dyn Handler> = Arc::new(|req: Request, mut w: ResponseWriter| {
        // Push a resource associated with this stream, then answer.
        let push_req = Request::new(
            Method::GET,
            Url::parse("http://example.com/style.css").unwrap(),
        );
        let extra = RequestExtra {
            unidirectional: true,
            has_body: true,
            ..RequestExtra::default()
        };
        let push = w.push(push_req, extra).unwrap();
        let mut push_writer = push.writer().unwrap();
        push_writer.write_all(b"body{}").unwrap();
        push_writer.close();

        let mut headers = Headers::new();
        headers.set("content-type", "text/html");
        w.send_response(StatusCode::OK, headers).unwrap();
        let mut body = w.body();
        body.write_all(format!("serving {}", req.url.path()).as_bytes()).unwrap();
        body.close();
    });
    let (mut peer, _run) = server_engine(handler, Config::default());

    peer.send(&Frame::SynStream(milli_spdy::frame::SynStreamFrame {
        version: 3,
        stream_id: 1,
        associated_stream_id: 0,
        finished: true,
        unidirectional: false,
        priority: 1,
        method: "GET".to_string(),
        url: Url::parse("http://example.com/index.html").unwrap(),
        proto: "HTTP/1.1".to_string(),
        headers: Headers::new(),
    }));

    // The push SYN_STREAM, the reply, and the two bodies interleave
    // depending on pump scheduling; collect everything in one pass.
    let mut push = None;
    let mut reply = None;
    let mut push_body = Vec::new();
    let mut main_body = Vec::new();
    let mut push_done = false;
    let mut main_done = false;
    while !(push_done && main_done) {
        match peer.recv() {
            Frame::SynStream(f) => push = Some(f),
            Frame::SynReply(f) => reply = Some(f),
            Frame::Data(d) => match d.stream_id {
                2 => {
                    push_body.extend_from_slice(&d.data);
                    push_done |= d.finished;
                }
                1 => {
                    main_body.extend_from_slice(&d.data);
                    main_done |= d.finished;
                }
                other => panic!("data on unexpected stream {other}"),
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }

    let push = push.expect("no push SYN_STREAM seen");
    assert_eq!(push.stream_id, 2, "server-pushed streams use even ids");
    assert_eq!(push.associated_stream_id, 1);
    assert!(push.unidirectional);
    assert!(push.stream_id > push.associated_stream_id);

    let reply = reply.expect("no SYN_REPLY seen");
    assert_eq!(reply.stream_id, 1);
    assert_eq!(reply.status, "200 OK");
    assert_eq!(reply.headers.get("content-type"), Some("text/html"));

    assert_eq!(push_body, b"body{}");
    assert_eq!(main_body, b"serving /index.html");
}

// ---------------------------------------------------------------------------
// SETTINGS window re-sizing observed on the wire
// ---------------------------------------------------------------------------

#[test]
fn settings_shrink_gates_an_open_stream() {
    let (handle, mut peer, _run) = client_engine(Config::default());

    let extra = RequestExtra {
        has_body: true,
        ..RequestExtra::default()
    };
    let stream = handle.start_request(get_request("/up"), extra).unwrap();
    peer.recv_until("SYN_STREAM", |f| matches!(f, Frame::SynStream(_)));

    // Shrink every open stream's window to 3 bytes.
    peer.send(&Frame::Settings(frame::SettingsFrame {
        version: 3,
        entries: vec![frame::Setting {
            id: frame::SETTINGS_INITIAL_WINDOW,
            flags: 0,
            value: 3,
        }],
    }));

    // Give the dispatcher a beat to apply the delta, then write.
    thread::sleep(Duration::from_millis(100));
    let mut writer = stream.writer().unwrap();
    let wrote = thread::spawn(move || {
        let n = writer.write(b"abcdef").unwrap();
        n
    });

    let first = peer.recv_until("DATA", |f| matches!(f, Frame::Data(_)));
    let Frame::Data(first) = first else { unreachable!() };
    assert!(first.data.len() <= 3, "window shrink was not applied");
    assert_eq!(wrote.join().unwrap(), first.data.len());
}
