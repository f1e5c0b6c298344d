//! The dispatcher: sole owner of the stream table and executor of the
//! protocol rules.
//!
//! Runs on the connection thread, serially draining one event queue fed
//! by local request starters, finishing streams, and the receive pump.
//! Because stream-id allocation and SYN_STREAM enqueueing happen inside
//! one event, locally allocated ids reach the wire in allocation order;
//! because the receive pump waits for each frame's verdict, inbound
//! frames are applied in wire order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;

use log::{debug, trace};

use crate::error::{Error, ResetCode, SessionError, StreamError};
use crate::frame::{
    self, Decompressor, Frame, PingFrame, RstStreamFrame, SynStreamFrame, HEADER_SIZE,
    MAX_STREAM_ID,
};
use crate::http::message::content_length_from;
use crate::http::{Method, Request, StatusCode};

use super::stream::{
    spawn_handler, Handler, RequestHead, ResponseHead, StreamInit, StreamReader, StreamState,
};
use super::{Event, Handle, Role, TlsState};

/// A stream table record. Parent/child links are stream ids, so tearing
/// down a subtree never chases dangling references.
struct StreamEntry {
    state: Arc<StreamState>,
    parent: Option<u32>,
    children: Vec<u32>,
}

pub(crate) struct Dispatcher {
    version: u16,
    handler: Option<Arc<dyn Handler>>,
    handle: Handle,
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    last_stream_opened: u32,
    next_ping_id: u32,
    go_away: bool,
    session_window: i32,
    unzip: Decompressor,
    shutdown: Box<dyn Fn() + Send>,
    socket_closed: bool,
    peer_addr: Option<SocketAddr>,
    tls: Option<TlsState>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: Role,
        handler: Option<Arc<dyn Handler>>,
        handle: Handle,
        session_window: i32,
        shutdown: Box<dyn Fn() + Send>,
        peer_addr: Option<SocketAddr>,
        tls: Option<TlsState>,
    ) -> Self {
        let (next_stream_id, next_ping_id) = match role {
            Role::Server => (2, 0),
            Role::Client => (1, 1),
        };
        let unzip = Decompressor::new(handle.version);
        Self {
            version: handle.version,
            handler,
            handle,
            streams: HashMap::new(),
            next_stream_id,
            last_stream_opened: 0,
            next_ping_id,
            go_away: false,
            session_window,
            unzip,
            shutdown,
            socket_closed: false,
            peer_addr,
            tls,
        }
    }

    /// Drain events until a fatal receive error tears the session down.
    pub(crate) fn run(mut self, events: mpsc::Receiver<Event>) -> Result<(), Error> {
        for event in events.iter() {
            match event {
                Event::StartRequest { stream, parent, reply } => {
                    let result = self.handle_start_request(&stream, parent.as_ref());
                    let _ = reply.send(result);
                }
                Event::StreamFinished { stream } => self.handle_stream_finished(&stream),
                Event::Frame { buf, reply } => {
                    let _ = reply.send(self.process_frame(&buf));
                }
                Event::RecvError(err) => return self.teardown(err),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Local events
    // -----------------------------------------------------------------

    fn handle_start_request(
        &mut self,
        stream: &Arc<StreamState>,
        parent: Option<&Arc<StreamState>>,
    ) -> Result<(), Error> {
        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(2);
        stream.set_id(stream_id);

        let associated_stream_id = parent.map(|p| p.id()).unwrap_or(0);

        if stream_id > MAX_STREAM_ID || self.go_away {
            return Err(Error::Session(SessionError::GoAway));
        }

        let (tx_finished, priority) = {
            let tx = stream.lock_tx();
            (tx.finished, tx.priority)
        };
        let rx_finished = stream.lock_rx().finished;
        let head = stream.head().clone();

        // Always through the control queue, so SYN_STREAM frames go out
        // in stream-id allocation order.
        self.handle.queues.push_control(Frame::SynStream(SynStreamFrame {
            version: self.version,
            stream_id,
            associated_stream_id,
            finished: tx_finished,
            unidirectional: rx_finished,
            priority,
            method: head.method.as_str().to_string(),
            url: head.url,
            proto: head.proto,
            headers: head.headers,
        }));
        debug!("spdy: tx SYN_STREAM stream={stream_id} assoc={associated_stream_id}");

        // Half-closed in both directions at birth: never enters the table.
        if tx_finished && rx_finished {
            return Ok(());
        }

        stream.lock_tx().window = self.session_window;
        self.streams.insert(
            stream_id,
            StreamEntry {
                state: stream.clone(),
                parent: parent.map(|p| p.id()),
                children: Vec::new(),
            },
        );
        if let Some(parent) = parent
            && let Some(entry) = self.streams.get_mut(&parent.id())
            && Arc::ptr_eq(&entry.state, parent)
        {
            entry.children.push(stream_id);
        }
        Ok(())
    }

    fn handle_stream_finished(&mut self, stream: &Arc<StreamState>) {
        let stream_id = stream.id();
        // A reset may have finished this stream (or replaced its id)
        // before the notification arrived.
        let Some(entry) = self.streams.get(&stream_id) else {
            return;
        };
        if !Arc::ptr_eq(&entry.state, stream) {
            return;
        }

        let rx_finished = stream.lock_rx().finished;
        if !stream.is_recipient() && !rx_finished {
            self.send_reset(stream_id, ResetCode::Cancel);
        }
        self.finish_stream(stream_id, &Error::Stream(StreamError::Cancel(stream_id)));
    }

    // -----------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------

    /// Apply one framed buffer and produce the receive pump's verdict:
    /// `Ok` to keep reading (stream errors are handled here, with an
    /// outgoing RST plus local finalisation), or the session error that
    /// aborts the connection.
    fn process_frame(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self.handle_frame(buf) {
            Ok(()) => Ok(()),
            Err(Error::Stream(err)) => {
                debug!("spdy: stream error: {err}");
                let stream_id = err.stream_id();
                self.send_reset(stream_id, err.reset_code());
                if self.streams.contains_key(&stream_id) {
                    self.finish_stream(stream_id, &Error::Stream(err));
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn handle_frame(&mut self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Session(SessionError::Protocol));
        }
        if !frame::is_control(buf) {
            return self.handle_data(buf);
        }
        // For control frames the length word must match the delivered
        // buffer exactly; the receive pump truncates oversized frames.
        if frame::payload_length(buf) + HEADER_SIZE != buf.len() {
            return Err(Error::Session(SessionError::FlowControl));
        }
        match frame::control_kind(buf) {
            frame::FRAME_SYN_STREAM => self.handle_syn_stream(buf),
            frame::FRAME_SYN_REPLY => self.handle_syn_reply(buf),
            frame::FRAME_RST_STREAM => self.handle_rst_stream(buf),
            frame::FRAME_SETTINGS => self.handle_settings(buf),
            frame::FRAME_PING => self.handle_ping(buf),
            frame::FRAME_GO_AWAY => self.handle_go_away(buf),
            frame::FRAME_HEADERS => self.handle_headers(buf),
            frame::FRAME_WINDOW_UPDATE => self.handle_window_update(buf),
            kind => {
                trace!("spdy: ignoring unknown control frame type {kind}");
                Ok(())
            }
        }
    }

    fn handle_syn_stream(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_syn_stream(buf, &mut self.unzip)?;
        debug!(
            "spdy: rx SYN_STREAM stream={} assoc={} fin={}",
            f.stream_id, f.associated_stream_id, f.finished
        );

        // Reopening a live stream kills both; check first, since any
        // later rejection would RST (and thus finalise) the original.
        if self.streams.contains_key(&f.stream_id) {
            return Err(Error::Stream(StreamError::InUse(f.stream_id)));
        }
        if f.version != self.version {
            return Err(Error::Stream(StreamError::Version {
                stream_id: f.stream_id,
                version: f.version,
            }));
        }
        // Remote ids carry the opposite parity from ours.
        if f.stream_id & 1 == self.next_stream_id & 1 {
            return Err(Error::Stream(StreamError::Protocol(f.stream_id)));
        }
        if f.stream_id <= self.last_stream_opened {
            return Err(Error::Stream(StreamError::Protocol(f.stream_id)));
        }
        self.last_stream_opened = f.stream_id;

        let mut handler = self.handler.clone();
        let mut parent_id = None;
        if f.associated_stream_id > 0 {
            // Associated streams must hang off a locally-owned stream
            // that is still open.
            let locally_owned = f.associated_stream_id & 1 == self.next_stream_id & 1;
            let parent = self.streams.get(&f.associated_stream_id);
            let (Some(parent), true) = (parent, locally_owned) else {
                return Err(Error::Stream(StreamError::InvalidAssociatedStream {
                    stream_id: f.stream_id,
                    associated_id: f.associated_stream_id,
                }));
            };
            handler = parent.state.child_handler();
            parent_id = Some(f.associated_stream_id);
        }
        let Some(handler) = handler else {
            return Err(Error::Stream(StreamError::RefusedStream(f.stream_id)));
        };

        let method = Method::from_str(&f.method);
        let state = Arc::new(StreamState::new(StreamInit {
            is_recipient: true,
            head: RequestHead {
                method: method.clone(),
                url: f.url.clone(),
                proto: f.proto.clone(),
                headers: f.headers.clone(),
            },
            child_handler: None,
            priority: f.priority,
            compressed: false,
            window: self.session_window,
            // The opener declaring the stream unidirectional closes our
            // transmit side; its FIN closes our receive side.
            tx_finished: f.unidirectional,
            rx_finished: f.finished,
        }));
        state.set_id(f.stream_id);

        let request = Request {
            method,
            url: f.url,
            proto: f.proto,
            content_length: content_length_from(&f.headers),
            headers: f.headers,
            body: Some(StreamReader::new(state.clone(), self.handle.clone(), false)),
            remote_addr: self.peer_addr,
            tls: self.tls.clone(),
        };

        // Already half-closed in both directions: serve it, but it never
        // enters the table.
        if !state.finished_at_birth() {
            self.streams.insert(
                f.stream_id,
                StreamEntry {
                    state: state.clone(),
                    parent: parent_id,
                    children: Vec::new(),
                },
            );
            if let Some(pid) = parent_id
                && let Some(entry) = self.streams.get_mut(&pid)
            {
                entry.children.push(f.stream_id);
            }
        }

        spawn_handler(handler, request, state, self.handle.clone());
        Ok(())
    }

    fn handle_syn_reply(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_syn_reply(buf, &mut self.unzip)?;
        debug!("spdy: rx SYN_REPLY stream={} status={}", f.stream_id, f.status);

        let Some(entry) = self.streams.get(&f.stream_id) else {
            return Err(Error::Stream(StreamError::InvalidStream(f.stream_id)));
        };
        if f.version != self.version {
            return Err(Error::Stream(StreamError::Version {
                stream_id: f.stream_id,
                version: f.version,
            }));
        }
        // Replies only land on streams we initiated.
        if entry.state.is_recipient() {
            return Err(Error::Stream(StreamError::Protocol(f.stream_id)));
        }

        let state = entry.state.clone();
        let mut rx = state.lock_rx();
        if rx.response.is_some() {
            return Err(Error::Stream(StreamError::InUse(f.stream_id)));
        }
        if rx.finished {
            return Err(Error::Stream(StreamError::AlreadyClosed(f.stream_id)));
        }

        let Some((status, _)) = StatusCode::parse_status_line(&f.status) else {
            return Err(Error::Stream(StreamError::Protocol(f.stream_id)));
        };
        rx.response = Some(ResponseHead {
            status,
            status_text: f.status,
            proto: f.proto,
            content_length: content_length_from(&f.headers),
            headers: f.headers,
        });
        rx.finished = f.finished;
        drop(rx);
        state.rx_cond.notify_all();
        Ok(())
    }

    fn handle_headers(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_headers(buf, &mut self.unzip)?;
        debug!("spdy: rx HEADERS stream={} fin={}", f.stream_id, f.finished);

        let Some(entry) = self.streams.get(&f.stream_id) else {
            return Err(Error::Stream(StreamError::InvalidStream(f.stream_id)));
        };
        if f.version != self.version {
            return Err(Error::Stream(StreamError::Version {
                stream_id: f.stream_id,
                version: f.version,
            }));
        }

        let state = entry.state.clone();
        let mut rx = state.lock_rx();
        if rx.finished {
            return Err(Error::Stream(StreamError::AlreadyClosed(f.stream_id)));
        }
        // Late header fields land in the trailers bag.
        rx.trailers.extend(&f.headers);
        if f.finished {
            rx.finished = true;
        }
        drop(rx);
        state.rx_cond.notify_all();
        Ok(())
    }

    fn handle_rst_stream(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_rst_stream(buf)?;
        debug!("spdy: rx RST_STREAM stream={} status={}", f.stream_id, f.status);

        // Resets for unknown streams are ignored.
        if !self.streams.contains_key(&f.stream_id) {
            return Ok(());
        }
        let code = ResetCode::from_code(f.status).unwrap_or(ResetCode::ProtocolError);
        let err = StreamError::from_reset_code(code, f.stream_id, self.version);
        // Handled locally: the peer reset the stream, so no RST goes back.
        self.finish_stream(f.stream_id, &Error::Stream(err));
        Ok(())
    }

    fn handle_settings(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_settings(buf)?;
        debug!("spdy: rx SETTINGS entries={}", f.entries.len());

        if f.version != self.version {
            return Err(Error::Session(SessionError::Version(f.version)));
        }
        let Some(window) = f.window() else {
            return Ok(());
        };

        // Apply the delta to every open stream's transmit window; a
        // shrink may push windows transiently negative.
        let change = window - self.session_window;
        self.session_window = window;
        for entry in self.streams.values() {
            let mut tx = entry.state.lock_tx();
            tx.window += change;
            drop(tx);
            entry.state.tx_cond.notify_all();
        }
        Ok(())
    }

    fn handle_window_update(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_window_update(buf)?;
        trace!("spdy: rx WINDOW_UPDATE stream={} delta={}", f.stream_id, f.delta);

        let Some(entry) = self.streams.get(&f.stream_id) else {
            return Err(Error::Stream(StreamError::InvalidStream(f.stream_id)));
        };
        if f.version != self.version {
            return Err(Error::Stream(StreamError::Version {
                stream_id: f.stream_id,
                version: f.version,
            }));
        }
        let mut tx = entry.state.lock_tx();
        tx.window += f.delta;
        drop(tx);
        entry.state.tx_cond.notify_all();
        Ok(())
    }

    fn handle_ping(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_ping(buf)?;
        debug!("spdy: rx PING id={}", f.id);

        if f.version != self.version {
            return Err(Error::Session(SessionError::Version(f.version)));
        }
        // Only echo peer-originated pings; loopback ids are dropped.
        if (f.id & 1) != (self.next_ping_id & 1) {
            self.handle.queues.push_control(Frame::Ping(PingFrame {
                version: self.version,
                id: f.id,
            }));
        }
        Ok(())
    }

    fn handle_go_away(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_go_away(buf)?;
        debug!(
            "spdy: rx GO_AWAY last_stream={} status={}",
            f.last_stream_id, f.status
        );

        if f.version != self.version {
            return Err(Error::Session(SessionError::Version(f.version)));
        }

        // No new streams start after this point; once the table empties,
        // finish_stream closes the socket.
        self.go_away = true;
        self.handle.go_away.latch();

        let err = match ResetCode::from_code(f.status) {
            None if f.status == 0 => SessionError::GoAway,
            Some(ResetCode::UnsupportedVersion) => SessionError::Version(self.version),
            Some(ResetCode::FlowControlError) => SessionError::FlowControl,
            _ => SessionError::Protocol,
        };

        // Streams we initiated past the peer's high-water mark never ran;
        // everything at or below it continues to completion.
        let local_parity = self.next_stream_id & 1;
        let mut doomed: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > f.last_stream_id && id & 1 == local_parity)
            .collect();
        doomed.sort_unstable();
        for id in doomed {
            if self.streams.contains_key(&id) {
                self.finish_stream(id, &Error::Session(err.clone()));
            }
        }
        // A session with nothing left in flight closes immediately;
        // otherwise the last finish_stream call closes the socket.
        if self.streams.is_empty() {
            self.close_socket();
        }
        Ok(())
    }

    fn handle_data(&mut self, buf: &[u8]) -> Result<(), Error> {
        let f = frame::parse_data(buf)?;
        trace!("spdy: rx DATA stream={} len={} fin={}", f.stream_id, f.data.len(), f.finished);

        // Data for unknown or already-finished streams is dropped before
        // any other check; a reset may have retired them with frames
        // still in flight.
        let Some(entry) = self.streams.get(&f.stream_id) else {
            return Ok(());
        };
        let state = entry.state.clone();
        let mut rx = state.lock_rx();
        if rx.finished {
            return Ok(());
        }

        // The receive pump could not buffer the whole frame.
        if frame::payload_length(buf) != f.data.len() {
            return Err(Error::Stream(StreamError::FlowControl(f.stream_id)));
        }
        // A stream may not flip between compressed and plain mid-flight.
        if rx.have_data && rx.compressed != f.compressed {
            return Err(Error::Stream(StreamError::Protocol(f.stream_id)));
        }
        rx.compressed = f.compressed;
        rx.have_data = true;
        rx.buffer.extend(f.data.iter().copied());
        rx.finished = f.finished;
        drop(rx);
        state.rx_cond.notify_all();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Stream finalisation and session teardown
    // -----------------------------------------------------------------

    fn send_reset(&self, stream_id: u32, reason: ResetCode) {
        debug!("spdy: tx RST_STREAM stream={stream_id} reason={reason:?}");
        self.handle.queues.push_control(Frame::RstStream(RstStreamFrame {
            version: self.version,
            stream_id,
            status: reason.to_code(),
        }));
    }

    /// The single deletion path. Removes the stream, finalises its
    /// children first (their parent link dies with this entry, so the
    /// recursion never walks back up), publishes the terminal error on
    /// both halves, unlinks from the parent, and closes the socket once
    /// go-away holds and the table has drained.
    fn finish_stream(&mut self, stream_id: u32, err: &Error) {
        let Some(entry) = self.streams.remove(&stream_id) else {
            return;
        };
        trace!("spdy: finishing stream {stream_id}: {err}");

        for child in &entry.children {
            self.finish_stream(*child, err);
        }

        {
            let mut rx = entry.state.lock_rx();
            if rx.error.is_none() {
                rx.error = Some(err.clone());
            }
        }
        entry.state.rx_cond.notify_all();
        {
            let mut tx = entry.state.lock_tx();
            if tx.error.is_none() {
                tx.error = Some(err.clone());
            }
        }
        entry.state.tx_cond.notify_all();

        if let Some(parent_id) = entry.parent
            && let Some(parent) = self.streams.get_mut(&parent_id)
        {
            parent.children.retain(|c| *c != stream_id);
        }

        if self.go_away && self.streams.is_empty() {
            self.close_socket();
        }
    }

    /// Fatal receive error: finish everything, stop the transmit pump,
    /// close the socket, and exit the dispatch loop.
    fn teardown(mut self, err: Error) -> Result<(), Error> {
        debug!("spdy: session teardown: {err}");
        // If we closed the socket ourselves after go-away drained the
        // table, the pump's read error is the expected end of the
        // connection, not a failure.
        let graceful = self.socket_closed;

        self.go_away = true;
        self.handle.go_away.latch();

        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            if self.streams.contains_key(&id) {
                self.finish_stream(id, &err);
            }
        }

        self.handle.queues.close();
        self.close_socket();

        match err {
            Error::Session(SessionError::GoAway) => Ok(()),
            Error::Session(SessionError::Io { .. }) if graceful => Ok(()),
            err => Err(err),
        }
    }

    fn close_socket(&mut self) {
        if !self.socket_closed {
            self.socket_closed = true;
            (self.shutdown)();
        }
    }
}
