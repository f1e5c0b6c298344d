//! Per-stream state and the user-facing reader/writer surfaces.
//!
//! Each stream has two independently locked halves. The receive half is
//! written by the dispatcher and drained by whoever reads the body; the
//! transmit half is driven by the stream's writer and adjusted by the
//! dispatcher when WINDOW_UPDATE or SETTINGS arrive. Both halves carry a
//! condition variable so blocked surfaces wake when the dispatcher
//! publishes new state or a terminal error.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use log::{debug, trace};
use url::Url;

use crate::error::{Error, StreamError};
use crate::frame::{DataFrame, Frame, SynReplyFrame, WindowUpdateFrame};
use crate::http::{Headers, Method, Request, RequestExtra, Response, StatusCode};

use super::transmit::TxQueues;
use super::{Event, Handle};

/// Serves streams opened by the peer: the connection handler for ordinary
/// requests, or a parent stream's `child_handler` for pushes.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: Request, w: ResponseWriter);
}

impl<F> Handler for F
where
    F: Fn(Request, ResponseWriter) + Send + Sync + 'static,
{
    fn handle(&self, req: Request, w: ResponseWriter) {
        self(req, w)
    }
}

/// Request line and headers captured at stream creation, used for
/// SYN_STREAM emission on locally started streams.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub proto: String,
    pub headers: Headers,
}

/// Response line and headers published by the dispatcher on SYN_REPLY.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub status_text: String,
    pub proto: String,
    pub headers: Headers,
    pub content_length: Option<i64>,
}

/// Receive half, guarded by `StreamState::rx`.
#[derive(Debug, Default)]
pub(crate) struct RxHalf {
    pub buffer: VecDeque<u8>,
    pub response: Option<ResponseHead>,
    pub trailers: Headers,
    pub finished: bool,
    pub compressed: bool,
    pub have_data: bool,
    pub error: Option<Error>,
}

/// Transmit half, guarded by `StreamState::tx`.
#[derive(Debug)]
pub(crate) struct TxHalf {
    pub window: i32,
    pub finished: bool,
    pub priority: u8,
    pub compressed: bool,
    pub replied: bool,
    pub error: Option<Error>,
}

/// Construction parameters for a stream.
pub(crate) struct StreamInit {
    pub is_recipient: bool,
    pub head: RequestHead,
    pub child_handler: Option<Arc<dyn Handler>>,
    pub priority: u8,
    pub compressed: bool,
    pub window: i32,
    pub tx_finished: bool,
    pub rx_finished: bool,
}

/// Shared per-stream state. The dispatcher owns table membership and the
/// id; everything mutable lives under the two half-locks.
pub(crate) struct StreamState {
    id: AtomicU32,
    is_recipient: bool,
    head: RequestHead,
    child_handler: Option<Arc<dyn Handler>>,
    pub(crate) rx: Mutex<RxHalf>,
    pub(crate) rx_cond: Condvar,
    pub(crate) tx: Mutex<TxHalf>,
    pub(crate) tx_cond: Condvar,
}

/// Wait on a condition, tolerating a poisoned lock: a stream surface that
/// panicked must not wedge the engine's teardown path.
pub(crate) fn cond_wait<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
) -> MutexGuard<'a, T> {
    match cond.wait(guard) {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StreamState {
    pub(crate) fn new(init: StreamInit) -> Self {
        Self {
            id: AtomicU32::new(0),
            is_recipient: init.is_recipient,
            head: init.head,
            child_handler: init.child_handler,
            rx: Mutex::new(RxHalf {
                finished: init.rx_finished,
                ..RxHalf::default()
            }),
            rx_cond: Condvar::new(),
            tx: Mutex::new(TxHalf {
                window: init.window,
                finished: init.tx_finished,
                priority: init.priority.min(7),
                compressed: init.compressed,
                replied: false,
                error: None,
            }),
            tx_cond: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub(crate) fn is_recipient(&self) -> bool {
        self.is_recipient
    }

    pub(crate) fn head(&self) -> &RequestHead {
        &self.head
    }

    pub(crate) fn child_handler(&self) -> Option<Arc<dyn Handler>> {
        self.child_handler.clone()
    }

    pub(crate) fn lock_rx(&self) -> MutexGuard<'_, RxHalf> {
        lock(&self.rx)
    }

    pub(crate) fn lock_tx(&self) -> MutexGuard<'_, TxHalf> {
        lock(&self.tx)
    }

    /// Whether both directions were already finished, which keeps the
    /// stream out of the table entirely.
    pub(crate) fn finished_at_birth(&self) -> bool {
        let tx_finished = self.lock_tx().finished;
        tx_finished && self.lock_rx().finished
    }
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamState")
            .field("id", &self.id())
            .field("is_recipient", &self.is_recipient)
            .finish()
    }
}

/// Mark the transmit side finished, emitting the empty FIN data frame if
/// the stream had not already finished or failed.
pub(crate) fn close_tx(state: &Arc<StreamState>, queues: &TxQueues) {
    let fin = {
        let mut tx = state.lock_tx();
        if tx.finished || tx.error.is_some() {
            None
        } else {
            tx.finished = true;
            Some((tx.priority, tx.compressed))
        }
    };
    state.tx_cond.notify_all();
    if let Some((priority, compressed)) = fin {
        let frame = DataFrame {
            stream_id: state.id(),
            finished: true,
            compressed,
            data: Vec::new(),
        };
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        if queues.push_data(priority, frame, done_tx) {
            let _ = done_rx.recv();
        }
    }
}

/// Run an inbound handler on its own thread: serve, then close the
/// transmit side and notify the dispatcher that this end is done.
pub(crate) fn spawn_handler(
    handler: Arc<dyn Handler>,
    req: Request,
    state: Arc<StreamState>,
    handle: Handle,
) {
    thread::spawn(move || {
        let w = ResponseWriter {
            state: state.clone(),
            handle: handle.clone(),
        };
        let stream_id = state.id();
        if catch_unwind(AssertUnwindSafe(|| handler.handle(req, w))).is_err() {
            debug!("spdy: panic serving stream {stream_id}");
        }
        close_tx(&state, &handle.queues);
        let _ = handle.events.send(Event::StreamFinished { stream: state });
    });
}

// ---------------------------------------------------------------------------
// Reader surface
// ---------------------------------------------------------------------------

/// Blocking reader over a stream's receive buffer.
///
/// Consumed bytes are returned to the peer as WINDOW_UPDATE credit.
/// Dropping the response reader before the receive side finished cancels
/// the stream (RST_STREAM with CANCEL goes out).
pub struct StreamReader {
    state: Arc<StreamState>,
    handle: Handle,
    finish_on_drop: bool,
}

impl StreamReader {
    pub(crate) fn new(state: Arc<StreamState>, handle: Handle, finish_on_drop: bool) -> Self {
        Self {
            state,
            handle,
            finish_on_drop,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.state.id()
    }

    /// Trailer headers accumulated from HEADERS frames so far.
    pub fn trailers(&self) -> Headers {
        self.state.lock_rx().trailers.clone()
    }
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = {
            let mut rx = self.state.lock_rx();
            loop {
                if !rx.buffer.is_empty() {
                    break;
                }
                // A stream that finished cleanly reads EOF even if a
                // terminal error lands afterwards (e.g. its parent was
                // finalised); an unfinished stream surfaces the error.
                if rx.finished {
                    return Ok(0);
                }
                if let Some(err) = &rx.error {
                    return Err(err.clone().into());
                }
                rx = cond_wait(&self.state.rx_cond, rx);
            }
            let n = buf.len().min(rx.buffer.len());
            for (dst, b) in buf[..n].iter_mut().zip(rx.buffer.drain(..n)) {
                *dst = b;
            }
            n
        };
        // Return transmit credit for the consumed bytes.
        self.handle.queues.push_window(Frame::WindowUpdate(WindowUpdateFrame {
            version: self.handle.version,
            stream_id: self.state.id(),
            delta: n as i32,
        }));
        Ok(n)
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if self.finish_on_drop {
            let _ = self.handle.events.send(Event::StreamFinished {
                stream: self.state.clone(),
            });
        }
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamReader({})", self.state.id())
    }
}

// ---------------------------------------------------------------------------
// Writer surface
// ---------------------------------------------------------------------------

/// Blocking writer pushing DATA frames through the priority queues.
///
/// Writes claim transmit window first, sleeping on the tx condition until
/// WINDOW_UPDATE or SETTINGS replenish it, then wait for the transmit
/// pump to report the socket write result.
pub struct StreamWriter {
    state: Arc<StreamState>,
    handle: Handle,
}

impl StreamWriter {
    pub(crate) fn new(state: Arc<StreamState>, handle: Handle) -> Self {
        Self { state, handle }
    }

    pub fn stream_id(&self) -> u32 {
        self.state.id()
    }

    /// Finish the transmit side, sending the empty FIN frame.
    pub fn close(&mut self) {
        close_tx(&self.state, &self.handle.queues);
        // A stream whose receive side already finished has no surface
        // left to retire it; tell the dispatcher this end is done.
        if self.state.lock_rx().finished {
            let _ = self.handle.events.send(Event::StreamFinished {
                stream: self.state.clone(),
            });
        }
    }

    fn terminal_error(&self) -> io::Error {
        match &self.state.lock_tx().error {
            Some(err) => err.clone().into(),
            None => io::Error::new(io::ErrorKind::BrokenPipe, "connection transmit side closed"),
        }
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (n, priority, compressed) = {
            let mut tx = self.state.lock_tx();
            loop {
                if let Some(err) = &tx.error {
                    return Err(err.clone().into());
                }
                if tx.finished {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "stream transmit side closed",
                    ));
                }
                if tx.window > 0 {
                    break;
                }
                tx = cond_wait(&self.state.tx_cond, tx);
            }
            let n = buf.len().min(tx.window as usize);
            tx.window -= n as i32;
            (n, tx.priority, tx.compressed)
        };

        let frame = DataFrame {
            stream_id: self.state.id(),
            finished: false,
            compressed,
            data: buf[..n].to_vec(),
        };
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        if !self.handle.queues.push_data(priority, frame, done_tx) {
            return Err(self.terminal_error());
        }
        match done_rx.recv() {
            Ok(Ok(())) => Ok(n),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.terminal_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // The transmit pump flushes whenever its queues run dry.
        Ok(())
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamWriter({})", self.state.id())
    }
}

// ---------------------------------------------------------------------------
// Server response surface
// ---------------------------------------------------------------------------

/// Handed to a [`Handler`] for an inbound stream: reply, stream the
/// response body, and open associated push streams.
pub struct ResponseWriter {
    state: Arc<StreamState>,
    handle: Handle,
}

impl ResponseWriter {
    pub fn stream_id(&self) -> u32 {
        self.state.id()
    }

    /// Send SYN_REPLY with the given status and headers. May be called
    /// at most once; writing a body first implies `200 OK`.
    pub fn send_response(&mut self, status: StatusCode, headers: Headers) -> Result<(), Error> {
        let stream_id = self.state.id();
        {
            let mut tx = self.state.lock_tx();
            if let Some(err) = &tx.error {
                return Err(err.clone());
            }
            if tx.replied {
                return Err(Error::Stream(StreamError::Protocol(stream_id)));
            }
            tx.replied = true;
        }
        let frame = Frame::SynReply(SynReplyFrame {
            version: self.handle.version,
            stream_id,
            finished: false,
            status: status.status_line(),
            proto: "HTTP/1.1".to_string(),
            headers,
        });
        if !self.handle.queues.push_control(frame) {
            return Err(Error::Session(crate::error::SessionError::GoAway));
        }
        trace!("spdy: tx SYN_REPLY stream={stream_id} status={status}");
        Ok(())
    }

    /// Open a stream associated with this one (server push). The new
    /// stream's SYN_STREAM carries this stream's id as the associated id.
    pub fn push(&self, req: Request, extra: RequestExtra) -> Result<RequestStream, Error> {
        self.handle
            .start_request_with_parent(req, extra, Some(self.state.clone()))
    }

    /// Writer for the response body.
    pub fn body(&self) -> StreamWriter {
        StreamWriter::new(self.state.clone(), self.handle.clone())
    }
}

impl Write for ResponseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.state.lock_tx().replied {
            self.send_response(StatusCode::OK, Headers::new())
                .map_err(io::Error::from)?;
        }
        StreamWriter::new(self.state.clone(), self.handle.clone()).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponseWriter({})", self.state.id())
    }
}

// ---------------------------------------------------------------------------
// Client request surface
// ---------------------------------------------------------------------------

/// A locally started stream, returned by [`Handle::start_request`].
pub struct RequestStream {
    state: Arc<StreamState>,
    handle: Handle,
    expects_response: bool,
    response_taken: bool,
}

impl RequestStream {
    pub(crate) fn new(state: Arc<StreamState>, handle: Handle, expects_response: bool) -> Self {
        Self {
            state,
            handle,
            expects_response,
            response_taken: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.state.id()
    }

    /// Writer for the request body, when the request was started with
    /// `has_body`.
    pub fn writer(&self) -> Option<StreamWriter> {
        if self.state.lock_tx().finished {
            None
        } else {
            Some(StreamWriter::new(self.state.clone(), self.handle.clone()))
        }
    }

    /// Block until the peer replies, then hand back the response with its
    /// body reader. Dropping the body before EOF cancels the stream.
    pub fn response(&mut self) -> Result<Response, Error> {
        let stream_id = self.state.id();
        if self.response_taken {
            return Err(Error::Stream(StreamError::Protocol(stream_id)));
        }
        let head = {
            let mut rx = self.state.lock_rx();
            loop {
                if let Some(head) = rx.response.take() {
                    break head;
                }
                if let Some(err) = &rx.error {
                    return Err(err.clone());
                }
                if rx.finished {
                    // FIN landed without SYN_REPLY.
                    return Err(Error::Stream(StreamError::Protocol(stream_id)));
                }
                rx = cond_wait(&self.state.rx_cond, rx);
            }
        };
        self.response_taken = true;
        Ok(Response {
            status: head.status,
            status_text: head.status_text,
            proto: head.proto,
            headers: head.headers,
            content_length: head.content_length,
            body: StreamReader::new(self.state.clone(), self.handle.clone(), true),
        })
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        // Abandoning a stream whose response was never taken cancels it;
        // once the response is out, its body reader owns that duty.
        if self.expects_response && !self.response_taken {
            let _ = self.handle.events.send(Event::StreamFinished {
                stream: self.state.clone(),
            });
        }
    }
}

impl std::fmt::Debug for RequestStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestStream({})", self.state.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_handle;
    use crate::error::SessionError;

    fn test_state(window: i32) -> Arc<StreamState> {
        let state = Arc::new(StreamState::new(StreamInit {
            is_recipient: false,
            head: RequestHead {
                method: Method::GET,
                url: Url::parse("http://example.com/").unwrap(),
                proto: "HTTP/1.1".to_string(),
                headers: Headers::new(),
            },
            child_handler: None,
            priority: 1,
            compressed: false,
            window,
            tx_finished: false,
            rx_finished: false,
        }));
        state.set_id(1);
        state
    }

    #[test]
    fn reader_drains_then_eof() {
        let (handle, _events_rx) = test_handle();
        let state = test_state(64);
        {
            let mut rx = state.lock_rx();
            rx.buffer.extend(b"hello");
            rx.finished = true;
        }
        let mut r = StreamReader::new(state, handle, false);
        let mut buf = [0u8; 3];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(r.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn reader_surfaces_error_when_drained() {
        let (handle, _events_rx) = test_handle();
        let state = test_state(64);
        {
            let mut rx = state.lock_rx();
            rx.buffer.extend(b"x");
            rx.error = Some(Error::Session(SessionError::GoAway));
        }
        let mut r = StreamReader::new(state, handle, false);
        let mut buf = [0u8; 8];
        // Buffered bytes are served before the terminal error.
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        assert!(r.read(&mut buf).is_err());
    }

    fn pop_one_data(queues: &TxQueues) -> super::super::transmit::DataEntry {
        use super::super::transmit::{Pop, TxItem};
        loop {
            match queues.try_pop() {
                Pop::Item(TxItem::Data(entry)) => return entry,
                Pop::Item(_) => panic!("expected a data frame"),
                _ => thread::yield_now(),
            }
        }
    }

    #[test]
    fn writer_claims_at_most_window() {
        let (handle, _events_rx) = test_handle();
        let state = test_state(4);
        let queues = handle.queues.clone();
        let mut w = StreamWriter::new(state, handle);

        // Fake pump: acknowledge the one data frame the writer enqueues.
        let pump = thread::spawn(move || {
            let entry = pop_one_data(&queues);
            let len = entry.frame.data.len();
            let _ = entry.done.send(Ok(()));
            len
        });

        let n = w.write(b"0123456789").unwrap();
        assert_eq!(n, 4, "write must be clipped to the transmit window");
        assert_eq!(pump.join().unwrap(), 4);
    }

    #[test]
    fn writer_blocks_until_window_opens() {
        let (handle, _events_rx) = test_handle();
        let state = test_state(0);
        let queues = handle.queues.clone();
        let state2 = state.clone();

        let pump = thread::spawn(move || {
            // Open the window after a beat, then ack the resulting frame.
            thread::sleep(std::time::Duration::from_millis(20));
            {
                let mut tx = state2.lock_tx();
                tx.window += 8;
            }
            state2.tx_cond.notify_all();
            let entry = pop_one_data(&queues);
            let _ = entry.done.send(Ok(()));
        });

        let mut w = StreamWriter::new(state, handle);
        assert_eq!(w.write(b"abc").unwrap(), 3);
        pump.join().unwrap();
    }

    #[test]
    fn writer_observes_terminal_error() {
        let (handle, _events_rx) = test_handle();
        let state = test_state(0);
        {
            let mut tx = state.lock_tx();
            tx.error = Some(Error::Session(SessionError::GoAway));
        }
        let mut w = StreamWriter::new(state, handle);
        assert!(w.write(b"abc").is_err());
    }

    #[test]
    fn response_reader_drop_notifies_dispatcher() {
        let (handle, events_rx) = test_handle();
        let state = test_state(64);
        drop(StreamReader::new(state, handle, true));
        match events_rx.try_recv() {
            Ok(Event::StreamFinished { stream }) => assert_eq!(stream.id(), 1),
            other => panic!("expected StreamFinished, got {other:?}"),
        }
    }

    #[test]
    fn request_body_reader_drop_is_silent() {
        let (handle, events_rx) = test_handle();
        let state = test_state(64);
        drop(StreamReader::new(state, handle, false));
        assert!(events_rx.try_recv().is_err());
    }
}
