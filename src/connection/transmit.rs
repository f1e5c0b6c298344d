//! Transmit path: prioritised outbound queues and the transmit pump.
//!
//! Outbound frames sit in three tiers: the control queue (highest), the
//! window-update queue, then eight data queues indexed by priority (0
//! highest, 7 lowest). The pump probes them in strict priority order
//! without blocking; only when every queue is empty does it flush the
//! buffered writer and block for more work. Strict priority is
//! best-effort and may starve low priorities.

use std::collections::VecDeque;
use std::io::{self, BufWriter, Write};
use std::sync::mpsc::SyncSender;
use std::sync::{Condvar, Mutex};

use log::{debug, trace};

use crate::frame::{Compressor, DataFrame, Frame};

/// A queued data frame plus the one-shot channel on which the pump
/// reports the socket write result to the originating stream writer.
pub(crate) struct DataEntry {
    pub frame: DataFrame,
    pub done: SyncSender<io::Result<()>>,
}

/// One item selected for transmission.
pub(crate) enum TxItem {
    Control(Frame),
    Window(Frame),
    Data(DataEntry),
}

/// Result of a non-blocking probe across all queues.
pub(crate) enum Pop {
    Item(TxItem),
    /// Control queue drained and closed: the pump exits. Anything left
    /// in the lower tiers is dropped, which fails their completions.
    Closed,
    Empty,
}

#[derive(Default)]
struct TxInner {
    control: VecDeque<Frame>,
    window: VecDeque<Frame>,
    data: [VecDeque<DataEntry>; 8],
    closed: bool,
}

impl TxInner {
    fn is_empty(&self) -> bool {
        self.control.is_empty()
            && self.window.is_empty()
            && self.data.iter().all(VecDeque::is_empty)
    }
}

/// The three outbound queue tiers, shared between the dispatcher, the
/// per-stream surfaces, and the transmit pump.
pub(crate) struct TxQueues {
    inner: Mutex<TxInner>,
    cond: Condvar,
}

impl TxQueues {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TxInner::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TxInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enqueue a control frame. Returns false once the session closed.
    pub(crate) fn push_control(&self, frame: Frame) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.control.push_back(frame);
        drop(inner);
        self.cond.notify_one();
        true
    }

    /// Enqueue a window-update frame.
    pub(crate) fn push_window(&self, frame: Frame) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.window.push_back(frame);
        drop(inner);
        self.cond.notify_one();
        true
    }

    /// Enqueue a data frame at the given priority with its completion.
    pub(crate) fn push_data(&self, priority: u8, frame: DataFrame, done: SyncSender<io::Result<()>>) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.data[priority.min(7) as usize].push_back(DataEntry { frame, done });
        drop(inner);
        self.cond.notify_one();
        true
    }

    /// Close the queues: the pump drains remaining control frames and
    /// exits. Pending window and data frames are dropped here, failing
    /// their completion channels so blocked writers observe teardown.
    /// Called exactly once, by session teardown.
    pub(crate) fn close(&self) {
        let dropped: Vec<DataEntry> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.window.clear();
            inner.data.iter_mut().flat_map(|q| q.drain(..)).collect()
        };
        drop(dropped);
        self.cond.notify_all();
    }

    /// One non-blocking probe in strict priority order.
    pub(crate) fn try_pop(&self) -> Pop {
        let mut inner = self.lock();
        if let Some(f) = inner.control.pop_front() {
            return Pop::Item(TxItem::Control(f));
        }
        if inner.closed {
            return Pop::Closed;
        }
        if let Some(f) = inner.window.pop_front() {
            return Pop::Item(TxItem::Window(f));
        }
        for queue in inner.data.iter_mut() {
            if let Some(entry) = queue.pop_front() {
                return Pop::Item(TxItem::Data(entry));
            }
        }
        Pop::Empty
    }

    /// Block until any queue holds work or the session closes.
    fn wait_any(&self) {
        let mut inner = self.lock();
        while inner.is_empty() && !inner.closed {
            inner = match self.cond.wait(inner) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

/// Select the next frame to send. When every queue is empty, flush the
/// buffered writer before blocking so queued bytes reach the wire.
fn next_tx_item<W: Write>(queues: &TxQueues, buf: &mut BufWriter<W>) -> Option<TxItem> {
    loop {
        match queues.try_pop() {
            Pop::Item(item) => return Some(item),
            Pop::Closed => return None,
            Pop::Empty => {
                if let Err(e) = buf.flush() {
                    debug!("spdy: flush failed: {e}");
                }
                queues.wait_any();
            }
        }
    }
}

/// The transmit pump. Owns the socket's write half, the buffered writer
/// over it, and the persistent header compressor. Runs until the control
/// queue is closed and drained.
pub(crate) fn tx_pump<W: Write>(writer: W, queues: &TxQueues, version: u16) {
    let mut buf = BufWriter::new(writer);
    let mut zip = Compressor::new(version);

    while let Some(item) = next_tx_item(queues, &mut buf) {
        match item {
            TxItem::Control(frame) | TxItem::Window(frame) => {
                trace!("spdy: tx control {frame:?}");
                // Write failures surface through the receive side when
                // the peer tears the transport down.
                if let Err(e) = frame.write(&mut buf, &mut zip) {
                    debug!("spdy: control write failed: {e}");
                }
            }
            TxItem::Data(entry) => {
                let result = Frame::Data(entry.frame).write(&mut buf, &mut zip);
                let _ = entry.done.send(result);
            }
        }
    }
    let _ = buf.flush();
    trace!("spdy: transmit pump exiting");
}
