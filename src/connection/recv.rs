//! Receive path: frame the inbound byte stream and feed the dispatcher.
//!
//! The pump reads one frame at a time: the 8-byte header, then the
//! payload, bounded by the configured frame buffer. An oversized frame
//! is delivered truncated (the dispatcher notices the length mismatch
//! and decides between a stream and a session error) and the remainder
//! is drained off the socket afterwards, preserving framing without
//! unbounded allocation. Every delivered buffer waits for the
//! dispatcher's accept/reject verdict before the next read.

use std::io::{self, BufReader, Read};
use std::sync::mpsc;

use log::trace;

use crate::error::Error;
use crate::frame::{self, HEADER_SIZE};

use super::Event;

pub(crate) fn recv_pump<R: Read>(reader: R, events: mpsc::Sender<Event>, max_frame: usize) {
    let mut r = BufReader::new(reader);
    // Never truncate below the frame header itself.
    let max_frame = max_frame.max(HEADER_SIZE);

    loop {
        let mut hdr = [0u8; HEADER_SIZE];
        if let Err(e) = r.read_exact(&mut hdr) {
            let _ = events.send(Event::RecvError(Error::from(e)));
            return;
        }

        let total = frame::payload_length(&hdr) + HEADER_SIZE;
        let take = total.min(max_frame);
        let mut buf = vec![0u8; take];
        buf[..HEADER_SIZE].copy_from_slice(&hdr);
        if take > HEADER_SIZE {
            if let Err(e) = r.read_exact(&mut buf[HEADER_SIZE..]) {
                let _ = events.send(Event::RecvError(Error::from(e)));
                return;
            }
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        if events.send(Event::Frame { buf, reply: reply_tx }).is_err() {
            return;
        }
        match reply_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // Session-level rejection: report it and stop reading.
                let _ = events.send(Event::RecvError(err));
                return;
            }
            Err(_) => return,
        }

        // Drain and discard the rest of an oversized frame before the
        // next header.
        let mut remaining = (total - take) as u64;
        while remaining > 0 {
            trace!("spdy: discarding {remaining} oversized frame bytes");
            match io::copy(&mut r.by_ref().take(remaining), &mut io::sink()) {
                Ok(0) => {
                    let _ = events.send(Event::RecvError(Error::from(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "transport closed mid-frame",
                    ))));
                    return;
                }
                Ok(n) => remaining -= n,
                Err(e) => {
                    let _ = events.send(Event::RecvError(Error::from(e)));
                    return;
                }
            }
        }
    }
}
