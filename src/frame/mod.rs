//! SPDY frame codec (drafts 2 and 3).
//!
//! Frames are an 8-byte header followed by a payload:
//! ```text
//!  Control:                          Data:
//!  +-+--------------+--------------+ +-+----------------------------+
//!  |1|  Version(15) |   Type(16)   | |0|        Stream-ID (31)      |
//!  +-+--------------+--------------+ +-+----------------------------+
//!  | Flags (8) |    Length (24)    | | Flags (8) |   Length (24)    |
//!  +-----------+-------------------+ +-----------+------------------+
//!  |            Payload            | |           Payload            |
//!  +-------------------------------+ +------------------------------+
//! ```
//! Header blocks inside SYN_STREAM, SYN_REPLY, and HEADERS are compressed
//! with the shared-dictionary zlib context in [`zip`]; the parse functions
//! take the connection's decompressor and `Frame::write` takes its
//! compressor, since the contexts persist across frames.

pub mod zip;

pub use zip::{Compressor, Decompressor};

use std::io::{self, Write};

use url::Url;

use crate::error::{Error, SessionError};
use crate::http::Headers;

// Control frame type codes (draft 3 §2.2).
pub const FRAME_SYN_STREAM: u16 = 1;
pub const FRAME_SYN_REPLY: u16 = 2;
pub const FRAME_RST_STREAM: u16 = 3;
pub const FRAME_SETTINGS: u16 = 4;
pub const FRAME_PING: u16 = 6;
pub const FRAME_GO_AWAY: u16 = 7;
pub const FRAME_HEADERS: u16 = 8;
pub const FRAME_WINDOW_UPDATE: u16 = 9;

// Flag bits.
pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_UNIDIRECTIONAL: u8 = 0x02;
pub const FLAG_DATA_COMPRESSED: u8 = 0x02;

/// SETTINGS id for the initial per-stream window (draft 3 §2.6.4).
pub const SETTINGS_INITIAL_WINDOW: u32 = 7;

/// On-wire frame header size.
pub const HEADER_SIZE: usize = 8;

/// Largest legal stream id (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

pub(crate) fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Whether the first 32 bits select a control frame.
pub fn is_control(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[0] & 0x80 != 0
}

/// Control type selector: the version bits of the first word are
/// dropped and only the low 16 bits remain.
pub fn control_kind(buf: &[u8]) -> u16 {
    (read_u32(buf) & 0xffff) as u16
}

/// Protocol version of a control frame header.
pub fn control_version(buf: &[u8]) -> u16 {
    (read_u32(buf) >> 16) as u16 & 0x7fff
}

/// The 24-bit payload length word of any frame header.
pub fn payload_length(buf: &[u8]) -> usize {
    (read_u32(&buf[4..]) & 0xff_ffff) as usize
}

fn short(buf: &[u8], need: usize) -> Result<(), Error> {
    if buf.len() < need {
        return Err(Error::Session(SessionError::Protocol));
    }
    Ok(())
}

fn check_version(version: u16) -> Result<(), Error> {
    match version {
        2 | 3 => Ok(()),
        v => Err(Error::Session(SessionError::Version(v))),
    }
}

// ---------------------------------------------------------------------------
// Frame structs
// ---------------------------------------------------------------------------

/// SYN_STREAM: open a new stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SynStreamFrame {
    pub version: u16,
    pub stream_id: u32,
    pub associated_stream_id: u32,
    pub finished: bool,
    pub unidirectional: bool,
    pub priority: u8,
    pub method: String,
    pub url: Url,
    pub proto: String,
    pub headers: Headers,
}

/// SYN_REPLY: response headers for a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SynReplyFrame {
    pub version: u16,
    pub stream_id: u32,
    pub finished: bool,
    /// Full status line, `"<code> <reason>"`.
    pub status: String,
    pub proto: String,
    pub headers: Headers,
}

/// HEADERS: additional header fields for an open stream.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadersFrame {
    pub version: u16,
    pub stream_id: u32,
    pub finished: bool,
    pub headers: Headers,
}

/// RST_STREAM: abort a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub version: u16,
    pub stream_id: u32,
    /// Raw status word; translate with `ResetCode::from_code`.
    pub status: u32,
}

/// One SETTINGS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: u32,
    pub flags: u8,
    pub value: u32,
}

/// SETTINGS: session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub version: u16,
    pub entries: Vec<Setting>,
}

impl SettingsFrame {
    /// The initial-window entry, if present.
    pub fn window(&self) -> Option<i32> {
        self.entries
            .iter()
            .rev()
            .find(|s| s.id == SETTINGS_INITIAL_WINDOW)
            .map(|s| s.value as i32)
    }

    pub fn have_window(&self) -> bool {
        self.window().is_some()
    }
}

/// PING: liveness probe; the recipient echoes peer-originated ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub version: u16,
    pub id: u32,
}

/// GO_AWAY: stop opening streams; drain and close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub version: u16,
    pub last_stream_id: u32,
    /// Raw status word (0 = SUCCESS). Always 0 for v2, which has no
    /// status field on the wire.
    pub status: u32,
}

/// WINDOW_UPDATE: return transmit credit to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub version: u16,
    pub stream_id: u32,
    pub delta: i32,
}

/// DATA: a chunk of stream body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub finished: bool,
    pub compressed: bool,
    pub data: Vec<u8>,
}

/// Tagged union over every frame type.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SynStream(SynStreamFrame),
    SynReply(SynReplyFrame),
    Headers(HeadersFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Data(DataFrame),
}

// ---------------------------------------------------------------------------
// Name/value header blocks
// ---------------------------------------------------------------------------

// v2 blocks use 16-bit counts and lengths, v3 32-bit. Multiple values for
// one name are joined with NUL bytes.

fn block_put_len(out: &mut Vec<u8>, version: u16, len: usize) {
    if version == 2 {
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        put_u32(out, len as u32);
    }
}

fn block_read_len(version: u16, buf: &[u8], pos: &mut usize) -> Result<usize, Error> {
    if version == 2 {
        short(buf, *pos + 2)?;
        let len = read_u16(&buf[*pos..]) as usize;
        *pos += 2;
        Ok(len)
    } else {
        short(buf, *pos + 4)?;
        let len = read_u32(&buf[*pos..]) as usize;
        *pos += 4;
        Ok(len)
    }
}

fn encode_header_block(version: u16, headers: &Headers) -> Vec<u8> {
    let mut out = Vec::new();
    block_put_len(&mut out, version, headers.len());
    for (name, values) in headers.iter() {
        block_put_len(&mut out, version, name.len());
        out.extend_from_slice(name.as_bytes());
        let joined = values.join("\0");
        block_put_len(&mut out, version, joined.len());
        out.extend_from_slice(joined.as_bytes());
    }
    out
}

fn parse_header_block(version: u16, buf: &[u8]) -> Result<Headers, Error> {
    let mut pos = 0;
    let count = block_read_len(version, buf, &mut pos)?;
    let mut headers = Headers::new();
    for _ in 0..count {
        let name_len = block_read_len(version, buf, &mut pos)?;
        short(buf, pos + name_len)?;
        let name = std::str::from_utf8(&buf[pos..pos + name_len])
            .map_err(|_| Error::Session(SessionError::Protocol))?
            .to_string();
        pos += name_len;
        if name.is_empty() {
            return Err(Error::Session(SessionError::Protocol));
        }

        let value_len = block_read_len(version, buf, &mut pos)?;
        short(buf, pos + value_len)?;
        let value = std::str::from_utf8(&buf[pos..pos + value_len])
            .map_err(|_| Error::Session(SessionError::Protocol))?;
        pos += value_len;
        for part in value.split('\0') {
            headers.add(&name, part);
        }
    }
    Ok(headers)
}

// Special header names folding request/response lines into the block.
fn special(version: u16, name: &str) -> String {
    if version == 2 {
        name.to_string()
    } else {
        format!(":{name}")
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a SYN_STREAM buffer (full frame, header included).
pub fn parse_syn_stream(buf: &[u8], unzip: &mut Decompressor) -> Result<SynStreamFrame, Error> {
    short(buf, HEADER_SIZE + 10)?;
    let version = control_version(buf);
    check_version(version)?;
    let flags = buf[4];
    let stream_id = read_u32(&buf[8..]) & MAX_STREAM_ID;
    let associated_stream_id = read_u32(&buf[12..]) & MAX_STREAM_ID;
    // v2 carries the priority in the top 2 bits, v3 in the top 3.
    let priority = if version == 2 { buf[16] >> 6 } else { buf[16] >> 5 };

    let block = unzip.decompress(&buf[18..])?;
    let mut headers = parse_header_block(version, &block)?;

    let method = headers
        .remove(&special(version, "method"))
        .and_then(|v| v.into_iter().next())
        .ok_or(Error::Session(SessionError::Protocol))?;
    let scheme = headers
        .remove(&special(version, "scheme"))
        .and_then(|v| v.into_iter().next())
        .unwrap_or_else(|| "http".to_string());
    let host = headers
        .remove(&special(version, "host"))
        .and_then(|v| v.into_iter().next())
        .ok_or(Error::Session(SessionError::Protocol))?;
    let path_key = if version == 2 { "url" } else { ":path" };
    let path = headers
        .remove(path_key)
        .and_then(|v| v.into_iter().next())
        .ok_or(Error::Session(SessionError::Protocol))?;
    let proto = headers
        .remove(&special(version, "version"))
        .and_then(|v| v.into_iter().next())
        .unwrap_or_else(|| "HTTP/1.1".to_string());

    let url = Url::parse(&format!("{scheme}://{host}{path}"))
        .map_err(|_| Error::Session(SessionError::Protocol))?;

    Ok(SynStreamFrame {
        version,
        stream_id,
        associated_stream_id,
        finished: flags & FLAG_FIN != 0,
        unidirectional: flags & FLAG_UNIDIRECTIONAL != 0,
        priority,
        method,
        url,
        proto,
        headers,
    })
}

/// Parse a SYN_REPLY buffer.
pub fn parse_syn_reply(buf: &[u8], unzip: &mut Decompressor) -> Result<SynReplyFrame, Error> {
    short(buf, HEADER_SIZE + 4)?;
    let version = control_version(buf);
    check_version(version)?;
    let flags = buf[4];
    let stream_id = read_u32(&buf[8..]) & MAX_STREAM_ID;
    // v2 has two unused bytes between the stream id and the block.
    let block_start = if version == 2 { 14 } else { 12 };
    short(buf, block_start)?;

    let block = unzip.decompress(&buf[block_start..])?;
    let mut headers = parse_header_block(version, &block)?;

    let status = headers
        .remove(&special(version, "status"))
        .and_then(|v| v.into_iter().next())
        .ok_or(Error::Session(SessionError::Protocol))?;
    let proto = headers
        .remove(&special(version, "version"))
        .and_then(|v| v.into_iter().next())
        .unwrap_or_else(|| "HTTP/1.1".to_string());

    Ok(SynReplyFrame {
        version,
        stream_id,
        finished: flags & FLAG_FIN != 0,
        status,
        proto,
        headers,
    })
}

/// Parse a HEADERS buffer.
pub fn parse_headers(buf: &[u8], unzip: &mut Decompressor) -> Result<HeadersFrame, Error> {
    short(buf, HEADER_SIZE + 4)?;
    let version = control_version(buf);
    check_version(version)?;
    let flags = buf[4];
    let stream_id = read_u32(&buf[8..]) & MAX_STREAM_ID;
    let block_start = if version == 2 { 14 } else { 12 };
    short(buf, block_start)?;

    let block = unzip.decompress(&buf[block_start..])?;
    let headers = parse_header_block(version, &block)?;

    Ok(HeadersFrame {
        version,
        stream_id,
        finished: flags & FLAG_FIN != 0,
        headers,
    })
}

/// Parse a RST_STREAM buffer.
pub fn parse_rst_stream(buf: &[u8]) -> Result<RstStreamFrame, Error> {
    short(buf, HEADER_SIZE + 8)?;
    let version = control_version(buf);
    check_version(version)?;
    Ok(RstStreamFrame {
        version,
        stream_id: read_u32(&buf[8..]) & MAX_STREAM_ID,
        status: read_u32(&buf[12..]),
    })
}

/// Parse a SETTINGS buffer.
pub fn parse_settings(buf: &[u8]) -> Result<SettingsFrame, Error> {
    short(buf, HEADER_SIZE + 4)?;
    let version = control_version(buf);
    check_version(version)?;
    let count = read_u32(&buf[8..]) as usize;
    let mut pos = 12;
    short(buf, pos + count * 8)?;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let e = &buf[pos..pos + 8];
        // v2 stores the id in the first three bytes little-endian with the
        // flags byte last (the draft 2 byte-order quirk); v3 leads with the
        // flags byte and a big-endian id.
        let (id, flags) = if version == 2 {
            (
                u32::from_le_bytes([e[0], e[1], e[2], 0]),
                e[3],
            )
        } else {
            (read_u32(e) & 0xff_ffff, e[0])
        };
        entries.push(Setting {
            id,
            flags,
            value: read_u32(&e[4..]),
        });
        pos += 8;
    }

    Ok(SettingsFrame { version, entries })
}

/// Parse a PING buffer.
pub fn parse_ping(buf: &[u8]) -> Result<PingFrame, Error> {
    short(buf, HEADER_SIZE + 4)?;
    let version = control_version(buf);
    check_version(version)?;
    Ok(PingFrame {
        version,
        id: read_u32(&buf[8..]),
    })
}

/// Parse a GO_AWAY buffer.
pub fn parse_go_away(buf: &[u8]) -> Result<GoAwayFrame, Error> {
    short(buf, HEADER_SIZE + 4)?;
    let version = control_version(buf);
    check_version(version)?;
    let last_stream_id = read_u32(&buf[8..]) & MAX_STREAM_ID;
    // v2 has no status word.
    let status = if version >= 3 && buf.len() >= HEADER_SIZE + 8 {
        read_u32(&buf[12..])
    } else {
        0
    };
    Ok(GoAwayFrame {
        version,
        last_stream_id,
        status,
    })
}

/// Parse a WINDOW_UPDATE buffer.
pub fn parse_window_update(buf: &[u8]) -> Result<WindowUpdateFrame, Error> {
    short(buf, HEADER_SIZE + 8)?;
    let version = control_version(buf);
    check_version(version)?;
    Ok(WindowUpdateFrame {
        version,
        stream_id: read_u32(&buf[8..]) & MAX_STREAM_ID,
        delta: (read_u32(&buf[12..]) & MAX_STREAM_ID) as i32,
    })
}

/// Parse a DATA buffer. The payload is whatever was delivered; callers
/// compare against [`payload_length`] to detect truncation.
pub fn parse_data(buf: &[u8]) -> Result<DataFrame, Error> {
    short(buf, HEADER_SIZE)?;
    let flags = buf[4];
    Ok(DataFrame {
        stream_id: read_u32(buf) & MAX_STREAM_ID,
        finished: flags & FLAG_FIN != 0,
        compressed: flags & FLAG_DATA_COMPRESSED != 0,
        data: buf[8..].to_vec(),
    })
}

/// Parse any frame, classifying by the first 32 bits. Unknown control
/// types return `None`.
pub fn parse_frame(buf: &[u8], unzip: &mut Decompressor) -> Result<Option<Frame>, Error> {
    short(buf, HEADER_SIZE)?;
    if !is_control(buf) {
        return Ok(Some(Frame::Data(parse_data(buf)?)));
    }
    let frame = match control_kind(buf) {
        FRAME_SYN_STREAM => Frame::SynStream(parse_syn_stream(buf, unzip)?),
        FRAME_SYN_REPLY => Frame::SynReply(parse_syn_reply(buf, unzip)?),
        FRAME_HEADERS => Frame::Headers(parse_headers(buf, unzip)?),
        FRAME_RST_STREAM => Frame::RstStream(parse_rst_stream(buf)?),
        FRAME_SETTINGS => Frame::Settings(parse_settings(buf)?),
        FRAME_PING => Frame::Ping(parse_ping(buf)?),
        FRAME_GO_AWAY => Frame::GoAway(parse_go_away(buf)?),
        FRAME_WINDOW_UPDATE => Frame::WindowUpdate(parse_window_update(buf)?),
        _ => return Ok(None),
    };
    Ok(Some(frame))
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn write_control<W: Write>(
    w: &mut W,
    version: u16,
    kind: u16,
    flags: u8,
    payload: &[u8],
) -> io::Result<()> {
    let mut hdr = [0u8; HEADER_SIZE];
    hdr[0] = 0x80 | ((version >> 8) as u8 & 0x7f);
    hdr[1] = version as u8;
    hdr[2] = (kind >> 8) as u8;
    hdr[3] = kind as u8;
    hdr[4] = flags;
    hdr[5] = (payload.len() >> 16) as u8;
    hdr[6] = (payload.len() >> 8) as u8;
    hdr[7] = payload.len() as u8;
    w.write_all(&hdr)?;
    w.write_all(payload)
}

impl Frame {
    /// Serialise this frame to `w`, compressing header blocks through the
    /// connection's persistent compressor.
    pub fn write<W: Write>(&self, w: &mut W, zip: &mut Compressor) -> io::Result<()> {
        match self {
            Frame::SynStream(f) => {
                let mut headers = f.headers.clone();
                headers.set(&special(f.version, "method"), f.method.clone());
                headers.set(&special(f.version, "scheme"), f.url.scheme());
                let host = match (f.url.host_str(), f.url.port()) {
                    (Some(h), Some(p)) => format!("{h}:{p}"),
                    (Some(h), None) => h.to_string(),
                    (None, _) => String::new(),
                };
                headers.set(&special(f.version, "host"), host);
                let path_key = if f.version == 2 { "url" } else { ":path" };
                let mut path = f.url.path().to_string();
                if let Some(q) = f.url.query() {
                    path.push('?');
                    path.push_str(q);
                }
                headers.set(path_key, path);
                headers.set(&special(f.version, "version"), f.proto.clone());

                let block = zip.compress(&encode_header_block(f.version, &headers))?;
                let mut payload = Vec::with_capacity(10 + block.len());
                put_u32(&mut payload, f.stream_id & MAX_STREAM_ID);
                put_u32(&mut payload, f.associated_stream_id & MAX_STREAM_ID);
                payload.push(if f.version == 2 {
                    (f.priority & 0x3) << 6
                } else {
                    (f.priority & 0x7) << 5
                });
                payload.push(0); // v3 credential slot; unused in v2
                payload.extend_from_slice(&block);

                let mut flags = 0u8;
                if f.finished {
                    flags |= FLAG_FIN;
                }
                if f.unidirectional {
                    flags |= FLAG_UNIDIRECTIONAL;
                }
                write_control(w, f.version, FRAME_SYN_STREAM, flags, &payload)
            }
            Frame::SynReply(f) => {
                let mut headers = f.headers.clone();
                headers.set(&special(f.version, "status"), f.status.clone());
                headers.set(&special(f.version, "version"), f.proto.clone());

                let block = zip.compress(&encode_header_block(f.version, &headers))?;
                let mut payload = Vec::with_capacity(6 + block.len());
                put_u32(&mut payload, f.stream_id & MAX_STREAM_ID);
                if f.version == 2 {
                    payload.extend_from_slice(&[0, 0]);
                }
                payload.extend_from_slice(&block);

                let flags = if f.finished { FLAG_FIN } else { 0 };
                write_control(w, f.version, FRAME_SYN_REPLY, flags, &payload)
            }
            Frame::Headers(f) => {
                let block = zip.compress(&encode_header_block(f.version, &f.headers))?;
                let mut payload = Vec::with_capacity(6 + block.len());
                put_u32(&mut payload, f.stream_id & MAX_STREAM_ID);
                if f.version == 2 {
                    payload.extend_from_slice(&[0, 0]);
                }
                payload.extend_from_slice(&block);

                let flags = if f.finished { FLAG_FIN } else { 0 };
                write_control(w, f.version, FRAME_HEADERS, flags, &payload)
            }
            Frame::RstStream(f) => {
                let mut payload = Vec::with_capacity(8);
                put_u32(&mut payload, f.stream_id & MAX_STREAM_ID);
                put_u32(&mut payload, f.status);
                write_control(w, f.version, FRAME_RST_STREAM, 0, &payload)
            }
            Frame::Settings(f) => {
                let mut payload = Vec::with_capacity(4 + f.entries.len() * 8);
                put_u32(&mut payload, f.entries.len() as u32);
                for s in &f.entries {
                    if f.version == 2 {
                        let id = s.id.to_le_bytes();
                        payload.extend_from_slice(&[id[0], id[1], id[2], s.flags]);
                    } else {
                        let id = s.id & 0xff_ffff;
                        payload.push(s.flags);
                        payload.push((id >> 16) as u8);
                        payload.push((id >> 8) as u8);
                        payload.push(id as u8);
                    }
                    put_u32(&mut payload, s.value);
                }
                write_control(w, f.version, FRAME_SETTINGS, 0, &payload)
            }
            Frame::Ping(f) => {
                let mut payload = Vec::with_capacity(4);
                put_u32(&mut payload, f.id);
                write_control(w, f.version, FRAME_PING, 0, &payload)
            }
            Frame::GoAway(f) => {
                let mut payload = Vec::with_capacity(8);
                put_u32(&mut payload, f.last_stream_id & MAX_STREAM_ID);
                if f.version >= 3 {
                    put_u32(&mut payload, f.status);
                }
                write_control(w, f.version, FRAME_GO_AWAY, 0, &payload)
            }
            Frame::WindowUpdate(f) => {
                let mut payload = Vec::with_capacity(8);
                put_u32(&mut payload, f.stream_id & MAX_STREAM_ID);
                put_u32(&mut payload, f.delta as u32 & MAX_STREAM_ID);
                write_control(w, f.version, FRAME_WINDOW_UPDATE, 0, &payload)
            }
            Frame::Data(f) => {
                let mut hdr = [0u8; HEADER_SIZE];
                let id = f.stream_id & MAX_STREAM_ID;
                hdr[0..4].copy_from_slice(&id.to_be_bytes());
                let mut flags = 0u8;
                if f.finished {
                    flags |= FLAG_FIN;
                }
                if f.compressed {
                    flags |= FLAG_DATA_COMPRESSED;
                }
                hdr[4] = flags;
                hdr[5] = (f.data.len() >> 16) as u8;
                hdr[6] = (f.data.len() >> 8) as u8;
                hdr[7] = f.data.len() as u8;
                w.write_all(&hdr)?;
                w.write_all(&f.data)
            }
        }
    }
}
