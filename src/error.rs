//! Error model: stream-level errors reset one stream, session-level errors
//! abort the whole connection.

use std::io;

/// RST_STREAM status codes (SPDY draft 3 §2.4.2).
///
/// `InternalError` doubles as the translation of GO_AWAY's `SUCCESS` (0)
/// reason word, which shares the code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResetCode {
    ProtocolError = 1,
    InvalidStream = 2,
    RefusedStream = 3,
    UnsupportedVersion = 4,
    Cancel = 5,
    InternalError = 6,
    FlowControlError = 7,
    StreamInUse = 8,
    StreamAlreadyClosed = 9,
}

impl ResetCode {
    /// Convert a reset code to its wire status word.
    pub const fn to_code(self) -> u32 {
        self as u32
    }

    /// Parse a wire status word into a `ResetCode`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::ProtocolError),
            2 => Some(Self::InvalidStream),
            3 => Some(Self::RefusedStream),
            4 => Some(Self::UnsupportedVersion),
            5 => Some(Self::Cancel),
            6 => Some(Self::InternalError),
            7 => Some(Self::FlowControlError),
            8 => Some(Self::StreamInUse),
            9 => Some(Self::StreamAlreadyClosed),
            _ => None,
        }
    }
}

/// An error scoped to a single stream. Produced locally by inbound
/// processing failures (and then echoed to the peer as RST_STREAM), or
/// received from the peer as RST_STREAM. Finalises exactly one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// Peer violated the stream protocol state machine.
    Protocol(u32),
    /// Frame referenced a stream that does not exist.
    InvalidStream(u32),
    /// No handler was available to accept the stream.
    RefusedStream(u32),
    /// Frame version did not match the connection version.
    Version { stream_id: u32, version: u16 },
    /// Stream was cancelled before its receive side finished.
    Cancel(u32),
    /// Per-stream flow control was violated (e.g. truncated DATA).
    FlowControl(u32),
    /// Peer reopened a stream id that is already in the table.
    InUse(u32),
    /// Frame arrived for a direction that already finished.
    AlreadyClosed(u32),
    /// SYN_STREAM referenced an associated stream that is not ours or
    /// no longer open.
    InvalidAssociatedStream { stream_id: u32, associated_id: u32 },
}

impl StreamError {
    /// The stream this error finalises.
    pub fn stream_id(&self) -> u32 {
        match *self {
            Self::Protocol(id)
            | Self::InvalidStream(id)
            | Self::RefusedStream(id)
            | Self::Cancel(id)
            | Self::FlowControl(id)
            | Self::InUse(id)
            | Self::AlreadyClosed(id) => id,
            Self::Version { stream_id, .. } => stream_id,
            Self::InvalidAssociatedStream { stream_id, .. } => stream_id,
        }
    }

    /// The RST_STREAM status word emitted for this error.
    pub fn reset_code(&self) -> ResetCode {
        match self {
            Self::Protocol(_) => ResetCode::ProtocolError,
            Self::InvalidStream(_) => ResetCode::InvalidStream,
            Self::RefusedStream(_) => ResetCode::RefusedStream,
            Self::Version { .. } => ResetCode::UnsupportedVersion,
            Self::Cancel(_) => ResetCode::Cancel,
            Self::FlowControl(_) => ResetCode::FlowControlError,
            Self::InUse(_) => ResetCode::StreamInUse,
            Self::AlreadyClosed(_) => ResetCode::StreamAlreadyClosed,
            Self::InvalidAssociatedStream { .. } => ResetCode::InvalidStream,
        }
    }

    /// Translate a received RST_STREAM status word into the error that
    /// finalises the stream locally. `InternalError` and `ProtocolError`
    /// both land on `Protocol`.
    pub fn from_reset_code(code: ResetCode, stream_id: u32, version: u16) -> Self {
        match code {
            ResetCode::InvalidStream => Self::InvalidStream(stream_id),
            ResetCode::RefusedStream => Self::RefusedStream(stream_id),
            ResetCode::UnsupportedVersion => Self::Version { stream_id, version },
            ResetCode::Cancel => Self::Cancel(stream_id),
            ResetCode::FlowControlError => Self::FlowControl(stream_id),
            ResetCode::StreamInUse => Self::InUse(stream_id),
            ResetCode::StreamAlreadyClosed => Self::AlreadyClosed(stream_id),
            ResetCode::ProtocolError | ResetCode::InternalError => Self::Protocol(stream_id),
        }
    }
}

/// An error that aborts the entire connection: every stream is finished
/// with it, the go-away flag latches, the transmit pump drains out, and
/// the socket closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Peer violated session-level protocol rules.
    Protocol,
    /// Session-level frame carried the wrong protocol version.
    Version(u16),
    /// Session-level flow control was violated (e.g. a control frame
    /// whose length word disagrees with the delivered buffer).
    FlowControl,
    /// The connection is going away; no further streams may start.
    GoAway,
    /// Transport read or write failure, captured in cloneable form so
    /// every waiting stream surface can observe it.
    Io { kind: io::ErrorKind, message: String },
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Top-level crate error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Finalises exactly one stream.
    Stream(StreamError),
    /// Aborts the connection.
    Session(SessionError),
}

impl Error {
    /// Whether this error is session-fatal.
    pub fn is_session(&self) -> bool {
        matches!(self, Error::Session(_))
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Error::Stream(e)
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        Error::Session(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Session(SessionError::from(e))
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Stream(StreamError::Cancel(_)) => io::ErrorKind::ConnectionAborted,
            Error::Session(SessionError::Io { kind, .. }) => *kind,
            Error::Session(SessionError::GoAway) => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e.to_string())
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(id) => write!(f, "stream {id}: protocol error"),
            Self::InvalidStream(id) => write!(f, "stream {id}: invalid stream"),
            Self::RefusedStream(id) => write!(f, "stream {id}: refused"),
            Self::Version { stream_id, version } => {
                write!(f, "stream {stream_id}: unsupported version {version}")
            }
            Self::Cancel(id) => write!(f, "stream {id}: cancelled"),
            Self::FlowControl(id) => write!(f, "stream {id}: flow control error"),
            Self::InUse(id) => write!(f, "stream {id}: already in use"),
            Self::AlreadyClosed(id) => write!(f, "stream {id}: already closed"),
            Self::InvalidAssociatedStream { stream_id, associated_id } => {
                write!(f, "stream {stream_id}: invalid associated stream {associated_id}")
            }
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol => write!(f, "session protocol error"),
            Self::Version(v) => write!(f, "session: unsupported version {v}"),
            Self::FlowControl => write!(f, "session flow control error"),
            Self::GoAway => write!(f, "connection is going away"),
            Self::Io { message, .. } => write!(f, "transport error: {message}"),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Stream(e) => e.fmt(f),
            Error::Session(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for StreamError {}
impl std::error::Error for SessionError {}
impl std::error::Error for Error {}
