//! Request and response messages carried over SPDY streams.

use std::net::SocketAddr;
use std::sync::Arc;

use url::Url;

use crate::connection::stream::{Handler, StreamReader};
use crate::connection::TlsState;
use crate::http::{Headers, Method, StatusCode};

/// A request, either to be sent on a new outgoing stream or delivered to
/// a handler for an incoming one.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    /// Protocol string carried in the header block, e.g. `"HTTP/1.1"`.
    pub proto: String,
    pub headers: Headers,
    /// Parsed `Content-Length`, when the header is present and numeric.
    pub content_length: Option<i64>,
    /// Request body. Present on received requests whose sender did not
    /// finish the stream at open.
    pub body: Option<StreamReader>,
    /// Peer address, filled in on received requests.
    pub remote_addr: Option<SocketAddr>,
    /// TLS state snapshot, filled in on received requests over TLS.
    pub tls: Option<TlsState>,
}

impl Request {
    /// Build an outgoing request with no headers or body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            proto: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            content_length: None,
            body: None,
            remote_addr: None,
            tls: None,
        }
    }
}

/// A response delivered to the requestor once SYN_REPLY lands.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    /// The full status line as received, e.g. `"200 OK"`.
    pub status_text: String,
    pub proto: String,
    pub headers: Headers,
    /// Parsed `Content-Length`, when the header is present and numeric.
    pub content_length: Option<i64>,
    pub body: StreamReader,
}

/// Per-request knobs for `start_request`.
#[derive(Clone, Default)]
pub struct RequestExtra {
    /// Transmit priority, 0 (highest) through 7 (lowest).
    pub priority: u8,
    /// Declare the stream unidirectional: no response is expected.
    pub unidirectional: bool,
    /// Send the request body in compressed DATA frames.
    pub compressed: bool,
    /// The request will stream a body; leaves the transmit side open so
    /// `RequestStream::writer` can send it.
    pub has_body: bool,
    /// Handler for streams the peer associates with this one.
    pub child_handler: Option<Arc<dyn Handler>>,
}

impl std::fmt::Debug for RequestExtra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExtra")
            .field("priority", &self.priority)
            .field("unidirectional", &self.unidirectional)
            .field("compressed", &self.compressed)
            .field("has_body", &self.has_body)
            .field("child_handler", &self.child_handler.is_some())
            .finish()
    }
}

/// Parse `Content-Length` out of a header set when present and numeric.
pub(crate) fn content_length_from(headers: &Headers) -> Option<i64> {
    headers.get("content-length")?.parse().ok()
}
