//! SPDY/2 and SPDY/3 connection engine.
//!
//! One [`Connection`] multiplexes many concurrent request/response
//! streams over a single reliable transport. Three cooperative tasks run
//! per connection: a receive pump framing inbound bytes, a transmit pump
//! draining prioritised outbound queues through the shared zlib header
//! compressor, and a dispatcher that owns the stream table and enforces
//! the protocol state machine, including per-stream flow control,
//! server-push associations, and orderly go-away shutdown.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::io::Read;
//!
//! use milli_spdy::{Config, Connection, Method, Request, RequestExtra, Role, Socket};
//!
//! let tcp = TcpStream::connect("example.com:443")?;
//! let conn = Connection::new(Socket::from_tcp(tcp)?, None, Role::Client, Config::default());
//! let handle = conn.handle();
//! std::thread::spawn(move || conn.run());
//!
//! let url = url::Url::parse("https://example.com/").unwrap();
//! let mut stream = handle.start_request(Request::new(Method::GET, url), RequestExtra::default())?;
//! let mut response = stream.response()?;
//! let mut body = String::new();
//! response.body.read_to_string(&mut body)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]

pub mod connection;
pub mod error;
pub mod frame;
pub mod http;

pub use connection::{
    Config, Connection, Handle, Handler, RequestStream, ResponseWriter, Role, Socket,
    StreamReader, StreamWriter, TlsState, Version,
};
pub use error::{Error, ResetCode, SessionError, StreamError};
pub use http::{Headers, Method, Request, RequestExtra, Response, StatusCode};
