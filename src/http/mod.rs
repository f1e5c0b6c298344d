//! HTTP-shaped types carried over SPDY streams.

pub mod header;
pub mod message;
pub mod method;
pub mod status;

pub use header::Headers;
pub use message::{Request, RequestExtra, Response};
pub use method::Method;
pub use status::StatusCode;
