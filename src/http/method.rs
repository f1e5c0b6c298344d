//! HTTP request methods (RFC 9110 §9).

/// HTTP request method.
///
/// The wire places no restriction on the verb, so anything outside the
/// well-known set is carried verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    CONNECT,
    PATCH,
    TRACE,
    Other(String),
}

impl Method {
    /// Parse a method from its ASCII name, as carried in a SPDY header
    /// block (`method` in v2, `:method` in v3). Never fails; unknown
    /// verbs come back as [`Method::Other`].
    pub fn from_str(s: &str) -> Self {
        match s {
            "GET" => Self::GET,
            "POST" => Self::POST,
            "PUT" => Self::PUT,
            "DELETE" => Self::DELETE,
            "HEAD" => Self::HEAD,
            "OPTIONS" => Self::OPTIONS,
            "CONNECT" => Self::CONNECT,
            "PATCH" => Self::PATCH,
            "TRACE" => Self::TRACE,
            other => Self::Other(other.to_string()),
        }
    }

    /// Return the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::PUT => "PUT",
            Self::DELETE => "DELETE",
            Self::HEAD => "HEAD",
            Self::OPTIONS => "OPTIONS",
            Self::CONNECT => "CONNECT",
            Self::PATCH => "PATCH",
            Self::TRACE => "TRACE",
            Self::Other(s) => s,
        }
    }

    /// Whether requests with this method carry no body by convention.
    pub fn is_bodyless(&self) -> bool {
        matches!(self, Self::GET | Self::HEAD | Self::DELETE | Self::TRACE)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
