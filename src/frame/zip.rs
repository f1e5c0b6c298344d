//! Stateful zlib codec for SPDY header blocks.
//!
//! Header blocks inside SYN_STREAM, SYN_REPLY, and HEADERS frames are
//! zlib-compressed with a protocol-version-specific shared dictionary, and
//! the compression context persists for the lifetime of the connection:
//! one `Compressor` lives in the transmit pump, one `Decompressor` in the
//! dispatcher. Contexts are initialised lazily on first use.

use std::io;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, SessionError};

/// Shared dictionary for SPDY/2 header compression (draft 2 §2.6.10.1).
pub const DICTIONARY_V2: &[u8] = concat!(
    "optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodingaccept-",
    "languageauthorizationexpectfromhostif-modified-sinceif-matchif-none-matchi",
    "f-rangeif-unmodifiedsincemax-forwardsproxy-authorizationrangerefererteuser",
    "-agent10010120020120220320420520630030130230330430530630740040140240340440",
    "540640740840941041141241341441541641742050050150250350450550acceptaccept-",
    "charsetaccept-encodingaccept-languageaccept-rangesageallowauthorizationcac",
    "he-controlconnectioncontent-basecontent-encodingcontent-languagecontent-le",
    "ngthcontent-locationcontent-md5content-rangecontent-typedateetagexpectexpi",
    "resfromhostif-matchif-modified-sinceif-none-matchif-rangeif-unmodified-sin",
    "celast-modifiedlocationmax-forwardspragmaproxy-authenticateproxy-authoriza",
    "tionrangerefererretry-afterserverteuser-agentvaryviawarningwww-authenticat",
    "emethodgetstatus200 OKversionHTTP/1.1urlpublicset-cookiekeep-aliveorigin10",
    "0101201202205206300302303304305306307402405406407408409410411412413414415",
    "416417502504505203 Non-Authoritative Information204 No Content301 Moved P",
    "ermanently400 Bad Request401 Unauthorized403 Forbidden404 Not Found500 In",
    "ternal Server Error501 Not Implemented503 Service UnavailableJan Feb Mar ",
    "Apr May Jun Jul Aug Sept Oct Nov Dec 00:00:00 Mon, Tue, Wed, Thu, Fri, Sa",
    "t, Sun, GMTchunked,text/html,image/png,image/jpg,image/gif,application/xm",
    "l,application/xhtml+xml,text/plain,text/javascript,publicprivatemax-age=g",
    "zip,deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.",
    "\x00",
)
.as_bytes();

/// Shared dictionary for SPDY/3 header compression (draft 3 §2.6.10.1):
/// length-prefixed words followed by a raw text block.
pub const DICTIONARY_V3: &[u8] = concat!(
    "\x00\x00\x00\x07options",
    "\x00\x00\x00\x04head",
    "\x00\x00\x00\x04post",
    "\x00\x00\x00\x03put",
    "\x00\x00\x00\x06delete",
    "\x00\x00\x00\x05trace",
    "\x00\x00\x00\x06accept",
    "\x00\x00\x00\x0eaccept-charset",
    "\x00\x00\x00\x0faccept-encoding",
    "\x00\x00\x00\x0faccept-language",
    "\x00\x00\x00\x0daccept-ranges",
    "\x00\x00\x00\x03age",
    "\x00\x00\x00\x05allow",
    "\x00\x00\x00\x0dauthorization",
    "\x00\x00\x00\x0dcache-control",
    "\x00\x00\x00\x0aconnection",
    "\x00\x00\x00\x0ccontent-base",
    "\x00\x00\x00\x10content-encoding",
    "\x00\x00\x00\x10content-language",
    "\x00\x00\x00\x0econtent-length",
    "\x00\x00\x00\x10content-location",
    "\x00\x00\x00\x0bcontent-md5",
    "\x00\x00\x00\x0dcontent-range",
    "\x00\x00\x00\x0ccontent-type",
    "\x00\x00\x00\x04date",
    "\x00\x00\x00\x04etag",
    "\x00\x00\x00\x06expect",
    "\x00\x00\x00\x07expires",
    "\x00\x00\x00\x04from",
    "\x00\x00\x00\x04host",
    "\x00\x00\x00\x08if-match",
    "\x00\x00\x00\x11if-modified-since",
    "\x00\x00\x00\x0dif-none-match",
    "\x00\x00\x00\x08if-range",
    "\x00\x00\x00\x13if-unmodified-since",
    "\x00\x00\x00\x0dlast-modified",
    "\x00\x00\x00\x08location",
    "\x00\x00\x00\x0cmax-forwards",
    "\x00\x00\x00\x06pragma",
    "\x00\x00\x00\x12proxy-authenticate",
    "\x00\x00\x00\x13proxy-authorization",
    "\x00\x00\x00\x05range",
    "\x00\x00\x00\x07referer",
    "\x00\x00\x00\x0bretry-after",
    "\x00\x00\x00\x06server",
    "\x00\x00\x00\x02te",
    "\x00\x00\x00\x07trailer",
    "\x00\x00\x00\x11transfer-encoding",
    "\x00\x00\x00\x07upgrade",
    "\x00\x00\x00\x0auser-agent",
    "\x00\x00\x00\x04vary",
    "\x00\x00\x00\x03via",
    "\x00\x00\x00\x07warning",
    "\x00\x00\x00\x10www-authenticate",
    "\x00\x00\x00\x06method",
    "\x00\x00\x00\x03get",
    "\x00\x00\x00\x06status",
    "\x00\x00\x00\x06200 OK",
    "\x00\x00\x00\x07version",
    "\x00\x00\x00\x08HTTP/1.1",
    "\x00\x00\x00\x03url",
    "\x00\x00\x00\x06public",
    "\x00\x00\x00\x0aset-cookie",
    "\x00\x00\x00\x0akeep-alive",
    "\x00\x00\x00\x06origin",
    "100101201202205206300302303304305306307402405406407408409410411412413414",
    "415416417502504505",
    "203 Non-Authoritative Information",
    "204 No Content",
    "301 Moved Permanently",
    "400 Bad Request",
    "401 Unauthorized",
    "403 Forbidden",
    "404 Not Found",
    "500 Internal Server Error",
    "501 Not Implemented",
    "503 Service Unavailable",
    "Jan Feb Mar Apr May Jun Jul Aug Sept Oct Nov Dec ",
    "00:00:00 Mon, Tue, Wed, Thu, Fri, Sat, Sun, GMT",
    "chunked,text/html,image/png,image/jpg,image/gif,",
    "application/xml,application/xhtml+xml,text/plain,text/javascript,",
    "publicprivatemax-age=gzip,deflate,sdchcharset=utf-8charset=iso-8859-1,",
    "utf-,*,enq=0.",
)
.as_bytes();

/// Dictionary for a given protocol version.
pub fn dictionary(version: u16) -> &'static [u8] {
    if version == 2 { DICTIONARY_V2 } else { DICTIONARY_V3 }
}

/// Deflate side of the header codec. Owned by the transmit pump.
pub struct Compressor {
    version: u16,
    state: Option<Compress>,
}

impl Compressor {
    pub fn new(version: u16) -> Self {
        Self { version, state: None }
    }

    /// Compress one header block, flushing so the peer can decode the
    /// block without waiting for further frames.
    pub fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        let z = match &mut self.state {
            Some(z) => z,
            state @ None => {
                let mut z = Compress::new(Compression::default(), true);
                z.set_dictionary(dictionary(self.version))
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                state.insert(z)
            }
        };

        let base_in = z.total_in();
        let mut out = Vec::with_capacity(input.len() + 64);
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(256);
            }
            let pos = consumed(z.total_in(), base_in);
            z.compress_vec(&input[pos..], &mut out, FlushCompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let pos = consumed(z.total_in(), base_in);
            if pos >= input.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }
}

fn consumed(total: u64, base: u64) -> usize {
    (total - base) as usize
}

/// Inflate side of the header codec. Owned by the dispatcher.
pub struct Decompressor {
    version: u16,
    state: Option<Decompress>,
}

impl Decompressor {
    pub fn new(version: u16) -> Self {
        Self { version, state: None }
    }

    /// Decompress one header block. A corrupt block is a session-level
    /// protocol error: the shared context is unusable afterwards.
    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let z = self.state.get_or_insert_with(|| Decompress::new(true));

        let base_in = z.total_in();
        let mut out = Vec::with_capacity(input.len() * 4 + 64);
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(256);
            }
            let pos = consumed(z.total_in(), base_in);
            match z.decompress_vec(&input[pos..], &mut out, FlushDecompress::Sync) {
                Ok(_) => {
                    let pos = consumed(z.total_in(), base_in);
                    if pos >= input.len() && out.len() < out.capacity() {
                        break;
                    }
                }
                Err(e) if e.needs_dictionary().is_some() => {
                    z.set_dictionary(dictionary(self.version))
                        .map_err(|_| Error::Session(SessionError::Protocol))?;
                }
                Err(_) => return Err(Error::Session(SessionError::Protocol)),
            }
        }
        Ok(out)
    }
}
