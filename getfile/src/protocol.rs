//! The GETFILE wire protocol codec.
//!
//! Wire syntax (ASCII, case-sensitive):
//!
//! ```text
//! request:  "GETFILE" SP method SP path "\r\n\r\n"
//! response: "GETFILE" SP status [SP length] "\r\n\r\n" [body bytes ...]
//! ```
//!
//! Parsing is incremental: bytes accumulate into [`HeaderParser`] as they
//! arrive from the socket, one read (or one byte) at a time, until the
//! `\r\n\r\n` terminator appears. Any bytes the caller fed in past the
//! terminator are the leading portion of the body and are handed back
//! immediately rather than buffered further.

const SCHEME: &str = "GETFILE";
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Request method. Only `Get` is ever honoured; `Head` is a reserved token
/// that a server must reject with `FILE_NOT_FOUND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
        }
    }

    fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }
}

/// Status as carried on the wire. Never includes `INVALID` — that sentinel
/// only exists client-side, see [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    FileNotFound,
    Error,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::FileNotFound => "FILE_NOT_FOUND",
            Status::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Status> {
        match s {
            "OK" => Some(Status::Ok),
            "FILE_NOT_FOUND" => Some(Status::FileNotFound),
            "ERROR" => Some(Status::Error),
            _ => None,
        }
    }
}

/// Client-observed outcome of a request, including the transport-failure
/// sentinel that never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    FileNotFound,
    Error,
    /// Transport failed before a valid header arrived.
    Invalid,
}

impl From<Status> for Outcome {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => Outcome::Ok,
            Status::FileNotFound => Outcome::FileNotFound,
            Status::Error => Outcome::Error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed GETFILE header")]
    Invalid,
    #[error("connection closed before a complete header arrived")]
    Truncated,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A successfully parsed request header.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: Method,
    pub path: String,
    /// Bytes read past the header terminator — unused for requests (the
    /// protocol has no request body) but kept for symmetry and so a caller
    /// that over-read never silently drops bytes.
    pub trailing: Vec<u8>,
}

/// A successfully parsed response header.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status: Status,
    pub length: Option<u64>,
    /// The leading portion of the body, if any bytes arrived in the same
    /// read as the terminator.
    pub trailing: Vec<u8>,
}

/// Encodes a request header. There is no body on the request side.
pub fn encode_request(method: Method, path: &str) -> Vec<u8> {
    format!("{} {} {}\r\n\r\n", SCHEME, method.as_str(), path).into_bytes()
}

/// Encodes a response header. `length` must be `Some` for `Status::Ok` and
/// `None` otherwise — callers that violate this get a header without a
/// length field regardless, matching the wire grammar.
pub fn encode_response_header(status: Status, length: Option<u64>) -> Vec<u8> {
    match (status, length) {
        (Status::Ok, Some(len)) => format!("{} {} {}\r\n\r\n", SCHEME, status.as_str(), len),
        _ => format!("{} {}\r\n\r\n", SCHEME, status.as_str()),
    }
    .into_bytes()
}

/// Accumulates bytes from a socket until a complete GETFILE header has been
/// seen. Accepts any chunking of the input, including single bytes at a
/// time.
#[derive(Debug, Default)]
pub struct HeaderParser {
    buf: Vec<u8>,
}

impl HeaderParser {
    pub fn new() -> Self {
        HeaderParser { buf: Vec::new() }
    }

    /// Appends newly-read bytes to the accumulator.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The number of header bytes accumulated so far, including any body
    /// bytes that arrived in the same reads (used for diagnostics only).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn terminator_end(&self) -> Option<usize> {
        self.buf
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
            .map(|start| start + TERMINATOR.len())
    }

    fn take_header(&mut self) -> Option<(String, Vec<u8>)> {
        let end = self.terminator_end()?;
        let rest = self.buf.split_off(end);
        let header_bytes = std::mem::replace(&mut self.buf, rest);
        // header_bytes includes the terminator; strip it before decoding.
        let header_len = header_bytes.len() - TERMINATOR.len();
        let header = String::from_utf8_lossy(&header_bytes[..header_len]).into_owned();
        let trailing = std::mem::take(&mut self.buf);
        Some((header, trailing))
    }

    /// Attempts to parse a request header. Returns `Ok(None)` if the
    /// terminator has not yet arrived.
    pub fn try_parse_request(&mut self) -> Result<Option<ParsedRequest>, Error> {
        let Some((header, trailing)) = self.take_header() else {
            return Ok(None);
        };
        let mut parts = header.splitn(3, ' ');
        let scheme = parts.next().ok_or(Error::Invalid)?;
        if scheme != SCHEME {
            return Err(Error::Invalid);
        }
        let method = parts.next().and_then(Method::parse).ok_or(Error::Invalid)?;
        let path = parts.next().ok_or(Error::Invalid)?.to_string();
        Ok(Some(ParsedRequest {
            method,
            path,
            trailing,
        }))
    }

    /// Attempts to parse a response header. Returns `Ok(None)` if the
    /// terminator has not yet arrived.
    pub fn try_parse_response(&mut self) -> Result<Option<ParsedResponse>, Error> {
        let Some((header, trailing)) = self.take_header() else {
            return Ok(None);
        };
        let mut parts = header.split(' ');
        let scheme = parts.next().ok_or(Error::Invalid)?;
        if scheme != SCHEME {
            return Err(Error::Invalid);
        }
        let status = parts.next().and_then(Status::parse).ok_or(Error::Invalid)?;
        let length = match (status, parts.next()) {
            (Status::Ok, Some(raw)) => Some(raw.parse::<u64>().map_err(|_| Error::Invalid)?),
            (Status::Ok, None) => return Err(Error::Invalid),
            (_, _) => None,
        };
        Ok(Some(ParsedResponse {
            status,
            length,
            trailing,
        }))
    }
}

/// A request path must start with `/`. The protocol does not reject a
/// malformed path at parse time (spec: this is a server-side policy
/// decision, not a wire-format error) — callers check this explicitly.
pub fn is_valid_path(path: &str) -> bool {
    path.starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_request_roundtrip() {
        let bytes = encode_request(Method::Get, "/a.txt");
        assert_eq!(bytes, b"GETFILE GET /a.txt\r\n\r\n");
    }

    #[test]
    fn encode_ok_response_has_length() {
        let bytes = encode_response_header(Status::Ok, Some(13));
        assert_eq!(bytes, b"GETFILE OK 13\r\n\r\n");
    }

    #[test]
    fn encode_not_found_omits_length() {
        let bytes = encode_response_header(Status::FileNotFound, None);
        assert_eq!(bytes, b"GETFILE FILE_NOT_FOUND\r\n\r\n");
    }

    #[test]
    fn parse_request_whole_in_one_shot() {
        let mut parser = HeaderParser::new();
        parser.add_bytes(b"GETFILE GET /a.txt\r\n\r\n");
        let parsed = parser.try_parse_request().unwrap().unwrap();
        assert_eq!(parsed.method, Method::Get);
        assert_eq!(parsed.path, "/a.txt");
        assert!(parsed.trailing.is_empty());
    }

    #[test]
    fn parse_request_one_byte_at_a_time() {
        let mut parser = HeaderParser::new();
        let input = b"GETFILE GET /a.txt\r\n\r\n";
        let mut result = None;
        for byte in input {
            parser.add_bytes(&[*byte]);
            if let Some(parsed) = parser.try_parse_request().unwrap() {
                result = Some(parsed);
                break;
            }
        }
        let parsed = result.expect("should have parsed before exhausting input");
        assert_eq!(parsed.path, "/a.txt");
    }

    #[test]
    fn parse_response_splits_trailing_body_bytes() {
        let mut parser = HeaderParser::new();
        parser.add_bytes(b"GETFILE OK 5\r\n\r\nhello");
        let parsed = parser.try_parse_response().unwrap().unwrap();
        assert_eq!(parsed.status, Status::Ok);
        assert_eq!(parsed.length, Some(5));
        assert_eq!(parsed.trailing, b"hello");
    }

    #[test]
    fn parse_response_ok_without_length_is_invalid() {
        let mut parser = HeaderParser::new();
        parser.add_bytes(b"GETFILE OK\r\n\r\n");
        assert!(matches!(
            parser.try_parse_response(),
            Err(Error::Invalid)
        ));
    }

    #[test]
    fn parse_rejects_wrong_scheme() {
        let mut parser = HeaderParser::new();
        parser.add_bytes(b"NOTGETFILE GET /a.txt\r\n\r\n");
        assert!(matches!(parser.try_parse_request(), Err(Error::Invalid)));
    }

    #[test]
    fn incomplete_header_returns_none() {
        let mut parser = HeaderParser::new();
        parser.add_bytes(b"GETFILE GET /a.txt\r\n");
        assert!(parser.try_parse_request().unwrap().is_none());
    }

    #[test]
    fn missing_leading_slash_is_not_a_parse_error() {
        assert!(!is_valid_path("a.txt"));
        assert!(is_valid_path("/a.txt"));
    }
}
