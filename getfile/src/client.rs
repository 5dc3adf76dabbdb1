//! The GETFILE client API: build one request, `perform()` it once, and read
//! back status/length/bytes-received.
//!
//! The original C library took a header callback, a write callback, and an
//! opaque `void*` argument threaded through both. This is modeled as plain
//! closures instead — a closure already carries whatever "argument" it
//! needs via capture, so the separate argument field disappears entirely
//! rather than being reintroduced as a generic type parameter nobody needs.

use crate::protocol::{self, HeaderParser, Method, Outcome};
use crate::transport;
use std::io::{Read, Write};

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport setup failed: {0}")]
    Transport(#[from] transport::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::Error),
    #[error("connection closed after {received} of {expected} advertised bytes")]
    ShortRead { received: u64, expected: u64 },
    #[error("perform() called without a write callback set")]
    MissingWriteCallback,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request builder. Populate with setters, call `perform()` exactly once,
/// then query the outcome.
pub struct ClientRequest<'a> {
    server: String,
    port: u16,
    path: String,
    header_cb: Option<Box<dyn FnMut(Outcome, Option<u64>) + 'a>>,
    write_cb: Option<Box<dyn FnMut(&[u8]) + 'a>>,
    status: Outcome,
    file_len: u64,
    bytes_received: u64,
}

impl<'a> ClientRequest<'a> {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        ClientRequest {
            server: server.into(),
            port,
            path: String::new(),
            header_cb: None,
            write_cb: None,
            status: Outcome::Invalid,
            file_len: 0,
            bytes_received: 0,
        }
    }

    pub fn set_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.path = path.into();
        self
    }

    /// Called once, as soon as the response header has been parsed, with
    /// the resulting status and (for `Ok`) the advertised file length.
    pub fn set_header_callback(&mut self, cb: impl FnMut(Outcome, Option<u64>) + 'a) -> &mut Self {
        self.header_cb = Some(Box::new(cb));
        self
    }

    /// Called once per chunk of body bytes as they arrive. Required before
    /// `perform()` is called on a request expected to carry a body.
    pub fn set_write_callback(&mut self, cb: impl FnMut(&[u8]) + 'a) -> &mut Self {
        self.write_cb = Some(Box::new(cb));
        self
    }

    pub fn status(&self) -> Outcome {
        self.status
    }

    pub fn file_length(&self) -> u64 {
        self.file_len
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.file_len.saturating_sub(self.bytes_received)
    }

    /// Drives exactly one request/response exchange over a fresh
    /// connection.
    pub fn perform(&mut self) -> Result<(), Error> {
        if self.write_cb.is_none() {
            return Err(Error::MissingWriteCallback);
        }

        self.status = Outcome::Invalid;
        self.file_len = 0;
        self.bytes_received = 0;

        let mut stream = transport::connect(&self.server, self.port)?;
        let request = protocol::encode_request(Method::Get, &self.path);
        stream.write_all(&request)?;

        let mut parser = HeaderParser::new();
        let mut buf = [0u8; READ_CHUNK];
        let parsed = loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(protocol::Error::Truncated.into());
            }
            parser.add_bytes(&buf[..n]);
            if let Some(parsed) = parser.try_parse_response()? {
                break parsed;
            }
        };

        self.status = parsed.status.into();
        self.file_len = parsed.length.unwrap_or(0);

        if let Some(cb) = self.header_cb.as_mut() {
            cb(self.status, parsed.length);
        }

        if parsed.status != protocol::Status::Ok {
            return Ok(());
        }

        let write_cb = self.write_cb.as_mut().unwrap();
        if !parsed.trailing.is_empty() {
            self.bytes_received += parsed.trailing.len() as u64;
            write_cb(&parsed.trailing);
        }

        while self.bytes_received < self.file_len {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(Error::ShortRead {
                    received: self.bytes_received,
                    expected: self.file_len,
                });
            }
            self.bytes_received += n as u64;
            write_cb(&buf[..n]);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Listener;
    use std::io::Write as _;
    use std::sync::{Arc, Mutex};

    #[test]
    fn perform_reads_full_body() {
        let listener = Listener::bind(0, 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).unwrap();
            stream
                .write_all(b"GETFILE OK 13\r\n\r\nhello, world!")
                .unwrap();
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let mut request = ClientRequest::new("127.0.0.1", addr.port());
        request.set_path("/a.txt");
        request.set_write_callback(move |chunk| received2.lock().unwrap().extend_from_slice(chunk));
        request.perform().unwrap();

        assert_eq!(request.status(), Outcome::Ok);
        assert_eq!(request.file_length(), 13);
        assert_eq!(request.bytes_received(), 13);
        assert_eq!(&*received.lock().unwrap(), b"hello, world!");
        server.join().unwrap();
    }

    #[test]
    fn perform_reports_file_not_found() {
        let listener = Listener::bind(0, 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(b"GETFILE FILE_NOT_FOUND\r\n\r\n").unwrap();
        });

        let mut request = ClientRequest::new("127.0.0.1", addr.port());
        request.set_path("/missing.txt");
        request.set_write_callback(|_| {});
        request.perform().unwrap();

        assert_eq!(request.status(), Outcome::FileNotFound);
        assert_eq!(request.bytes_received(), 0);
        server.join().unwrap();
    }

    #[test]
    fn perform_without_write_callback_errors() {
        let mut request = ClientRequest::new("127.0.0.1", 1);
        request.set_path("/a.txt");
        assert!(matches!(
            request.perform(),
            Err(Error::MissingWriteCallback)
        ));
    }
}
