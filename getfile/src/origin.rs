//! The proxy's fallback path when the cache has no answer: fetch the file
//! straight from an HTTP origin server, so `getfile_proxy` is runnable on
//! its own without a populated cache.
//!
//! Grounded on `handlers.c`'s `handle_with_curl`/`curl_hdr_cb`/
//! `curl_write_cb`, reworked from libcurl's header/write callback pair onto
//! `ureq`'s blocking, synchronous request API — a natural fit since every
//! GETFILE process here is thread-per-request rather than async.
//!
//! `handle_with_curl` builds its request URL by concatenating the `-s`
//! prefix straight onto the request path (`sprintf(url, "%s%s", server,
//! req_path)`); `HttpOriginFetcher` does the same string concatenation
//! rather than parsing the prefix into a host and port.

use crate::pipeline::{OriginError, OriginFetcher, ResponseSink};
use crate::protocol::Status;

/// Fetches file content by concatenating the request path onto a fixed
/// URL prefix (e.g. `s3.amazonaws.com/content.udacity-data.com`).
pub struct HttpOriginFetcher {
    prefix: String,
}

impl HttpOriginFetcher {
    pub fn new(prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref();
        let prefix = if prefix.starts_with("http://") || prefix.starts_with("https://") {
            prefix.to_string()
        } else {
            format!("http://{prefix}")
        };
        HttpOriginFetcher { prefix }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }
}

impl OriginFetcher for HttpOriginFetcher {
    fn fetch(&self, path: &str, sink: &mut dyn ResponseSink) -> Result<u64, OriginError> {
        let url = self.url_for(path);
        let response = match ureq::get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Err(OriginError::NotFound),
            Err(ureq::Error::Status(code, _)) => {
                return Err(OriginError::Other(format!("origin responded with status {code}")))
            }
            Err(ureq::Error::Transport(err)) => return Err(OriginError::Other(err.to_string())),
        };

        let length: u64 = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| OriginError::Other("origin response missing Content-Length".to_string()))?;

        sink.send_header(Status::Ok, Some(length))
            .map_err(|err| OriginError::Other(err.to_string()))?;

        let mut reader = response.into_reader();
        let mut buf = [0u8; 4096];
        let mut sent = 0u64;
        loop {
            let n = std::io::Read::read(&mut reader, &mut buf)
                .map_err(|err| OriginError::Other(err.to_string()))?;
            if n == 0 {
                break;
            }
            sink.send_body(&buf[..n])
                .map_err(|err| OriginError::Other(err.to_string()))?;
            sent += n as u64;
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        status: Option<(Status, Option<u64>)>,
        body: Vec<u8>,
    }

    impl ResponseSink for RecordingSink {
        fn send_header(&mut self, status: Status, length: Option<u64>) -> std::io::Result<()> {
            self.status = Some((status, length));
            Ok(())
        }

        fn send_body(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.body.extend_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn url_for_joins_prefix_and_path() {
        let fetcher = HttpOriginFetcher::new("origin.example/content");
        assert_eq!(fetcher.url_for("/a/b.txt"), "http://origin.example/content/a/b.txt");
    }

    #[test]
    fn url_for_preserves_explicit_scheme() {
        let fetcher = HttpOriginFetcher::new("https://origin.example");
        assert_eq!(fetcher.url_for("/a.txt"), "https://origin.example/a.txt");
    }

    #[test]
    fn recording_sink_accumulates_body() {
        let mut sink = RecordingSink {
            status: None,
            body: Vec::new(),
        };
        sink.send_header(Status::Ok, Some(3)).unwrap();
        sink.send_body(b"abc").unwrap();
        assert_eq!(sink.status, Some((Status::Ok, Some(3))));
        assert_eq!(sink.body, b"abc");
    }
}
