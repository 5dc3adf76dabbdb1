//! The request pipeline shared by the proxy and the cache daemon: claim a
//! segment, round-trip a request over the IPC channel, stream the response
//! back to the GETFILE client, release the segment.
//!
//! Grounded on `handlers.c`'s `handle_request`/`handle_with_cache`/
//! `handle_with_curl` split. The original's callback+`void*` handler and the
//! free-standing `handler_enq_mem_seg`/`handler_deq_mem_seg` globals become
//! typed traits (`ResponseSink`, `OriginFetcher`, `BlobStore`, `SegmentSource`,
//! `ProxyChannel`, `CacheChannel`) threaded explicitly through
//! `handle_connection`/`handle_cache_request`; the segment and channel traits
//! also let tests exercise the cache-hit path against in-memory doubles
//! instead of requiring real System-V IPC.

use crate::server::ServerContext;
use getfile_internal::{RequestInfo, ResponseInfo};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error sending response: {0}")]
    Io(#[from] std::io::Error),
    #[error("IPC error: {0}")]
    Ipc(#[from] getfile_internal::IpcError),
    #[error("shared memory segment error: {0}")]
    Segment(#[from] getfile_internal::SegmentError),
}

/// The proxy's and the cache's shared notion of "send bytes back to the
/// GETFILE client" — implemented for [`ServerContext`] so the pipeline
/// doesn't need to know it's talking to a live TCP socket.
pub trait ResponseSink {
    fn send_header(&mut self, status: crate::protocol::Status, length: Option<u64>) -> std::io::Result<()>;
    fn send_body(&mut self, data: &[u8]) -> std::io::Result<()>;
}

impl ResponseSink for ServerContext {
    fn send_header(&mut self, status: crate::protocol::Status, length: Option<u64>) -> std::io::Result<()> {
        ServerContext::send_header(self, status, length)
    }

    fn send_body(&mut self, data: &[u8]) -> std::io::Result<()> {
        ServerContext::send_body(self, data)
    }
}

/// The proxy's fallback collaborator when the cache has no answer. Grounded
/// on `handle_with_curl`'s use of libcurl against the origin HTTP server.
pub trait OriginFetcher {
    fn fetch(&self, path: &str, sink: &mut dyn ResponseSink) -> Result<u64, OriginError>;
}

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("origin server reported the file as missing")]
    NotFound,
    #[error("origin fetch failed: {0}")]
    Other(String),
}

/// The cache daemon's collaborator for locating and reading file content.
/// Associated `Handle` lets a concrete store (e.g. an open file) carry
/// whatever state it needs between `lookup` and `read` without the pipeline
/// caring what that state is.
pub trait BlobStore {
    type Handle;

    fn lookup(&self, path: &str) -> Option<Self::Handle>;
    fn size(&self, handle: &Self::Handle) -> u64;
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read (0 only at end of file).
    fn read(&self, handle: &Self::Handle, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// A segment already attached into the process's address space, ready for
/// `write`/`read`. Implemented by `getfile_internal::AttachedSegment`; a
/// test double can implement it over a plain in-memory buffer.
pub trait SegmentIo {
    fn write(&self, buf: &[u8]);
    fn read(&self, len: usize) -> Vec<u8>;
}

/// Claims, attaches, and releases the shared-memory segments the proxy
/// owns. Implemented for `getfile_internal::SegmentPool`.
pub trait SegmentSource {
    type Segment: Copy;
    type Attached: SegmentIo;

    fn checkout(&self) -> Self::Segment;
    fn release(&self, segment: Self::Segment);
    fn attach(&self, segment: Self::Segment) -> Result<Self::Attached, Error>;
    fn id(&self, segment: Self::Segment) -> i32;
    fn capacity(&self, segment: Self::Segment) -> u64;
}

/// Attaches directly to a segment by the raw id a request named, with no
/// pool of its own — the cache daemon's side of the segment relationship,
/// matching `handle_file_request`'s direct
/// `shm_attach_mem_seg(shm_context_get_seg_id(ctx))` call.
pub trait SegmentAttach {
    type Attached: SegmentIo;
    fn attach(&self, segment_id: i32, capacity: usize) -> Result<Self::Attached, Error>;
}

/// The real cache-side segment attachment, over
/// `getfile_internal::attach_by_id`.
pub struct SystemVSegments;

impl SegmentAttach for SystemVSegments {
    type Attached = getfile_internal::AttachedSegment;

    fn attach(&self, segment_id: i32, capacity: usize) -> Result<Self::Attached, Error> {
        Ok(getfile_internal::attach_by_id(segment_id, capacity)?)
    }
}

/// The proxy's side of the IPC channel: send a request, wait for each ready
/// chunk, acknowledge it. Implemented for `getfile_internal::MessageQueue`.
pub trait ProxyChannel {
    fn send_file_request(&self, request: &RequestInfo) -> Result<ResponseInfo, Error>;
    fn wait_for_ready(&self, segment_id: i32) -> Result<ResponseInfo, Error>;
    fn send_acknowledge(&self, segment_id: i32) -> Result<(), Error>;
}

/// The cache daemon's side of the IPC channel. Implemented for
/// `getfile_internal::MessageQueue`.
pub trait CacheChannel {
    fn wait_for_file_request(&self) -> Result<RequestInfo, Error>;
    fn send_response(&self, info: &ResponseInfo) -> Result<(), Error>;
    fn send_ready(&self, segment_id: i32, used: u64) -> Result<(), Error>;
    fn wait_for_acknowledge(&self, segment_id: i32) -> Result<(), Error>;
}

impl SegmentIo for getfile_internal::AttachedSegment {
    fn write(&self, buf: &[u8]) {
        getfile_internal::AttachedSegment::write(self, buf)
    }

    fn read(&self, len: usize) -> Vec<u8> {
        getfile_internal::AttachedSegment::read(self, len)
    }
}

impl SegmentSource for getfile_internal::SegmentPool {
    type Segment = getfile_internal::Segment;
    type Attached = getfile_internal::AttachedSegment;

    fn checkout(&self) -> Self::Segment {
        getfile_internal::SegmentPool::checkout(self)
    }

    fn release(&self, segment: Self::Segment) {
        getfile_internal::SegmentPool::release(self, segment)
    }

    fn attach(&self, segment: Self::Segment) -> Result<Self::Attached, Error> {
        Ok(getfile_internal::SegmentPool::attach(self, segment)?)
    }

    fn id(&self, segment: Self::Segment) -> i32 {
        segment.id
    }

    fn capacity(&self, segment: Self::Segment) -> u64 {
        segment.capacity as u64
    }
}

impl ProxyChannel for getfile_internal::MessageQueue {
    fn send_file_request(&self, request: &RequestInfo) -> Result<ResponseInfo, Error> {
        Ok(getfile_internal::ClientChannel::new(self).send_file_request(request)?)
    }

    fn wait_for_ready(&self, segment_id: i32) -> Result<ResponseInfo, Error> {
        Ok(getfile_internal::ClientChannel::new(self).wait_for_ready(segment_id)?)
    }

    fn send_acknowledge(&self, segment_id: i32) -> Result<(), Error> {
        Ok(getfile_internal::ClientChannel::new(self).send_acknowledge(segment_id)?)
    }
}

impl CacheChannel for getfile_internal::MessageQueue {
    fn wait_for_file_request(&self) -> Result<RequestInfo, Error> {
        Ok(getfile_internal::ServerChannel::new(self).wait_for_file_request()?)
    }

    fn send_response(&self, info: &ResponseInfo) -> Result<(), Error> {
        Ok(getfile_internal::ServerChannel::new(self).send_response(info)?)
    }

    fn send_ready(&self, segment_id: i32, used: u64) -> Result<(), Error> {
        Ok(getfile_internal::ServerChannel::new(self).send_ready(segment_id, used)?)
    }

    fn wait_for_acknowledge(&self, segment_id: i32) -> Result<(), Error> {
        Ok(getfile_internal::ServerChannel::new(self).wait_for_acknowledge(segment_id)?)
    }
}

/// The proxy side of the pipeline: claim a segment, ask the cache for
/// `path`, stream its answer back through `sink`; on any cache miss or IPC
/// failure, release the segment and fall back to `origin`.
///
/// Mirrors `handle_request`'s "try cache, then try curl" control flow
/// exactly, including that a 404 from the cache and an IPC-level error are
/// both treated as "fall through to the origin", distinguished only in the
/// final status sent if the origin attempt also fails.
pub fn handle_connection<SS: SegmentSource, PC: ProxyChannel>(
    sink: &mut dyn ResponseSink,
    path: &str,
    segment_pool: &SS,
    channel: &PC,
    origin: &dyn OriginFetcher,
) -> Result<u64, Error> {
    match handle_with_cache(sink, path, segment_pool, channel) {
        Ok(bytes) => Ok(bytes),
        Err(CacheOutcome::NotFound) => {
            fall_back_to_origin(sink, path, origin, crate::protocol::Status::FileNotFound)
        }
        Err(CacheOutcome::Failed) => {
            fall_back_to_origin(sink, path, origin, crate::protocol::Status::Error)
        }
    }
}

enum CacheOutcome {
    NotFound,
    Failed,
}

fn fall_back_to_origin(
    sink: &mut dyn ResponseSink,
    path: &str,
    origin: &dyn OriginFetcher,
    not_found_status: crate::protocol::Status,
) -> Result<u64, Error> {
    log::info!("cache miss for {path}, falling back to origin");
    match origin.fetch(path, sink) {
        Ok(bytes) => Ok(bytes),
        Err(OriginError::NotFound) => {
            sink.send_header(crate::protocol::Status::FileNotFound, None)?;
            Ok(0)
        }
        Err(OriginError::Other(reason)) => {
            log::error!("origin fetch for {path} failed: {reason}");
            sink.send_header(not_found_status, None)?;
            Ok(0)
        }
    }
}

fn handle_with_cache<SS: SegmentSource, PC: ProxyChannel>(
    sink: &mut dyn ResponseSink,
    path: &str,
    segment_pool: &SS,
    channel: &PC,
) -> Result<u64, CacheOutcome> {
    let segment = segment_pool.checkout();
    let segment_id = segment_pool.id(segment);
    let segment_capacity = segment_pool.capacity(segment);

    let attached = segment_pool.attach(segment).map_err(|err| {
        log::error!("could not attach shared memory segment {segment_id}: {err}");
        segment_pool.release(segment);
        CacheOutcome::Failed
    })?;

    let result = (|| {
        let request = RequestInfo {
            path: path.to_string(),
            segment_id,
            segment_capacity,
        };
        let response = channel.send_file_request(&request).map_err(|err| {
            log::error!("cache request for {path} failed: {err}");
            CacheOutcome::Failed
        })?;

        match response.status {
            Some(getfile_internal::IpcStatus::NotFound) => return Err(CacheOutcome::NotFound),
            Some(getfile_internal::IpcStatus::Ok) => {}
            None => return Err(CacheOutcome::Failed),
        }

        sink.send_header(crate::protocol::Status::Ok, Some(response.file_size))
            .map_err(|_| CacheOutcome::Failed)?;

        let mut transferred = 0u64;
        while transferred < response.file_size {
            let ready = channel.wait_for_ready(segment_id).map_err(|err| {
                log::error!("cache ready-wait for {path} failed: {err}");
                CacheOutcome::Failed
            })?;

            let chunk = attached.read(ready.segment_used as usize);
            if chunk.is_empty() {
                log::error!("cache sent an empty ready chunk for {path}");
                return Err(CacheOutcome::Failed);
            }

            channel.send_acknowledge(segment_id).map_err(|_| CacheOutcome::Failed)?;

            sink.send_body(&chunk).map_err(|_| CacheOutcome::Failed)?;
            transferred += chunk.len() as u64;
        }

        Ok(transferred)
    })();

    segment_pool.release(segment);
    result
}

/// The cache daemon's mirror of [`handle_with_cache`]: receive a request
/// from the proxy, look up `path` in `store`, stream it in chunks sized to
/// the proxy-assigned segment's capacity. Grounded on `simplecached.c`'s
/// request/response loop and `shm_server_send_response`/`shm_server_send_ready`.
/// The cache never owns a `SegmentPool` of its own — `attacher` attaches
/// directly to whichever segment id the proxy named, sized to whatever
/// capacity the proxy reported.
pub fn handle_cache_request<S: BlobStore, C: CacheChannel, A: SegmentAttach>(
    channel: &C,
    store: &S,
    attacher: &A,
) -> Result<(), Error> {
    let request = channel.wait_for_file_request()?;

    let Some(handle) = store.lookup(&request.path) else {
        channel.send_response(&ResponseInfo {
            path: request.path.clone(),
            file_size: 0,
            segment_id: request.segment_id,
            segment_total: 0,
            segment_used: 0,
            status: Some(getfile_internal::IpcStatus::NotFound),
        })?;
        return Ok(());
    };

    let size = store.size(&handle);
    let capacity = request.segment_capacity as usize;
    let attached = attacher.attach(request.segment_id, capacity)?;

    channel.send_response(&ResponseInfo {
        path: request.path.clone(),
        file_size: size,
        segment_id: request.segment_id,
        segment_total: request.segment_capacity,
        segment_used: 0,
        status: Some(getfile_internal::IpcStatus::Ok),
    })?;

    // Every chunk is sized to the full segment capacity (bar the last),
    // matching spec's "pread up to S bytes into segment K" — capping this
    // below the proxy-assigned capacity would silently shrink the transfer
    // granularity the proxy sized its segments for.
    let mut offset = 0u64;
    let mut buf = vec![0u8; capacity];
    while offset < size {
        let want = buf.len().min((size - offset) as usize);
        let read = store.read(&handle, offset, &mut buf[..want])?;
        attached.write(&buf[..read]);
        channel.send_ready(request.segment_id, read as u64)?;
        channel.wait_for_acknowledge(request.segment_id)?;
        offset += read as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// An in-memory stand-in for a shared-memory segment: a fixed-capacity
    /// buffer guarded by a mutex instead of `shmat`/`shmdt`.
    struct FakeSegment {
        buf: Mutex<Vec<u8>>,
    }

    impl SegmentIo for FakeSegment {
        fn write(&self, buf: &[u8]) {
            let mut guard = self.buf.lock().unwrap();
            guard.clear();
            guard.extend_from_slice(buf);
        }

        fn read(&self, len: usize) -> Vec<u8> {
            self.buf.lock().unwrap()[..len].to_vec()
        }
    }

    /// A one-segment in-memory `SegmentSource` for exercising the proxy side
    /// of the pipeline without a real `SegmentPool`.
    struct FakeSegmentSource {
        capacity: u64,
        segment: Arc<FakeSegment>,
    }

    impl FakeSegmentSource {
        fn new(capacity: u64) -> Self {
            FakeSegmentSource {
                capacity,
                segment: Arc::new(FakeSegment {
                    buf: Mutex::new(vec![0u8; capacity as usize]),
                }),
            }
        }
    }

    impl SegmentSource for FakeSegmentSource {
        type Segment = i32;
        type Attached = Arc<FakeSegment>;

        fn checkout(&self) -> Self::Segment {
            1
        }

        fn release(&self, _segment: Self::Segment) {}

        fn attach(&self, _segment: Self::Segment) -> Result<Self::Attached, Error> {
            Ok(self.segment.clone())
        }

        fn id(&self, segment: Self::Segment) -> i32 {
            segment
        }

        fn capacity(&self, _segment: Self::Segment) -> u64 {
            self.capacity
        }
    }

    impl SegmentIo for Arc<FakeSegment> {
        fn write(&self, buf: &[u8]) {
            FakeSegment::write(self, buf)
        }

        fn read(&self, len: usize) -> Vec<u8> {
            FakeSegment::read(self, len)
        }
    }

    /// Wires a `ProxyChannel` directly to a `CacheChannel` sharing the same
    /// `FakeSegment`, so a test can drive both halves of a cache-hit
    /// round-trip on one thread without real System-V IPC.
    struct FakeCache {
        segment: Arc<FakeSegment>,
        file: Vec<u8>,
        served: Mutex<usize>,
        rdy_count: Mutex<u32>,
    }

    impl ProxyChannel for FakeCache {
        fn send_file_request(&self, _request: &RequestInfo) -> Result<ResponseInfo, Error> {
            Ok(ResponseInfo {
                path: String::new(),
                file_size: self.file.len() as u64,
                segment_id: 1,
                segment_total: self.segment.buf.lock().unwrap().len() as u64,
                segment_used: 0,
                status: Some(getfile_internal::IpcStatus::Ok),
            })
        }

        fn wait_for_ready(&self, _segment_id: i32) -> Result<ResponseInfo, Error> {
            let mut served = self.served.lock().unwrap();
            let capacity = self.segment.buf.lock().unwrap().len();
            let remaining = self.file.len() - *served;
            let chunk_len = remaining.min(capacity);
            self.segment.write(&self.file[*served..*served + chunk_len]);
            *served += chunk_len;
            *self.rdy_count.lock().unwrap() += 1;
            Ok(ResponseInfo {
                path: String::new(),
                file_size: self.file.len() as u64,
                segment_id: 1,
                segment_total: capacity as u64,
                segment_used: chunk_len as u64,
                status: Some(getfile_internal::IpcStatus::Ok),
            })
        }

        fn send_acknowledge(&self, _segment_id: i32) -> Result<(), Error> {
            Ok(())
        }
    }

    struct RecordingSink {
        status: Option<crate::protocol::Status>,
        body: Vec<u8>,
    }

    impl ResponseSink for RecordingSink {
        fn send_header(&mut self, status: crate::protocol::Status, _length: Option<u64>) -> std::io::Result<()> {
            self.status = Some(status);
            Ok(())
        }

        fn send_body(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.body.extend_from_slice(data);
            Ok(())
        }
    }

    struct NoOriginCalled;

    impl OriginFetcher for NoOriginCalled {
        fn fetch(&self, _path: &str, _sink: &mut dyn ResponseSink) -> Result<u64, OriginError> {
            panic!("origin should not be consulted on a cache hit");
        }
    }

    #[test]
    fn cache_hit_rdy_count_matches_ceil_file_size_over_segment_size() {
        // A segment capacity well above the old hard-coded 4096-byte chunk
        // cap, so a regression back to that cap would under-count `served`
        // chunks relative to `file_size` and this test would catch it via a
        // wrong RDY count.
        let segment_size = 10_000u64;
        let file_size = 25_000usize;
        let file: Vec<u8> = (0..file_size).map(|i| (i % 256) as u8).collect();

        let source = FakeSegmentSource::new(segment_size);
        let cache = FakeCache {
            segment: source.segment.clone(),
            file: file.clone(),
            served: Mutex::new(0),
            rdy_count: Mutex::new(0),
        };

        let mut sink = RecordingSink {
            status: None,
            body: Vec::new(),
        };

        let bytes = handle_connection(&mut sink, "/big.bin", &source, &cache, &NoOriginCalled)
            .expect("cache hit should succeed");

        assert_eq!(bytes, file_size as u64);
        assert_eq!(sink.status, Some(crate::protocol::Status::Ok));
        assert_eq!(sink.body, file);

        let expected_rdy = (file_size as u64 + segment_size - 1) / segment_size;
        assert_eq!(*cache.rdy_count.lock().unwrap() as u64, expected_rdy);
    }

    #[test]
    fn handle_cache_request_chunks_at_full_segment_capacity() {
        struct MapStore(HashMap<String, Vec<u8>>);

        impl BlobStore for MapStore {
            type Handle = Vec<u8>;

            fn lookup(&self, path: &str) -> Option<Self::Handle> {
                self.0.get(path).cloned()
            }

            fn size(&self, handle: &Self::Handle) -> u64 {
                handle.len() as u64
            }

            fn read(&self, handle: &Self::Handle, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
                let offset = offset as usize;
                let n = buf.len().min(handle.len() - offset);
                buf[..n].copy_from_slice(&handle[offset..offset + n]);
                Ok(n)
            }
        }

        /// A `CacheChannel` double that answers one fixed request and
        /// records every `send_ready` chunk length it's given.
        struct FakeServerChannel {
            request: RequestInfo,
            ready_lengths: Mutex<Vec<u64>>,
        }

        impl CacheChannel for FakeServerChannel {
            fn wait_for_file_request(&self) -> Result<RequestInfo, Error> {
                Ok(self.request.clone())
            }

            fn send_response(&self, _info: &ResponseInfo) -> Result<(), Error> {
                Ok(())
            }

            fn send_ready(&self, _segment_id: i32, used: u64) -> Result<(), Error> {
                self.ready_lengths.lock().unwrap().push(used);
                Ok(())
            }

            fn wait_for_acknowledge(&self, _segment_id: i32) -> Result<(), Error> {
                Ok(())
            }
        }

        struct FakeAttach {
            segment: Arc<FakeSegment>,
        }

        impl SegmentAttach for FakeAttach {
            type Attached = Arc<FakeSegment>;

            fn attach(&self, _segment_id: i32, _capacity: usize) -> Result<Self::Attached, Error> {
                Ok(self.segment.clone())
            }
        }

        let segment_size = 10_000u64;
        let file_size = 25_000usize;
        let file: Vec<u8> = vec![7u8; file_size];

        let mut files = HashMap::new();
        files.insert("/big.bin".to_string(), file.clone());

        let channel = FakeServerChannel {
            request: RequestInfo {
                path: "/big.bin".to_string(),
                segment_id: 1,
                segment_capacity: segment_size,
            },
            ready_lengths: Mutex::new(Vec::new()),
        };
        let attacher = FakeAttach {
            segment: Arc::new(FakeSegment {
                buf: Mutex::new(vec![0u8; segment_size as usize]),
            }),
        };

        handle_cache_request(&channel, &MapStore(files), &attacher).unwrap();

        let lengths = channel.ready_lengths.lock().unwrap();
        assert_eq!(*lengths, vec![10_000, 10_000, 5_000]);
    }
}
