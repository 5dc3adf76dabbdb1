//! The server-side framework shared by the proxy: accept connections,
//! dispatch them through a [`WorkQueue`], parse the GETFILE request header,
//! and hand the parsed path to a [`Handler`].
//!
//! Grounded on `gfserver.c`'s `gfserver_serve`/`gfs_handle_requests` split
//! (accept loop enqueues raw contexts; a worker pool dequeues and does the
//! header parse + dispatch): the function-pointer-plus-`void*` handler
//! becomes a `Handler` trait object, and the global `steque_t`/mutex/condvar
//! triplet becomes an explicit `WorkQueue<ServerContext>` owned by the
//! `Server`.

use crate::protocol::{self, HeaderParser, Method, Status};
use crate::queue::{PopResult, WorkQueue};
use crate::transport::{self, Listener};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] transport::Error),
}

/// Immutable server configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_pending: i32,
    pub worker_threads: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        ServerConfig {
            port,
            max_pending: 10,
            worker_threads: 1,
        }
    }

    pub fn with_max_pending(mut self, max_pending: i32) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Worker-thread count, clamped to the supported 1-1024 range.
    pub fn with_worker_threads(mut self, worker_threads: u16) -> Self {
        self.worker_threads = worker_threads.clamp(1, 1024);
        self
    }
}

/// The connection context bound to one accepted socket. Owned by whichever
/// worker dequeues it; dropped (and the socket closed) once the response
/// completes or the request is aborted.
pub struct ServerContext {
    socket: TcpStream,
    pub peer_addr: SocketAddr,
    pub status: Status,
    config: Arc<ServerConfig>,
}

impl ServerContext {
    fn new(socket: TcpStream, peer_addr: SocketAddr, config: Arc<ServerConfig>) -> Self {
        ServerContext {
            socket,
            peer_addr,
            status: Status::Error,
            config,
        }
    }

    /// The configuration of the server that accepted this connection.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Sends the GETFILE response header. Must be called before `send_body`.
    pub fn send_header(&mut self, status: Status, length: Option<u64>) -> std::io::Result<()> {
        self.status = status;
        let header = protocol::encode_response_header(status, length);
        self.socket.write_all(&header)
    }

    /// Sends a chunk of body bytes, verbatim.
    pub fn send_body(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.socket.write_all(data)
    }

    /// Aborts the connection: shuts down both directions of the socket and
    /// drops the context. The original C library's `gfs_abort` was a no-op;
    /// here it actually tears down the socket instead of leaving it inert.
    pub fn abort(self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}

/// A parsed incoming request, ready for dispatch.
pub struct IncomingRequest {
    pub path: String,
    pub method: Method,
}

/// Receives one fully-parsed request and drives the response.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: ServerContext, request: IncomingRequest);
}

/// Runs the accept loop and worker pool for a [`ServerConfig`]. The accept
/// loop never calls `WorkQueue::close` — the proxy runs until the process
/// observes a shutdown signal.
pub struct Server {
    config: Arc<ServerConfig>,
    queue: Arc<WorkQueue<ServerContext>>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config: Arc::new(config),
            queue: Arc::new(WorkQueue::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Binds the listening socket, spawns the worker pool, and runs the
    /// accept loop on the calling thread. Returns once the listener's
    /// `accept` fails (e.g. because the socket was closed during shutdown).
    pub fn serve(&self, handler: Arc<dyn Handler>) -> Result<(), Error> {
        let listener = Listener::bind(self.config.port, self.config.max_pending)?;

        for worker_id in 0..self.config.worker_threads {
            let queue = self.queue.clone();
            let handler = handler.clone();
            std::thread::Builder::new()
                .name(format!("getfile::proxy::worker-{worker_id}"))
                .spawn(move || worker_loop(&queue, handler.as_ref()))
                .expect("failed to spawn proxy worker thread");
        }

        log::info!(
            "proxy listening on port {} with {} worker thread(s)",
            self.config.port,
            self.config.worker_threads
        );

        while !self.shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((socket, peer_addr)) => {
                    self.queue
                        .submit(ServerContext::new(socket, peer_addr, self.config.clone()));
                }
                Err(err) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    log::error!("accept failed: {err}");
                }
            }
        }
        Ok(())
    }
}

fn worker_loop(queue: &WorkQueue<ServerContext>, handler: &dyn Handler) {
    loop {
        let mut ctx = match queue.pop() {
            PopResult::Item(ctx) => ctx,
            PopResult::Drained => return,
        };

        match parse_request(&mut ctx) {
            Ok(request) => handler.handle(ctx, request),
            Err(status) => {
                let _ = ctx.send_header(status, None);
            }
        }
    }
}

/// Parses the incoming GETFILE request header off `ctx`'s socket. Returns
/// the status to send if parsing fails or the request is otherwise
/// rejected (HEAD method, missing leading slash).
fn parse_request(ctx: &mut ServerContext) -> Result<IncomingRequest, Status> {
    let mut parser = HeaderParser::new();
    let mut buf = [0u8; READ_CHUNK];
    let parsed = loop {
        let n = ctx.socket.read(&mut buf).map_err(|_| Status::Error)?;
        if n == 0 {
            return Err(Status::Error);
        }
        parser.add_bytes(&buf[..n]);
        match parser.try_parse_request() {
            Ok(Some(parsed)) => break parsed,
            Ok(None) => continue,
            Err(_) => return Err(Status::Error),
        }
    };

    if parsed.method != Method::Get {
        return Err(Status::FileNotFound);
    }
    if !protocol::is_valid_path(&parsed.path) {
        return Err(Status::FileNotFound);
    }

    Ok(IncomingRequest {
        path: parsed.path,
        method: parsed.method,
    })
}
