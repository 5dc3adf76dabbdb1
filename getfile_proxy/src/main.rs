//! GETFILE proxy binary: accepts client connections over TCP, serves
//! content from the cache daemon over the shared-memory IPC channel, and
//! falls back to an HTTP origin on a cache miss.
//!
//! Grounded on `webproxy.c`'s `main`/`_init_stuff`/`_sig_handler` structure:
//! the segment pool and message queue are set up once at startup, a
//! `Server` runs the accept loop and worker pool, and SIGINT/SIGTERM flip
//! the shutdown flag instead of calling `gfserver_stop` from inside a raw
//! signal handler.

mod config;

use clap::Parser;
use config::Config;
use getfile::server::{Handler, IncomingRequest, Server, ServerContext};
use getfile_internal::{MessageQueue, SegmentPool, MESSAGE_QUEUE_KEY};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Seed for this proxy's segment keys. The original C source's seed
/// overflows a 32-bit `key_t`; see DESIGN.md for why this crate uses a
/// valid `i32` constant instead.
const SEGMENT_KEY_SEED: libc::key_t = 0x4745_5446;

struct ProxyHandler {
    segment_pool: SegmentPool,
    mq: MessageQueue,
    origin: getfile::origin::HttpOriginFetcher,
}

impl Handler for ProxyHandler {
    fn handle(&self, mut ctx: ServerContext, request: IncomingRequest) {
        match getfile::pipeline::handle_connection(
            &mut ctx,
            &request.path,
            &self.segment_pool,
            &self.mq,
            &self.origin,
        ) {
            Ok(bytes) => log::info!("served {} ({bytes} bytes) to {}", request.path, ctx_peer(&ctx)),
            Err(err) => log::error!("request for {} failed: {err}", request.path),
        }
    }
}

fn ctx_peer(ctx: &ServerContext) -> std::net::SocketAddr {
    ctx.peer_addr
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::parse();
    config.validate().map_err(|msg| anyhow::anyhow!(msg))?;

    let segment_pool = SegmentPool::create(
        SEGMENT_KEY_SEED,
        config.segment_count,
        config.segment_size,
    )?;
    let mq = MessageQueue::connect_retrying(MESSAGE_QUEUE_KEY)?;
    let origin = getfile::origin::HttpOriginFetcher::new(&config.server);

    let handler = Arc::new(ProxyHandler {
        segment_pool,
        mq,
        origin,
    });

    let server_config = getfile::ServerConfig::new(config.port)
        .with_max_pending(10)
        .with_worker_threads(config.thread_count);
    let server = Server::new(server_config);

    let shutdown = server.shutdown_flag();
    register_shutdown_signals(shutdown);

    log::info!("getfile_proxy starting on port {}", config.port);
    server.serve(handler.clone())?;

    match Arc::try_unwrap(handler) {
        Ok(ProxyHandler {
            segment_pool, mq, ..
        }) => {
            segment_pool.destroy()?;
            mq.destroy()?;
        }
        Err(_) => log::warn!(
            "segment pool and message queue still referenced at shutdown, leaving them in place"
        ),
    }
    Ok(())
}

fn register_shutdown_signals(flag: Arc<std::sync::atomic::AtomicBool>) {
    use nix::sys::signal::{self, SigHandler, Signal};

    // A bare libc handler can only touch async-signal-safe state, so it
    // can't reach into `flag` directly; record delivery with a second
    // static atomic and poll it from a dedicated thread instead of doing
    // any real work inside the handler itself.
    static RECEIVED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    extern "C" fn on_signal(_: i32) {
        RECEIVED.store(true, Ordering::SeqCst);
    }

    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(on_signal));
    }

    std::thread::Builder::new()
        .name("getfile::proxy::signal-watch".to_string())
        .spawn(move || loop {
            if RECEIVED.load(Ordering::SeqCst) {
                log::warn!("received shutdown signal, closing down");
                flag.store(true, Ordering::SeqCst);
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(200));
        })
        .expect("failed to spawn signal-watch thread");
}
