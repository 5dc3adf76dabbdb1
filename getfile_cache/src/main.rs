//! GETFILE cache daemon binary: serves file content out of a directory over
//! the shared-memory IPC channel.
//!
//! Grounded on `simplecached.c`'s `main`/`_init_stuff`/`_sig_handler`
//! structure: the message queue is created once at startup (the cache owns
//! its lifetime, unlike the proxy's segment pool), a fixed pool of worker
//! threads each loop on request/response handling, and SIGINT/SIGTERM flip
//! a shutdown flag instead of mutating shared state from inside a raw
//! signal handler.

mod blob_store;
mod config;

use blob_store::DirectoryBlobStore;
use clap::Parser;
use config::Config;
use getfile_internal::{MessageQueue, MESSAGE_QUEUE_KEY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::parse();
    let store = Arc::new(DirectoryBlobStore::new(config.cache_dir.clone()));
    let mq = Arc::new(MessageQueue::create(MESSAGE_QUEUE_KEY)?);

    let shutdown = Arc::new(AtomicBool::new(false));
    register_shutdown_signals(shutdown.clone());

    let thread_count = config.thread_count.clamp(1, 1024);
    log::info!(
        "getfile_cache serving {:?} with {} thread(s)",
        config.cache_dir,
        thread_count
    );

    let mut workers = Vec::new();
    for index in 0..thread_count {
        let mq = mq.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        workers.push(
            std::thread::Builder::new()
                .name(format!("getfile::cache::worker-{index}"))
                .spawn(move || worker_loop(&mq, &*store, &shutdown))
                .expect("failed to spawn cache worker thread"),
        );
    }

    for worker in workers {
        let _ = worker.join();
    }

    match Arc::try_unwrap(mq) {
        Ok(mq) => mq.destroy()?,
        Err(_) => log::warn!("message queue still referenced at shutdown, leaving it in place"),
    }

    Ok(())
}

fn worker_loop(mq: &MessageQueue, store: &DirectoryBlobStore, shutdown: &AtomicBool) {
    let attacher = getfile::pipeline::SystemVSegments;
    while !shutdown.load(Ordering::SeqCst) {
        if let Err(err) = getfile::pipeline::handle_cache_request(mq, store, &attacher) {
            log::error!("cache request failed: {err}");
        }
    }
}

fn register_shutdown_signals(flag: Arc<AtomicBool>) {
    use nix::sys::signal::{self, SigHandler, Signal};

    static RECEIVED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_: i32) {
        RECEIVED.store(true, Ordering::SeqCst);
    }

    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(on_signal));
    }

    std::thread::Builder::new()
        .name("getfile::cache::signal-watch".to_string())
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
