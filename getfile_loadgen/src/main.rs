//! GETFILE load generator binary: replays a workload of request paths
//! against a proxy using a fixed pool of worker threads, writing each
//! downloaded file to disk.
//!
//! Grounded on `gfclient_download.c`'s `main`/`enqueue`/`dequeue` structure:
//! `rqst_cnt = nrequests * nthreads` jobs are pushed onto a shared queue up
//! front, then a fixed worker pool drains it. Per-request state (the output
//! file handle) is owned by the worker performing that request instead of
//! being threaded through a `void*` argument shared across callbacks.

mod config;
mod workload;

use clap::Parser;
use config::Config;
use getfile::{ClientRequest, Outcome, WorkQueue};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::parse();

    let paths = workload::load_workload(&config.workload_path)?;
    if paths.is_empty() {
        anyhow::bail!("workload file {:?} contained no paths", config.workload_path);
    }

    let queue = Arc::new(WorkQueue::new());
    let total_requests = config.requests_per_thread as usize * config.thread_count as usize;
    for i in 0..total_requests {
        queue.submit(paths[i % paths.len()].clone());
    }
    queue.close();

    let succeeded = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::new();
    for index in 0..config.thread_count {
        let queue = queue.clone();
        let server = config.server.clone();
        let port = config.port;
        let download_dir = config.download_dir.clone();
        let succeeded = succeeded.clone();
        let failed = failed.clone();

        workers.push(
            std::thread::Builder::new()
                .name(format!("getfile::loadgen::worker-{index}"))
                .spawn(move || {
                    worker_loop(&queue, &server, port, &download_dir, &succeeded, &failed)
                })
                .expect("failed to spawn loadgen worker thread"),
        );
    }

    for worker in workers {
        let _ = worker.join();
    }

    log::info!(
        "done: {} succeeded, {} failed",
        succeeded.load(Ordering::SeqCst),
        failed.load(Ordering::SeqCst)
    );
    Ok(())
}

fn worker_loop(
    queue: &WorkQueue<String>,
    server: &str,
    port: u16,
    download_dir: &Path,
    succeeded: &AtomicU64,
    failed: &AtomicU64,
) {
    loop {
        let path = match queue.pop() {
            getfile::queue::PopResult::Item(path) => path,
            getfile::queue::PopResult::Drained => return,
        };

        match fetch_one(server, port, &path, download_dir) {
            Ok(Outcome::Ok) => {
                succeeded.fetch_add(1, Ordering::SeqCst);
                log::info!("fetched {path}");
            }
            Ok(outcome) => {
                failed.fetch_add(1, Ordering::SeqCst);
                log::warn!("request for {path} returned {outcome:?}");
            }
            Err(err) => {
                failed.fetch_add(1, Ordering::SeqCst);
                log::error!("request for {path} failed: {err}");
            }
        }
    }
}

fn fetch_one(
    server: &str,
    port: u16,
    path: &str,
    download_dir: &Path,
) -> anyhow::Result<Outcome> {
    let local_path = local_path_for(download_dir, path);
    if let Some(parent) = local_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&local_path)?;

    let mut request = ClientRequest::new(server, port);
    request.set_path(path);
    request.set_write_callback(move |chunk| {
        let _ = file.write_all(chunk);
    });
    request.perform()?;
    Ok(request.status())
}

/// Maps a request path like `/a/b.txt` onto `download_dir/a/b.txt`,
/// matching `gfclient_download.c`'s `localPath` helper.
fn local_path_for(download_dir: &Path, request_path: &str) -> PathBuf {
    download_dir.join(request_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_strips_leading_slash() {
        let dir = Path::new("download");
        assert_eq!(
            local_path_for(dir, "/a/b.txt"),
            PathBuf::from("download/a/b.txt")
        );
    }
}
