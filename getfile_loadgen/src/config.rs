//! Command-line configuration, mirroring `gfclient_download.c`'s flag set
//! (`-s`, `-p`, `-w`, `-t`, `-n`, `-h`).

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "getfile_loadgen", about = "GETFILE load generator")]
pub struct Config {
    /// Proxy server host.
    #[arg(short = 's', long, default_value = "localhost")]
    pub server: String,

    /// Proxy server port.
    #[arg(short = 'p', long, default_value_t = 8888)]
    pub port: u16,

    /// Path to a file listing one request path per line.
    #[arg(short = 'w', long = "workload", default_value = "workload.txt")]
    pub workload_path: PathBuf,

    /// Number of worker threads.
    #[arg(short = 't', long = "nthreads", default_value_t = 1)]
    pub thread_count: u16,

    /// Number of requests issued per worker thread.
    #[arg(short = 'n', long = "nrequests", default_value_t = 1)]
    pub requests_per_thread: u32,

    /// Directory downloaded files are written under.
    #[arg(long = "download-dir", default_value = "download")]
    pub download_dir: PathBuf,
}
