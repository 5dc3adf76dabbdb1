//! Command-line configuration, mirroring `simplecached.c`'s flag set
//! (`-t`, `-c`, `-h`).

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "getfile_cache", about = "GETFILE cache daemon")]
pub struct Config {
    /// Number of worker threads, clamped to 1-1024.
    #[arg(short = 't', long = "nthreads", default_value_t = 1)]
    pub thread_count: u16,

    /// Path to the directory of static files served by the cache.
    #[arg(short = 'c', long = "cachedir", default_value = "./")]
    pub cache_dir: PathBuf,
}
