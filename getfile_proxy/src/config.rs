//! Command-line configuration, mirroring `webproxy.c`'s `getopt_long` flag
//! set (`-n`, `-z`, `-p`, `-t`, `-s`, `-h`) one-for-one through `clap`'s
//! derive API.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "getfile_proxy", about = "GETFILE proxy server")]
pub struct Config {
    /// Number of shared-memory segments to use when talking to the cache.
    #[arg(short = 'n', long = "seg-count", default_value_t = 1)]
    pub segment_count: u16,

    /// Size, in bytes, of each shared-memory segment.
    #[arg(short = 'z', long = "seg-size", default_value_t = 1024)]
    pub segment_size: usize,

    /// Listen port.
    #[arg(short = 'p', long, default_value_t = 8888)]
    pub port: u16,

    /// Number of worker threads, clamped to 1-1024.
    #[arg(short = 't', long = "thread-count", default_value_t = 1)]
    pub thread_count: u16,

    /// URL prefix of the origin server to fall back to on a cache miss. The
    /// request path is appended to this verbatim, the same way the original
    /// proxy concatenates its libcurl URL string.
    #[arg(
        short = 's',
        long,
        default_value = "s3.amazonaws.com/content.udacity-data.com"
    )]
    pub server: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.segment_size == 0 {
            return Err("memory segment size cannot be zero".to_string());
        }
        Ok(())
    }
}
