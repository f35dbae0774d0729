use clap::Parser;

use crate::config::{DEFAULT_CLIENT_QUEUE_SIZE, DEFAULT_MAX_FETCHERS, DEFAULT_REQUEST_TIMEOUT_SECS};

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Source URL of the file to download
    #[arg(short = 'u', long = "url")]
    pub url: String,

    /// Destination path for the downloaded file
    #[arg(short = 'o', long = "output")]
    pub output: String,

    /// Directory for intermediate client/service files
    #[arg(long = "data-dir", default_value = "./peerget-data")]
    pub data_dir: String,

    /// Supernode address (host:port); may be given multiple times
    #[arg(short = 'n', long = "node")]
    pub node: Vec<String>,

    /// Client identifier announced to supernodes (generated if omitted)
    #[arg(long = "cid")]
    pub cid: Option<String>,

    /// Local peer port reported at registration
    #[arg(short = 'p', long = "port", default_value_t = 15000)]
    pub port: u16,

    /// Expected md5 of the complete file; verified after download
    #[arg(long = "md5")]
    pub md5: Option<String>,

    /// Extra header ("Name: value") sent to peers and the source; repeatable
    #[arg(long = "header")]
    pub header: Vec<String>,

    /// Capacity of the piece writer queue
    #[arg(long = "queue-size", default_value_t = DEFAULT_CLIENT_QUEUE_SIZE)]
    pub queue_size: usize,

    /// Maximum number of concurrent piece fetchers
    #[arg(long = "max-fetchers", default_value_t = DEFAULT_MAX_FETCHERS)]
    pub max_fetchers: usize,

    /// Per-request timeout in seconds for supernode and peer calls
    #[arg(long = "timeout", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Cap on download throughput in bytes/s, with an optional k/m/g unit
    /// (e.g. "500k"); unlimited when absent
    #[arg(long = "rate-limit")]
    pub rate_limit: Option<String>,
}
