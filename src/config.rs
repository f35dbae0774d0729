use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;

use crate::cli::Args;
use crate::error::Result;

pub const DEFAULT_CLIENT_QUEUE_SIZE: usize = 4;
pub const DEFAULT_MAX_FETCHERS: usize = 4;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Numeric codes shared with the supernode. These must match the server
/// contract exactly; they are not negotiated.
pub mod codes {
    pub const SUCCESS: i32 = 200;

    // Task codes returned by pull_piece_task
    pub const TASK_CONTINUE: i32 = 601;
    pub const TASK_FINISH: i32 = 602;
    pub const TASK_WAIT: i32 = 603;
    pub const TASK_LIMITED: i32 = 604;
    pub const TASK_SOURCE_ERROR: i32 = 605;

    // Per-piece results reported back to the supernode
    pub const RESULT_FAIL: i32 = 500;
    pub const RESULT_SUCCESS: i32 = 501;
    pub const RESULT_INVALID: i32 = 502;
    pub const RESULT_SEMI_SUCCESS: i32 = 503;
    pub const RESULT_RUNNING: i32 = 504;

    // Task status reported back to the supernode
    pub const STATUS_START: i32 = 700;
    pub const STATUS_RUNNING: i32 = 701;
    pub const STATUS_FINISH: i32 = 702;
}

/// Immutable parameters of one download job. Built once from the CLI and
/// shared via Arc; everything mutable lives in the orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source URL of the file, used for registration and back-to-source.
    pub url: String,
    /// Final destination of the assembled file.
    pub target_file: PathBuf,
    /// Directory holding the client and service files during download.
    pub data_dir: PathBuf,
    /// Local client identifier announced to supernodes and peers.
    pub cid: String,
    /// Port other peers would fetch from; reported at registration.
    pub peer_port: u16,
    /// Candidate supernodes, tried in order at registration.
    pub supernodes: Vec<String>,
    /// Optional md5 of the complete file, verified after the final move.
    pub md5: Option<String>,
    /// Extra request headers ("Name: value") forwarded to peers and source.
    pub headers: Vec<String>,
    /// Capacity of the piece sink queue.
    pub client_queue_size: usize,
    /// Cap on concurrently running piece fetchers.
    pub max_fetchers: usize,
    /// Per-request deadline for supernode and peer HTTP calls.
    pub timeout: Duration,
    /// Download throughput cap in bytes/s; None means unlimited.
    pub rate_limit: Option<u64>,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.node.is_empty() {
            return Err(anyhow!("at least one supernode is required"));
        }

        let target_file = PathBuf::from(&args.output);
        if target_file.file_name().is_none() {
            return Err(anyhow!("output path {:?} has no file name", target_file));
        }

        let rate_limit = args
            .rate_limit
            .as_deref()
            .map(crate::bandwidth_limiter::parse_rate)
            .transpose()?;

        Ok(Self {
            url: args.url,
            target_file,
            data_dir: PathBuf::from(args.data_dir),
            cid: args.cid.unwrap_or_else(generate_cid),
            peer_port: args.port,
            supernodes: args.node,
            md5: args.md5,
            headers: args.header,
            client_queue_size: args.queue_size,
            max_fetchers: args.max_fetchers,
            timeout: Duration::from_secs(args.timeout),
            rate_limit,
        })
    }

    /// Name of the task file inside the data directory, derived from the
    /// target file name so concurrent jobs for different targets don't collide.
    pub fn task_file_name(&self) -> String {
        let name = self
            .target_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        format!("{}-{}", name, self.cid)
    }

    /// File owned by this download job.
    pub fn client_file_path(&self) -> PathBuf {
        self.data_dir.join(self.task_file_name())
    }

    /// File served to other peers by a full client; written alongside.
    pub fn service_file_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.service", self.task_file_name()))
    }

    /// Temp path next to the target, used when the data dir cannot be
    /// hardlinked into the target filesystem.
    pub fn temp_target(&self) -> PathBuf {
        let mut name = self
            .target_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        name.push_str(".tmp");
        self.target_file.with_file_name(name)
    }
}

fn generate_cid() -> String {
    let suffix: u32 = rand::random();
    format!("cli-{}-{:08x}", std::process::id(), suffix)
}
