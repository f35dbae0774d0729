use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    // Registration errors
    #[error("register to supernode failed: {0}")]
    Register(String),

    #[error("no supernode configured")]
    NoSupernode,

    // Supernode task errors
    #[error("pull piece task failed after {migrations} migrations (last code: {last_code:?})")]
    TrackerExhausted {
        migrations: u32,
        last_code: Option<i32>,
    },

    #[error("supernode continue data is malformed: {0}")]
    MalformedTaskData(String),

    // Piece/range errors
    #[error("invalid piece range: {0}")]
    InvalidRange(String),

    // Sink errors
    #[error("piece sink failed: {0}")]
    Sink(String),

    #[error("piece sink queue closed")]
    SinkClosed,

    // Finish/move errors
    #[error("move to target failed: {0}")]
    Move(String),

    #[error("md5 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // Back-to-source errors
    #[error("source download failed: {0}")]
    Source(String),

    #[error("source returned status {0}")]
    SourceStatus(u16),

    // File I/O errors
    #[error("file I/O error: {0}")]
    Io(#[from] io::Error),

    // External errors (wrapped)
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = anyhow::Result<T>;

impl DownloadError {
    pub fn register(msg: impl Into<String>) -> Self {
        DownloadError::Register(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        DownloadError::Sink(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        DownloadError::Source(msg.into())
    }

    pub fn invalid_range(range: impl Into<String>) -> Self {
        DownloadError::InvalidRange(range.into())
    }
}
