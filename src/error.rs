use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrucibleError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Transcode failed: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Replace failed: {0}")]
    Replace(#[from] ReplaceError),

    #[error("Stale lease for file {file_id}")]
    StaleLease { file_id: i64 },

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

/// Probe failures are retryable once, then the file goes to `failed`.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("unreadable: {0}")]
    Unreadable(String),

    #[error("probe timed out after {0}s")]
    Timeout(u64),

    #[error("malformed probe output: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("encoder crashed (exit {exit_code:?}): {message}")]
    EncoderCrash {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("encoder killed")]
    Killed,

    #[error("encoder produced no output")]
    EmptyOutput,

    #[error("encoder io error: {0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("content hash mismatch (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },

    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    #[error("transfer rejected: {0}")]
    Rejected(String),

    #[error("transfer io error: {0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub enum ReplaceError {
    #[error("insufficient savings: output {output} bytes vs source {source_size} bytes")]
    InsufficientSavings { output: u64, source_size: u64 },

    #[error("backup step failed for {path}: {message}")]
    BackupFailed { path: String, message: String },

    #[error("swap failed for {path}: {message}, original restored")]
    SwapFailed { path: String, message: String },

    #[error("rollback failed for {path}: {message}; backup left at {backup}")]
    RollbackFailed {
        path: String,
        backup: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, CrucibleError>;
