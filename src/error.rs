//! Error types for tsvault.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tsvault operations.
pub type Result<T> = std::result::Result<T, TsVaultError>;

/// Main error type for tsvault operations.
#[derive(Error, Debug)]
pub enum TsVaultError {
    #[error("Timestamp {timestamp} is older than the TTL lower bound {bound}")]
    OutOfTtl { timestamp: i64, bound: i64 },

    #[error("Insufficient disk space for directory {dir:?}: {details}")]
    DiskSpaceInsufficient { dir: PathBuf, details: String },

    #[error("Failed to load file {path:?}: {details}")]
    LoadFile { path: PathBuf, details: String },

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Failed to close buffer for {path:?}: {details}")]
    BufferClose { path: PathBuf, details: String },

    #[error("Write rejected: {0}")]
    WriteProcess(String),

    #[error("Metadata error for series {series}: {details}")]
    Metadata { series: String, details: String },

    #[error("Failed to recover {path:?}: {details}")]
    Recover { path: PathBuf, details: String },

    #[error("Invalid data file name: {0}")]
    InvalidFileName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Storage group is read-only")]
    ReadOnly,

    #[error("Storage group is shutting down")]
    ShuttingDown,

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("Other error: {0}")]
    Other(String),
}

impl<T> From<crossbeam_channel::SendError<T>> for TsVaultError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        TsVaultError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}
