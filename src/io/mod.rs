mod common;
mod lines;

pub use lines::{LineReader, LineWriter};


use std::time::Duration;

use thiserror::Error;

use crate::series::ParseRowError;

/// One row of a newline-delimited file.
///
/// The store keeps serde_json rows, the stage spill keeps flat pipe rows;
/// both ride the same writer and reader. An encoded record must not
/// contain a raw newline: serde_json escapes them and the flat rows hold
/// none by construction.
pub trait Record: Sized {
    /// Appends the record to `buf` as one line, without the trailing
    /// newline.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WriteError>;

    /// Parses one non-blank line.
    fn decode(line: &str) -> Result<Self, ReadError>;
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File is already locked by another process")]
    AlreadyLocked,

    #[error("Failed to acquire lock within {0:?}")]
    LockTimeout(Duration),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Malformed row: {0}")]
    MalformedRow(#[from] ParseRowError),

    #[error("File is already locked by another process")]
    AlreadyLocked,

    #[error("Failed to acquire lock within {0:?}")]
    LockTimeout(Duration),
}
