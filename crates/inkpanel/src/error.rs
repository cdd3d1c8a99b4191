//! Error kinds of the panel core.
//!
//! None of these end the process: the controller logs them and falls back to
//! cached or placeholder content.

use std::path::PathBuf;

use thiserror::Error;

/// A failed remote image retrieval.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("server answered with status {0}")]
    ServerError(u16),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl FetchError {
    /// Only these kinds are worth another attempt within one request cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::NetworkUnreachable(_))
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: &'static str },
}

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("panel bus error: {0}")]
    Bus(String),
    #[error("panel stayed busy for more than {0:?}")]
    BusyTimeout(std::time::Duration),
    #[error("image could not be decoded: {0}")]
    InvalidImage(String),
    #[error("frame is {actual} bytes, panel expects {expected}")]
    FrameSize { expected: usize, actual: usize },
}

/// A GPIO read glitch. Always recovered by polling again.
#[derive(Error, Debug)]
#[error("gpio line {line}: {message}")]
pub struct InputError {
    pub line: u32,
    pub message: String,
}
