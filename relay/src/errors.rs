use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelaySessionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),
    #[error("av write timed out after {0}ms")]
    WriteTimeout(u64),
    #[error("write queue full")]
    WriteQueueFull,
    #[error("session already disposed")]
    Disposed,
}

pub type RelaySessionResult<T> = Result<T, RelaySessionError>;
