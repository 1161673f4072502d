use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpFlvSessionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid http request: {0}")]
    InvalidHttpRequest(String),
    #[error("session already closed")]
    SessionClosed,
}

pub type HttpFlvSessionResult<T> = Result<T, HttpFlvSessionError>;
