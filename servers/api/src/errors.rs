use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ApiServerResult<T> = Result<T, ApiServerError>;
