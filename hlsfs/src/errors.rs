use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsLayerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("file not found: {0:?}")]
    NotFound(PathBuf),
}

pub type FsLayerResult<T> = Result<T, FsLayerError>;
