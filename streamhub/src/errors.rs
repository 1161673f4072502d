use std::io;

use rtmp_relay::errors::RelaySessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamHubError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("stream is already publishing, stream_name: {stream_name}, session: {session_id}")]
    DuplicatePublisher {
        stream_name: String,
        session_id: String,
    },
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("relay session error: {0}")]
    Relay(#[from] RelaySessionError),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

pub type StreamHubResult<T> = Result<T, StreamHubError>;
