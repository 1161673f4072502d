use tokio::sync::oneshot;
use tokio_util::bytes::Bytes;

use crate::{
    client_session::{ClientSession, ClientSessionOption},
    errors::RelaySessionResult,
    transport::PublishTransport,
};

#[derive(Debug, Clone)]
pub struct PushSessionOption {
    /// From calling `push` until the publish response arrives.
    pub push_timeout_ms: u64,
    pub write_av_timeout_ms: u64,
    pub write_buf_size: usize,
    pub write_chan_size: usize,
    pub handshake_complex_flag: bool,
}

impl Default for PushSessionOption {
    fn default() -> Self {
        Self {
            push_timeout_ms: 10_000,
            write_av_timeout_ms: 0,
            write_buf_size: 0,
            write_chan_size: 0,
            handshake_complex_flag: false,
        }
    }
}

/// Outbound publisher toward an upstream server. Thin wrapper, everything
/// interesting happens in the shared client session plumbing.
pub struct PushSession<T: PublishTransport> {
    core: ClientSession<T>,
}

impl<T: PublishTransport> PushSession<T> {
    pub fn new(transport: T, option: PushSessionOption) -> Self {
        Self {
            core: ClientSession::new(
                "RTMPPUSH",
                transport,
                ClientSessionOption {
                    do_timeout_ms: option.push_timeout_ms,
                    write_av_timeout_ms: option.write_av_timeout_ms,
                    write_buf_size: option.write_buf_size,
                    write_chan_size: option.write_chan_size,
                    handshake_complex_flag: option.handshake_complex_flag,
                },
            ),
        }
    }

    /// Blocks until ready to carry media, or fails.
    pub async fn push(&self, url: &str) -> RelaySessionResult<()> {
        self.core.do_connect(url).await
    }

    /// `chunk` must already be wire-framed.
    pub async fn write(&self, chunk: Bytes) -> RelaySessionResult<()> {
        self.core.write(chunk).await
    }

    pub async fn flush(&self) -> RelaySessionResult<()> {
        self.core.flush().await
    }

    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn wait_chan(&self) -> Option<oneshot::Receiver<RelaySessionResult<()>>> {
        self.core.wait_chan()
    }

    pub fn unique_key(&self) -> &str {
        self.core.unique_key()
    }
}
