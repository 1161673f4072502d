use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_util::bytes::Bytes;
use url::Url;

use crate::errors::{RelaySessionError, RelaySessionResult};

pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// The protocol engine behind a relay client session. The session layer only
/// drives lifecycle and byte delivery; handshake, signaling and chunking all
/// live behind this trait.
#[async_trait]
pub trait PublishTransport: Send + 'static {
    /// Connects and completes whatever signaling the protocol needs before
    /// media bytes may flow.
    async fn do_connect(&mut self, url: &str) -> RelaySessionResult<()>;
    /// `chunk` is already wire-framed; the transport must write it fully.
    async fn write(&mut self, chunk: Bytes) -> RelaySessionResult<()>;
    async fn flush(&mut self) -> RelaySessionResult<()>;
    async fn close(&mut self) -> RelaySessionResult<()>;
}

#[async_trait]
impl PublishTransport for Box<dyn PublishTransport> {
    async fn do_connect(&mut self, url: &str) -> RelaySessionResult<()> {
        (**self).do_connect(url).await
    }

    async fn write(&mut self, chunk: Bytes) -> RelaySessionResult<()> {
        (**self).write(chunk).await
    }

    async fn flush(&mut self) -> RelaySessionResult<()> {
        (**self).flush().await
    }

    async fn close(&mut self) -> RelaySessionResult<()> {
        (**self).close().await
    }
}

/// Plain-TCP transport: connects to the `rtmp://host[:port]/...` endpoint and
/// forwards pre-framed bytes verbatim. A full RTMP engine plugs in by
/// replacing this implementation.
#[derive(Debug, Default)]
pub struct TcpPublishTransport {
    stream: Option<TcpStream>,
}

impl TcpPublishTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublishTransport for TcpPublishTransport {
    async fn do_connect(&mut self, url: &str) -> RelaySessionResult<()> {
        let parsed = Url::parse(url)
            .map_err(|err| RelaySessionError::InvalidUrl(format!("{}: {}", url, err)))?;
        if parsed.scheme() != "rtmp" {
            return Err(RelaySessionError::InvalidUrl(format!(
                "unsupported scheme in {}",
                url
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| RelaySessionError::InvalidUrl(format!("no host in {}", url)))?;
        let port = parsed.port().unwrap_or(DEFAULT_RTMP_PORT);
        self.stream = Some(TcpStream::connect((host, port)).await?);
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> RelaySessionResult<()> {
        let stream = self.stream.as_mut().ok_or(RelaySessionError::Disposed)?;
        stream.write_all(&chunk).await?;
        Ok(())
    }

    async fn flush(&mut self) -> RelaySessionResult<()> {
        let stream = self.stream.as_mut().ok_or(RelaySessionError::Disposed)?;
        stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> RelaySessionResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}
