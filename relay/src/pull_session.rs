use tokio::sync::oneshot;

use crate::{
    client_session::{ClientSession, ClientSessionOption},
    errors::RelaySessionResult,
    transport::PublishTransport,
};

#[derive(Debug, Clone)]
pub struct PullSessionOption {
    pub pull_timeout_ms: u64,
}

impl Default for PullSessionOption {
    fn default() -> Self {
        Self {
            pull_timeout_ms: 10_000,
        }
    }
}

/// Inbound relay: fetches a stream from an upstream server so it can be
/// republished locally. Media delivery into the hub is wired up by the
/// transport at construction time; this wrapper only drives lifecycle.
pub struct PullSession<T: PublishTransport> {
    core: ClientSession<T>,
}

impl<T: PublishTransport> PullSession<T> {
    pub fn new(transport: T, option: PullSessionOption) -> Self {
        Self {
            core: ClientSession::new(
                "RTMPPULL",
                transport,
                ClientSessionOption {
                    do_timeout_ms: option.pull_timeout_ms,
                    ..Default::default()
                },
            ),
        }
    }

    pub async fn pull(&self, url: &str) -> RelaySessionResult<()> {
        self.core.do_connect(url).await
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
