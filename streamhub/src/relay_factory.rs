use rtmp_relay::transport::{PublishTransport, TcpPublishTransport};

/// Creates the protocol engines the group plugs its relay sessions onto. A
/// full RTMP stack swaps in its own factory; the default speaks plain TCP.
pub trait TransportFactory: Send + Sync {
    fn create_push_transport(&self) -> Box<dyn PublishTransport>;
    fn create_pull_transport(&self, stream_name: &str) -> Box<dyn PublishTransport>;
}

#[derive(Debug, Default)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create_push_transport(&self) -> Box<dyn PublishTransport> {
        Box::new(TcpPublishTransport::new())
    }

    fn create_pull_transport(&self, _stream_name: &str) -> Box<dyn PublishTransport> {
        Box::new(TcpPublishTransport::new())
    }
}
