pub mod client_session;
pub mod errors;
pub mod pull_session;
pub mod push_session;
pub mod transport;

pub use client_session::{ClientSession, ClientSessionOption};
pub use pull_session::{PullSession, PullSessionOption};
pub use push_session::{PushSession, PushSessionOption};
pub use transport::{PublishTransport, TcpPublishTransport};
