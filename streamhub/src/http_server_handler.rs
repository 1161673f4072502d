use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use httpflv_server::{SubSession, SubSessionKind};
use tokio::net::{TcpListener, TcpStream};

use crate::errors::StreamHubResult;

/// Rewrites (or rejects) the requested url before the session is offered to
/// the observer.
pub type BeforeStreamHttpReqHook =
    Arc<dyn Fn(&str, &HashMap<String, String>) -> Result<String, String> + Send + Sync>;

/// A rejecting result from `on_new_*` closes the connection; an accepting
/// one obliges the observer to track the session until `on_del_*`.
#[async_trait]
pub trait HttpServerHandlerObserver: Send + Sync {
    async fn on_new_httpflv_sub_session(&self, session: &Arc<SubSession>) -> StreamHubResult<()>;
    async fn on_del_httpflv_sub_session(&self, session: &Arc<SubSession>);
    async fn on_new_httpts_sub_session(&self, session: &Arc<SubSession>) -> StreamHubResult<()>;
    async fn on_del_httpts_sub_session(&self, session: &Arc<SubSession>);
}

/// Stateless glue between the raw-TCP front door and the group fan-out. The
/// connection is owned by the session from the first byte on; no HTTP
/// framework sits in between.
pub struct HttpServerHandler {
    observer: Arc<dyn HttpServerHandlerObserver>,
    before_stream_http_req: Option<BeforeStreamHttpReqHook>,
}

impl HttpServerHandler {
    pub fn new(
        observer: Arc<dyn HttpServerHandlerObserver>,
        before_stream_http_req: Option<BeforeStreamHttpReqHook>,
    ) -> Self {
        Self {
            observer,
            before_stream_http_req,
        }
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> StreamHubResult<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("http stream server is running, addr: {}", addr);
        loop {
            let (conn, peer_addr) = listener.accept().await?;
            tracing::debug!("got new http stream connection, peer_addr: {}", peer_addr);
            let handler = Arc::clone(&self);
            tokio::spawn(async move { handler.serve_sub_session(conn).await });
        }
    }

    pub async fn serve_sub_session(&self, conn: TcpStream) {
        let mut session = SubSession::new(conn);
        if let Err(err) = session.read_request().await {
            tracing::error!("sub session request rejected: {}", err);
            return;
        }

        if let Some(hook) = &self.before_stream_http_req {
            match hook(session.uri(), session.headers()) {
                Ok(rewritten) => {
                    if rewritten != session.uri() {
                        if let Err(err) = session.parse_uri(&rewritten) {
                            tracing::error!(
                                "[{}] rewritten url does not parse: {}",
                                session.unique_key(),
                                err
                            );
                            session.dispose("bad rewritten url");
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!("[{}] rejected by hook: {}", session.unique_key(), err);
                    session.dispose("rejected by stream http req hook");
                    return;
                }
            }
        }

        let session = Arc::new(session);
        match session.kind() {
            SubSessionKind::HttpFlv => {
                if let Err(err) = self.observer.on_new_httpflv_sub_session(&session).await {
                    tracing::error!(
                        "[{}] dispose by observer, err: {}",
                        session.unique_key(),
                        err
                    );
                    session.dispose("rejected by observer");
                    return;
                }
                let res = Arc::clone(&session).run_loop().await;
                tracing::info!(
                    "[{}] sub session loop done, res: {:?}",
                    session.unique_key(),
                    res
                );
                self.observer.on_del_httpflv_sub_session(&session).await;
            }
            SubSessionKind::HttpTs => {
                if let Err(err) = self.observer.on_new_httpts_sub_session(&session).await {
                    tracing::error!(
                        "[{}] dispose by observer, err: {}",
                        session.unique_key(),
                        err
                    );
                    session.dispose("rejected by observer");
                    return;
                }
                let res = Arc::clone(&session).run_loop().await;
                tracing::info!(
                    "[{}] sub session loop done, res: {:?}",
                    session.unique_key(),
                    res
                );
                self.observer.on_del_httpts_sub_session(&session).await;
            }
        }
    }
}
