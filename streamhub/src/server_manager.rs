use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use httpflv_server::SubSession;
use url::Url;

use crate::{
    API_VERSION, VERSION,
    api::{
        ApiResp, CtrlKickSessionReq, CtrlStartRelayPullData, CtrlStartRelayPullReq,
        CtrlStartRtpPubData, CtrlStartRtpPubReq, CtrlStopRelayPullData, DESP_GROUP_NOT_FOUND,
        DESP_SESSION_NOT_FOUND, ERROR_CODE_GROUP_NOT_FOUND, ERROR_CODE_SESSION_NOT_FOUND,
        ERROR_CODE_START_RELAY_PULL_FAIL, ERROR_CODE_START_RTP_PUB_FAIL, StatGroup,
        StatServerInfo,
    },
    errors::StreamHubResult,
    group::{BeforeRelayPushHook, Group, GroupConfig, PublisherKind, RelayPushConfig},
    group_manager::GroupManager,
    http_server_handler::HttpServerHandlerObserver,
    relay_factory::TransportFactory,
};

#[derive(Debug, Clone, Default)]
pub struct StreamHubConfig {
    pub server_id: String,
    pub relay_push: RelayPushConfig,
}

/// Top-level facade over the group registry. Every API operation holds the
/// manager mutex for the whole call, so control-plane work is totally
/// ordered against the observer callbacks that mutate the registry.
pub struct ServerManager {
    server_start_time: SystemTime,
    config: StreamHubConfig,
    group_manager: GroupManager,
    transport_factory: Arc<dyn TransportFactory>,
    before_relay_push: Option<BeforeRelayPushHook>,
    mutex: tokio::sync::Mutex<()>,
}

impl ServerManager {
    pub fn new(
        config: StreamHubConfig,
        transport_factory: Arc<dyn TransportFactory>,
        before_relay_push: Option<BeforeRelayPushHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_start_time: SystemTime::now(),
            config,
            group_manager: GroupManager::new(),
            transport_factory,
            before_relay_push,
            mutex: tokio::sync::Mutex::new(()),
        })
    }

    fn create_group(&self, app_name: &str, stream_name: &str) -> Arc<Group> {
        Group::new(
            app_name,
            stream_name,
            GroupConfig {
                relay_push: self.config.relay_push.clone(),
            },
            self.before_relay_push.clone(),
            Arc::clone(&self.transport_factory),
        )
    }

    fn get_or_create_group(&self, app_name: &str, stream_name: &str) -> Arc<Group> {
        self.group_manager
            .get_or_create_group(stream_name, || self.create_group(app_name, stream_name))
    }

    fn snapshot_groups(&self) -> Vec<Arc<Group>> {
        let mut groups = Vec::with_capacity(self.group_manager.len());
        self.group_manager.iterate(|group| {
            groups.push(Arc::clone(group));
            true
        });
        groups
    }

    async fn clean_group_if_dead(&self, stream_name: &str) {
        if let Some(group) = self.group_manager.get_group(stream_name) {
            if group.is_dead().await {
                self.group_manager.del_group(stream_name);
                tracing::info!("[{}] group is dead, unregistered", group.unique_key);
            }
        }
    }

    // ----- ingest side ----------------------------------------------------

    /// Entry point for protocol servers (rtmp/rtsp ingest). The group is
    /// created on demand and the at-most-one-publisher invariant enforced.
    pub async fn on_publisher_start(
        &self,
        app_name: &str,
        stream_name: &str,
        kind: PublisherKind,
        session_id: &str,
    ) -> StreamHubResult<Arc<Group>> {
        let _guard = self.mutex.lock().await;
        let group = self.get_or_create_group(app_name, stream_name);
        group.attach_publisher(kind, session_id).await?;
        Ok(group)
    }

    pub async fn on_publisher_stop(&self, stream_name: &str, session_id: &str) {
        let _guard = self.mutex.lock().await;
        if let Some(group) = self.group_manager.get_group(stream_name) {
            group.detach_publisher(session_id).await;
        }
        self.clean_group_if_dead(stream_name).await;
    }

    // ----- stat api -------------------------------------------------------

    pub fn stat_server_info(&self) -> StatServerInfo {
        StatServerInfo {
            server_id: self.config.server_id.clone(),
            version: VERSION.to_string(),
            api_version: API_VERSION.to_string(),
            start_time_unix: self
                .server_start_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    pub async fn stat_all_group(&self) -> Vec<StatGroup> {
        let _guard = self.mutex.lock().await;
        let groups = self.snapshot_groups();
        let mut stats = Vec::with_capacity(groups.len());
        for group in groups {
            stats.push(group.get_stat().await);
        }
        stats
    }

    pub async fn stat_group(&self, stream_name: &str) -> Option<StatGroup> {
        let _guard = self.mutex.lock().await;
        let group = self.group_manager.get_group(stream_name)?;
        Some(group.get_stat().await)
    }

    // ----- ctrl api -------------------------------------------------------

    pub async fn ctrl_start_relay_pull(
        &self,
        req: CtrlStartRelayPullReq,
    ) -> ApiResp<CtrlStartRelayPullData> {
        let _guard = self.mutex.lock().await;
        let stream_name = match req.stream_name.clone().filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => match last_item_of_path(&req.url) {
                Some(name) => name,
                None => {
                    return ApiResp::fail(
                        ERROR_CODE_START_RELAY_PULL_FAIL,
                        &format!("cannot derive stream name from url: {}", req.url),
                    );
                }
            },
        };
        // relay pull is allowed to create the group
        let group = self.get_or_create_group("", &stream_name);
        match group.start_pull(&req.url).await {
            Ok(session_id) => ApiResp::succ(CtrlStartRelayPullData {
                stream_name,
                session_id,
            }),
            Err(err) => {
                self.clean_group_if_dead(&stream_name).await;
                ApiResp::fail(ERROR_CODE_START_RELAY_PULL_FAIL, &err.to_string())
            }
        }
    }

    pub async fn ctrl_stop_relay_pull(&self, stream_name: &str) -> ApiResp<CtrlStopRelayPullData> {
        let _guard = self.mutex.lock().await;
        let Some(group) = self.group_manager.get_group(stream_name) else {
            return ApiResp::fail(ERROR_CODE_GROUP_NOT_FOUND, DESP_GROUP_NOT_FOUND);
        };
        match group.stop_pull().await {
            Some(session_id) => ApiResp::succ(CtrlStopRelayPullData { session_id }),
            None => ApiResp::fail(ERROR_CODE_SESSION_NOT_FOUND, DESP_SESSION_NOT_FOUND),
        }
    }

    /// Registers the push on the matching groups (all of them when
    /// `stream_name` is none). Never fails synchronously; connect errors
    /// surface through the supervising tasks.
    pub async fn ctrl_start_relay_push(&self, key: &str, addr: &str, stream_name: Option<&str>) {
        let _guard = self.mutex.lock().await;
        for group in self.snapshot_groups() {
            if stream_name.is_none_or(|name| group.stream_name == name) {
                group.add_rtmp_push(key, addr).await;
                group.start_push_if_needed().await;
            }
        }
    }

    /// Same as `ctrl_start_relay_push` with a caller-supplied stream filter.
    pub async fn ctrl_start_relay_push_all(
        &self,
        key: &str,
        addr: &str,
        check: Option<&(dyn Fn(&str) -> bool + Sync)>,
    ) {
        let _guard = self.mutex.lock().await;
        for group in self.snapshot_groups() {
            if check.is_none_or(|check| check(&group.stream_name)) {
                group.add_rtmp_push(key, addr).await;
                group.start_push_if_needed().await;
            }
        }
    }

    pub async fn ctrl_stop_relay_push_by_addr(&self, key: &str) {
        let _guard = self.mutex.lock().await;
        for group in self.snapshot_groups() {
            group.stop_rtmp_push(key).await;
        }
    }

    pub async fn ctrl_kick_session(&self, req: CtrlKickSessionReq) -> ApiResp<()> {
        let _guard = self.mutex.lock().await;
        let Some(group) = self.group_manager.get_group(&req.stream_name) else {
            return ApiResp::fail(ERROR_CODE_GROUP_NOT_FOUND, DESP_GROUP_NOT_FOUND);
        };
        if group.kick_session(&req.session_id).await {
            ApiResp::succ_empty()
        } else {
            ApiResp::fail(ERROR_CODE_SESSION_NOT_FOUND, DESP_SESSION_NOT_FOUND)
        }
    }

    pub async fn ctrl_start_rtp_pub(
        &self,
        req: CtrlStartRtpPubReq,
    ) -> ApiResp<CtrlStartRtpPubData> {
        let _guard = self.mutex.lock().await;
        let app_name = req.app_name.clone().unwrap_or_default();
        let group = self.get_or_create_group(&app_name, &req.stream_name);
        let session_id = utils::unique_key::gen_unique_key("RTPPUB");
        match group.attach_publisher(PublisherKind::Rtp, &session_id).await {
            Ok(()) => ApiResp::succ(CtrlStartRtpPubData {
                stream_name: req.stream_name,
                session_id,
            }),
            Err(err) => {
                self.clean_group_if_dead(&req.stream_name).await;
                ApiResp::fail(ERROR_CODE_START_RTP_PUB_FAIL, &err.to_string())
            }
        }
    }
}

#[async_trait]
impl HttpServerHandlerObserver for ServerManager {
    async fn on_new_httpflv_sub_session(&self, session: &Arc<SubSession>) -> StreamHubResult<()> {
        let _guard = self.mutex.lock().await;
        let group = self.get_or_create_group(session.app_name(), session.stream_name());
        group.add_sub_session(Arc::clone(session)).await;
        Ok(())
    }

    async fn on_del_httpflv_sub_session(&self, session: &Arc<SubSession>) {
        let _guard = self.mutex.lock().await;
        if let Some(group) = self.group_manager.get_group(session.stream_name()) {
            group.del_sub_session(session).await;
        }
        self.clean_group_if_dead(session.stream_name()).await;
    }

    async fn on_new_httpts_sub_session(&self, session: &Arc<SubSession>) -> StreamHubResult<()> {
        self.on_new_httpflv_sub_session(session).await
    }

    async fn on_del_httpts_sub_session(&self, session: &Arc<SubSession>) {
        self.on_del_httpflv_sub_session(session).await
    }
}

/// Last path segment of a relay url, used to derive the stream name when the
/// caller left it out.
fn last_item_of_path(raw_url: &str) -> Option<String> {
    let parsed = Url::parse(raw_url).ok()?;
    let last = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()?;
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rtmp_relay::{
        PublishTransport,
        errors::{RelaySessionError, RelaySessionResult},
    };
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
    };
    use tokio_util::bytes::Bytes;

    use crate::api::ERROR_CODE_SESSION_NOT_FOUND;
    use crate::relay_factory::TcpTransportFactory;

    use super::*;

    struct FailingTransport;

    #[async_trait]
    impl PublishTransport for FailingTransport {
        async fn do_connect(&mut self, _url: &str) -> RelaySessionResult<()> {
            Err(RelaySessionError::InvalidUrl("connection refused".into()))
        }

        async fn write(&mut self, _chunk: Bytes) -> RelaySessionResult<()> {
            Ok(())
        }

        async fn flush(&mut self) -> RelaySessionResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> RelaySessionResult<()> {
            Ok(())
        }
    }

    struct FailingFactory;

    impl TransportFactory for FailingFactory {
        fn create_push_transport(&self) -> Box<dyn PublishTransport> {
            Box::new(FailingTransport)
        }

        fn create_pull_transport(&self, _stream_name: &str) -> Box<dyn PublishTransport> {
            Box::new(FailingTransport)
        }
    }

    fn test_manager(factory: Arc<dyn TransportFactory>) -> Arc<ServerManager> {
        ServerManager::new(
            StreamHubConfig {
                server_id: "1".to_string(),
                relay_push: Default::default(),
            },
            factory,
            None,
        )
    }

    async fn test_subscriber() -> (Arc<SubSession>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            TcpStream::connect(addr)
        );
        let mut client = client.unwrap();
        client
            .write_all(b"GET /live/test.flv HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut session = SubSession::new(server);
        session.read_request().await.unwrap();
        (Arc::new(session), client)
    }

    #[test]
    fn test_stream_name_from_url() {
        assert_eq!(
            last_item_of_path("rtmp://example.com/live/cam1").as_deref(),
            Some("cam1")
        );
        assert_eq!(
            last_item_of_path("rtmp://example.com/live/cam1/").as_deref(),
            Some("cam1")
        );
        assert_eq!(last_item_of_path("rtmp://example.com"), None);
        assert_eq!(last_item_of_path("not a url"), None);
    }

    #[tokio::test]
    async fn test_publisher_lifecycle_and_stats() {
        let manager = test_manager(Arc::new(TcpTransportFactory));
        assert!(manager.stat_group("s").await.is_none());

        manager
            .on_publisher_start("live", "s", PublisherKind::Rtmp, "RTMPPUB1")
            .await
            .unwrap();
        let stat = manager.stat_group("s").await.unwrap();
        assert_eq!(stat.publisher.as_ref().unwrap().session_id, "RTMPPUB1");
        assert_eq!(manager.stat_all_group().await.len(), 1);

        assert!(
            manager
                .on_publisher_start("live", "s", PublisherKind::Rtsp, "RTSPPUB1")
                .await
                .is_err()
        );

        manager.on_publisher_stop("s", "RTMPPUB1").await;
        assert!(manager.stat_group("s").await.is_none());
    }

    #[tokio::test]
    async fn test_ctrl_kick_session() {
        let manager = test_manager(Arc::new(TcpTransportFactory));
        let (session, _client) = test_subscriber().await;
        manager.on_new_httpflv_sub_session(&session).await.unwrap();

        let resp = manager
            .ctrl_kick_session(CtrlKickSessionReq {
                stream_name: "test".to_string(),
                session_id: session.unique_key().to_string(),
            })
            .await;
        assert!(resp.is_succ());
        assert!(session.has_closed());

        let resp = manager
            .ctrl_kick_session(CtrlKickSessionReq {
                stream_name: "test".to_string(),
                session_id: "FLVSUB424242".to_string(),
            })
            .await;
        assert_eq!(resp.error_code, ERROR_CODE_SESSION_NOT_FOUND);

        let resp = manager
            .ctrl_kick_session(CtrlKickSessionReq {
                stream_name: "absent".to_string(),
                session_id: "x".to_string(),
            })
            .await;
        assert_eq!(resp.error_code, ERROR_CODE_GROUP_NOT_FOUND);

        // once the handler reports the session gone, the empty group goes too
        manager.on_del_httpflv_sub_session(&session).await;
        assert!(manager.stat_group("test").await.is_none());
    }

    #[tokio::test]
    async fn test_ctrl_start_relay_pull_failure_cleans_group() {
        let manager = test_manager(Arc::new(FailingFactory));
        let resp = manager
            .ctrl_start_relay_pull(CtrlStartRelayPullReq {
                url: "rtmp://127.0.0.1/live/cam1".to_string(),
                stream_name: None,
            })
            .await;
        assert_eq!(resp.error_code, ERROR_CODE_START_RELAY_PULL_FAIL);
        assert!(manager.stat_group("cam1").await.is_none());

        let resp = manager.ctrl_stop_relay_pull("cam1").await;
        assert_eq!(resp.error_code, ERROR_CODE_GROUP_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ctrl_relay_push_registration() {
        let manager = test_manager(Arc::new(TcpTransportFactory));
        manager
            .on_publisher_start("live", "s", PublisherKind::Rtmp, "RTMPPUB1")
            .await
            .unwrap();

        manager
            .ctrl_start_relay_push("k", "rtmp://upstream/live/s", Some("s"))
            .await;
        let stat = manager.stat_group("s").await.unwrap();
        assert_eq!(stat.pushes.len(), 1);
        // relay push is disabled in this manager's config, so the proxy is
        // registered but no session was started
        assert!(!stat.pushes[0].is_pushing);

        manager
            .ctrl_start_relay_push("other", "rtmp://upstream/live/x", Some("absent"))
            .await;
        assert_eq!(manager.stat_group("s").await.unwrap().pushes.len(), 1);

        manager.ctrl_stop_relay_push_by_addr("k").await;
        assert!(manager.stat_group("s").await.unwrap().pushes.is_empty());
    }

    #[tokio::test]
    async fn test_ctrl_start_rtp_pub_respects_publisher_invariant() {
        let manager = test_manager(Arc::new(TcpTransportFactory));
        let resp = manager
            .ctrl_start_rtp_pub(CtrlStartRtpPubReq {
                stream_name: "s".to_string(),
                app_name: None,
            })
            .await;
        assert!(resp.is_succ());
        let session_id = resp.data.unwrap().session_id;

        let resp = manager
            .ctrl_start_rtp_pub(CtrlStartRtpPubReq {
                stream_name: "s".to_string(),
                app_name: None,
            })
            .await;
        assert_eq!(resp.error_code, ERROR_CODE_START_RTP_PUB_FAIL);

        manager.on_publisher_stop("s", &session_id).await;
        assert!(manager.stat_group("s").await.is_none());
    }

    #[tokio::test]
    async fn test_stat_server_info() {
        let manager = test_manager(Arc::new(TcpTransportFactory));
        let info = manager.stat_server_info();
        assert_eq!(info.server_id, "1");
        assert_eq!(info.api_version, API_VERSION);
        assert!(info.start_time_unix > 0);
    }
}
