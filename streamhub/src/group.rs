use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use httpflv_server::{MediaTag, SubSession, SubSessionKind};
use rtmp_relay::{
    PublishTransport, PullSession, PullSessionOption, PushSession, PushSessionOption,
};
use serde::{Deserialize, Serialize};

use crate::{
    RELAY_PULL_TIMEOUT_MS, RELAY_PUSH_TIMEOUT_MS, RELAY_PUSH_WRITE_AV_TIMEOUT_MS,
    RELAY_PUSH_WRITE_CHAN_SIZE,
    api::{StatGroup, StatPub, StatPull, StatPush, StatSub},
    errors::{StreamHubError, StreamHubResult},
    relay_factory::TransportFactory,
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayPushConfig {
    pub enable: bool,
    #[serde(default)]
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    pub relay_push: RelayPushConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    Rtmp,
    Rtsp,
    Rtp,
    RelayPull,
}

#[derive(Debug)]
struct Publisher {
    kind: PublisherKind,
    session_id: String,
    start_time: SystemTime,
}

/// Carried through the `before_relay_push` hook so callers can rewrite the
/// destination per stream.
#[derive(Debug, Clone)]
pub struct RelayPushInfo {
    pub key: String,
    pub push_url: String,
    pub app_name: String,
    pub stream_name: String,
}

pub type BeforeRelayPushHook = Arc<dyn Fn(&mut RelayPushInfo) + Send + Sync>;

type BoxPushSession = PushSession<Box<dyn PublishTransport>>;
type BoxPullSession = PullSession<Box<dyn PublishTransport>>;

struct PushProxy {
    push_url: String,
    is_pushing: bool,
    push_session: Option<Arc<BoxPushSession>>,
}

struct PullProxy {
    pull_url: String,
    pull_session: Arc<BoxPullSession>,
}

struct GroupInner {
    publisher: Option<Publisher>,
    subscribers: HashMap<String, Arc<SubSession>>,
    url2push_proxy: HashMap<String, PushProxy>,
    pull_proxy: Option<PullProxy>,
}

/// Fan-out node for one `(app, stream)`: couples at most one publisher to
/// all subscribers and relay sessions of the stream. Every mutating
/// operation runs under the group mutex.
pub struct Group {
    pub app_name: String,
    pub stream_name: String,
    pub unique_key: String,
    config: GroupConfig,
    before_relay_push: Option<BeforeRelayPushHook>,
    transport_factory: Arc<dyn TransportFactory>,
    self_weak: Weak<Group>,
    inner: tokio::sync::Mutex<GroupInner>,
}

impl Group {
    pub fn new(
        app_name: &str,
        stream_name: &str,
        config: GroupConfig,
        before_relay_push: Option<BeforeRelayPushHook>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let unique_key = utils::unique_key::gen_unique_key("GROUP");
        tracing::info!(
            "[{}] lifecycle new group, app: {}, stream_name: {}",
            unique_key,
            app_name,
            stream_name
        );

        let mut url2push_proxy = HashMap::new();
        if config.relay_push.enable {
            for addr in &config.relay_push.addr_list {
                url2push_proxy.insert(
                    addr.clone(),
                    PushProxy {
                        push_url: addr.clone(),
                        is_pushing: false,
                        push_session: None,
                    },
                );
            }
        }

        Arc::new_cyclic(|self_weak| Self {
            app_name: app_name.to_string(),
            stream_name: stream_name.to_string(),
            unique_key,
            config,
            before_relay_push,
            transport_factory,
            self_weak: self_weak.clone(),
            inner: tokio::sync::Mutex::new(GroupInner {
                publisher: None,
                subscribers: HashMap::new(),
                url2push_proxy,
                pull_proxy: None,
            }),
        })
    }

    // ----- publisher ------------------------------------------------------

    /// At most one publisher per group; a second one is rejected, never
    /// evicts the existing session.
    pub async fn attach_publisher(
        &self,
        kind: PublisherKind,
        session_id: &str,
    ) -> StreamHubResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = &inner.publisher {
            return Err(StreamHubError::DuplicatePublisher {
                stream_name: self.stream_name.clone(),
                session_id: existing.session_id.clone(),
            });
        }
        tracing::info!(
            "[{}] attach publisher [{}], kind: {:?}",
            self.unique_key,
            session_id,
            kind
        );
        inner.publisher = Some(Publisher {
            kind,
            session_id: session_id.to_string(),
            start_time: SystemTime::now(),
        });
        self.start_push_locked(&mut inner).await;
        Ok(())
    }

    /// Publisher gone means the stream is over: subscribers, relay pushes
    /// and the relay pull are all torn down.
    pub async fn detach_publisher(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        match &inner.publisher {
            Some(publisher) if publisher.session_id == session_id => {}
            _ => return,
        }
        tracing::info!(
            "[{}] publisher [{}] gone, tearing group down",
            self.unique_key,
            session_id
        );
        inner.publisher = None;
        for (_, session) in inner.subscribers.drain() {
            session.dispose("publisher gone");
        }
        self.stop_push_locked(&mut inner);
        if let Some(pull) = inner.pull_proxy.take() {
            pull.pull_session.dispose();
        }
    }

    // ----- media ----------------------------------------------------------

    /// Delivers one framed tag to every subscriber queue and every active
    /// push session. Non-blocking per target; a slow target is its own
    /// problem.
    pub async fn on_media_tag(&self, tag: MediaTag) {
        let inner = self.inner.lock().await;
        for session in inner.subscribers.values() {
            if !session.has_key_frame() {
                if tag.is_video_keyframe() {
                    session.set_has_key_frame();
                } else if session.wait_video_key_frame() {
                    continue;
                }
            }
            session.write_tag(&tag);
        }
        for (key, proxy) in inner.url2push_proxy.iter() {
            if let Some(push_session) = &proxy.push_session {
                if let Err(err) = push_session.write(tag.raw.clone()).await {
                    tracing::error!(
                        "[{}] write to relay push failed, key: {}, err: {}",
                        self.unique_key,
                        key,
                        err
                    );
                }
            }
        }
    }

    // ----- subscribers ----------------------------------------------------

    pub async fn add_sub_session(&self, session: Arc<SubSession>) {
        let mut inner = self.inner.lock().await;
        tracing::info!(
            "[{}] add subscriber [{}]",
            self.unique_key,
            session.unique_key()
        );
        inner
            .subscribers
            .insert(session.unique_key().to_string(), session);
    }

    pub async fn del_sub_session(&self, session: &SubSession) {
        let mut inner = self.inner.lock().await;
        if inner.subscribers.remove(session.unique_key()).is_some() {
            tracing::info!(
                "[{}] del subscriber [{}]",
                self.unique_key,
                session.unique_key()
            );
        }
    }

    /// Kills the session carrying `session_id`, whichever role it has.
    pub async fn kick_session(&self, session_id: &str) -> bool {
        let publisher_id = {
            let mut inner = self.inner.lock().await;
            if let Some(session) = inner.subscribers.remove(session_id) {
                session.dispose("kicked by api");
                return true;
            }
            if let Some(pull) = &inner.pull_proxy {
                if pull.pull_session.unique_key() == session_id {
                    // the pull supervisor runs the map cleanup
                    pull.pull_session.dispose();
                    return true;
                }
            }
            match &inner.publisher {
                Some(publisher) if publisher.session_id == session_id => {
                    publisher.session_id.clone()
                }
                _ => return false,
            }
        };
        self.detach_publisher(&publisher_id).await;
        true
    }

    // ----- relay push -----------------------------------------------------

    /// Registers a push destination under `key`; an existing entry is left
    /// untouched.
    pub async fn add_rtmp_push(&self, key: &str, url: &str) {
        let mut inner = self.inner.lock().await;
        if inner.url2push_proxy.contains_key(key) {
            tracing::debug!("[{}] relay push already exists, key: {}", self.unique_key, key);
            return;
        }
        tracing::debug!(
            "[{}] add relay push, key: {}, url: {}",
            self.unique_key,
            key,
            url
        );
        inner.url2push_proxy.insert(
            key.to_string(),
            PushProxy {
                push_url: url.to_string(),
                is_pushing: false,
                push_session: None,
            },
        );
    }

    /// Removes the entry without touching the session; the supervising task
    /// owns that lifecycle.
    pub async fn del_rtmp_push(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if inner.url2push_proxy.remove(key).is_some() {
            tracing::debug!("[{}] del relay push, key: {}", self.unique_key, key);
        }
    }

    pub async fn stop_rtmp_push(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(proxy) = inner.url2push_proxy.remove(key) {
            if let Some(session) = proxy.push_session {
                session.dispose();
            }
            tracing::debug!("[{}] stop relay push, key: {}", self.unique_key, key);
        }
    }

    pub async fn start_push_if_needed(&self) {
        let mut inner = self.inner.lock().await;
        self.start_push_locked(&mut inner).await;
    }

    pub async fn stop_push_if_needed(&self) {
        if !self.config.relay_push.enable {
            return;
        }
        let mut inner = self.inner.lock().await;
        self.stop_push_locked(&mut inner);
    }

    async fn start_push_locked(&self, inner: &mut GroupInner) {
        if !self.config.relay_push.enable {
            return;
        }
        if inner.publisher.is_none() {
            return;
        }
        let pending: Vec<String> = inner
            .url2push_proxy
            .iter()
            .filter(|(_, proxy)| !proxy.is_pushing)
            .map(|(key, _)| key.clone())
            .collect();
        for key in pending {
            let mut info = RelayPushInfo {
                key: key.clone(),
                push_url: inner
                    .url2push_proxy
                    .get(&key)
                    .map(|proxy| proxy.push_url.clone())
                    .unwrap_or_default(),
                app_name: self.app_name.clone(),
                stream_name: self.stream_name.clone(),
            };
            if let Some(hook) = &self.before_relay_push {
                hook(&mut info);
            }
            if let Some(proxy) = inner.url2push_proxy.get_mut(&key) {
                proxy.is_pushing = true;
            }
            tracing::info!(
                "[{}] start relay push, key: {}, url: {}",
                self.unique_key,
                key,
                info.push_url
            );

            let push_session: Arc<BoxPushSession> = Arc::new(PushSession::new(
                self.transport_factory.create_push_transport(),
                PushSessionOption {
                    push_timeout_ms: RELAY_PUSH_TIMEOUT_MS,
                    write_av_timeout_ms: RELAY_PUSH_WRITE_AV_TIMEOUT_MS,
                    write_chan_size: RELAY_PUSH_WRITE_CHAN_SIZE,
                    ..Default::default()
                },
            ));
            if let Err(err) = push_session.push(&info.push_url).await {
                tracing::error!(
                    "[{}] relay push connect failed, key: {}, err: {}",
                    push_session.unique_key(),
                    key,
                    err
                );
                inner.url2push_proxy.remove(&key);
                continue;
            }
            if let Some(proxy) = inner.url2push_proxy.get_mut(&key) {
                proxy.push_session = Some(Arc::clone(&push_session));
            }

            let Some(wait) = push_session.wait_chan() else {
                continue;
            };
            let weak = self.self_weak.clone();
            let push_key = key.clone();
            let push_unique_key = push_session.unique_key().to_string();
            tokio::spawn(async move {
                let result = wait.await;
                tracing::info!("[{}] relay push done, result: {:?}", push_unique_key, result);
                if let Some(group) = weak.upgrade() {
                    group.del_rtmp_push(&push_key).await;
                }
            });
        }
    }

    fn stop_push_locked(&self, inner: &mut GroupInner) {
        for (key, proxy) in inner.url2push_proxy.iter_mut() {
            if let Some(session) = proxy.push_session.take() {
                tracing::info!("[{}] stop relay push, key: {}", self.unique_key, key);
                session.dispose();
            }
            proxy.is_pushing = false;
        }
    }

    // ----- relay pull -----------------------------------------------------

    /// Starts the relay pull and attaches it as the group's publisher. When
    /// one is already running its session id is simply reported back.
    pub async fn start_pull(&self, url: &str) -> StreamHubResult<String> {
        let mut inner = self.inner.lock().await;
        if let Some(pull) = &inner.pull_proxy {
            return Ok(pull.pull_session.unique_key().to_string());
        }
        if let Some(existing) = &inner.publisher {
            return Err(StreamHubError::DuplicatePublisher {
                stream_name: self.stream_name.clone(),
                session_id: existing.session_id.clone(),
            });
        }

        let pull_session: Arc<BoxPullSession> = Arc::new(PullSession::new(
            self.transport_factory.create_pull_transport(&self.stream_name),
            PullSessionOption {
                pull_timeout_ms: RELAY_PULL_TIMEOUT_MS,
            },
        ));
        pull_session.pull(url).await?;

        let session_id = pull_session.unique_key().to_string();
        inner.publisher = Some(Publisher {
            kind: PublisherKind::RelayPull,
            session_id: session_id.clone(),
            start_time: SystemTime::now(),
        });
        inner.pull_proxy = Some(PullProxy {
            pull_url: url.to_string(),
            pull_session: Arc::clone(&pull_session),
        });
        self.start_push_locked(&mut inner).await;

        if let Some(wait) = pull_session.wait_chan() {
            let weak = self.self_weak.clone();
            let pull_unique_key = session_id.clone();
            tokio::spawn(async move {
                let result = wait.await;
                tracing::info!("[{}] relay pull done, result: {:?}", pull_unique_key, result);
                if let Some(group) = weak.upgrade() {
                    group.on_pull_done(&pull_unique_key).await;
                }
            });
        }
        tracing::info!(
            "[{}] start relay pull, url: {}, session: {}",
            self.unique_key,
            url,
            session_id
        );
        Ok(session_id)
    }

    /// Disposes the running pull session if any; cleanup happens in its
    /// supervisor.
    pub async fn stop_pull(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        let pull = inner.pull_proxy.as_ref()?;
        let session_id = pull.pull_session.unique_key().to_string();
        pull.pull_session.dispose();
        Some(session_id)
    }

    async fn on_pull_done(&self, session_id: &str) {
        {
            let mut inner = self.inner.lock().await;
            match &inner.pull_proxy {
                Some(pull) if pull.pull_session.unique_key() == session_id => {
                    inner.pull_proxy = None;
                }
                _ => return,
            }
        }
        self.detach_publisher(session_id).await;
    }

    // ----- stats / lifecycle ---------------------------------------------

    pub async fn get_stat(&self) -> StatGroup {
        let inner = self.inner.lock().await;
        StatGroup {
            stream_name: self.stream_name.clone(),
            app_name: self.app_name.clone(),
            publisher: inner.publisher.as_ref().map(|publisher| StatPub {
                kind: publisher.kind,
                session_id: publisher.session_id.clone(),
                start_time_unix: unix_seconds(publisher.start_time),
            }),
            subscribers: inner
                .subscribers
                .values()
                .map(|session| {
                    let (stat, diff) = session.get_stat();
                    StatSub {
                        session_id: session.unique_key().to_string(),
                        kind: match session.kind() {
                            SubSessionKind::HttpFlv => "httpflv".to_string(),
                            SubSessionKind::HttpTs => "httpts".to_string(),
                        },
                        start_tick: session.start_tick(),
                        stat,
                        diff,
                    }
                })
                .collect(),
            pushes: inner
                .url2push_proxy
                .iter()
                .map(|(key, proxy)| StatPush {
                    key: key.clone(),
                    push_url: proxy.push_url.clone(),
                    is_pushing: proxy.is_pushing,
                    session_id: proxy
                        .push_session
                        .as_ref()
                        .map(|session| session.unique_key().to_string()),
                })
                .collect(),
            pull: inner.pull_proxy.as_ref().map(|pull| StatPull {
                pull_url: pull.pull_url.clone(),
                session_id: pull.pull_session.unique_key().to_string(),
            }),
        }
    }

    /// A group with no publisher, no subscribers and no relay activity is
    /// ready to be unregistered.
    pub async fn is_dead(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.publisher.is_none()
            && inner.subscribers.is_empty()
            && inner.pull_proxy.is_none()
            && inner
                .url2push_proxy
                .values()
                .all(|proxy| proxy.push_session.is_none())
    }
}

fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
