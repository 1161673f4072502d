use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use httpflv_server::{MediaTag, SubSession, TagKind};
use rtmp_relay::{
    PublishTransport,
    errors::{RelaySessionError, RelaySessionResult},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::Duration,
};
use tokio_util::bytes::Bytes;

use crate::{
    group::{Group, GroupConfig, PublisherKind, RelayPushConfig},
    relay_factory::TransportFactory,
};

#[derive(Default)]
struct RecordingState {
    writes: Mutex<Vec<Bytes>>,
    close_count: AtomicUsize,
}

struct RecordingTransport {
    state: Arc<RecordingState>,
    fail_connect: bool,
}

#[async_trait]
impl PublishTransport for RecordingTransport {
    async fn do_connect(&mut self, _url: &str) -> RelaySessionResult<()> {
        if self.fail_connect {
            Err(RelaySessionError::InvalidUrl("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn write(&mut self, chunk: Bytes) -> RelaySessionResult<()> {
        self.state
            .writes
            .lock()
            .expect("writes lock poisoned")
            .push(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> RelaySessionResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> RelaySessionResult<()> {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockFactory {
    state: Arc<RecordingState>,
    fail_connect: AtomicBool,
}

impl TransportFactory for MockFactory {
    fn create_push_transport(&self) -> Box<dyn PublishTransport> {
        Box::new(RecordingTransport {
            state: Arc::clone(&self.state),
            fail_connect: self.fail_connect.load(Ordering::SeqCst),
        })
    }

    fn create_pull_transport(&self, _stream_name: &str) -> Box<dyn PublishTransport> {
        self.create_push_transport()
    }
}

fn test_group(
    push_enable: bool,
    addr_list: Vec<String>,
    factory: Arc<dyn TransportFactory>,
) -> Arc<Group> {
    Group::new(
        "live",
        "test",
        GroupConfig {
            relay_push: RelayPushConfig {
                enable: push_enable,
                addr_list,
            },
        },
        None,
        factory,
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
    let session = Arc::new(session);
    let runner = Arc::clone(&session);
    tokio::spawn(async move {
        let _ = runner.run_loop().await;
    });
    (session, client)
}

fn audio_tag(raw: &'static [u8]) -> MediaTag {
    MediaTag {
        kind: TagKind::Audio,
        is_keyframe: false,
        raw: Bytes::from_static(raw),
    }
}

fn video_key_tag(raw: &'static [u8]) -> MediaTag {
    MediaTag {
        kind: TagKind::Video,
        is_keyframe: true,
        raw: Bytes::from_static(raw),
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_subscriber_waits_for_key_frame() {
    let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::default());
    let group = test_group(false, vec![], factory);
    group
        .attach_publisher(PublisherKind::Rtmp, "RTMPPUB1")
        .await
        .unwrap();
    let (session, mut client) = test_subscriber().await;
    group.add_sub_session(Arc::clone(&session)).await;

    group.on_media_tag(audio_tag(b"1")).await;
    group.on_media_tag(audio_tag(b"2")).await;
    group.on_media_tag(audio_tag(b"3")).await;
    group.on_media_tag(video_key_tag(b"K")).await;
    group.on_media_tag(audio_tag(b"b")).await;
    group.on_media_tag(audio_tag(b"c")).await;

    // nothing before the key frame reaches the wire
    let mut got = [0u8; 3];
    client.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"Kbc");
}

#[tokio::test]
async fn test_mid_gop_join_skips_the_gate() {
    let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::default());
    let group = test_group(false, vec![], factory);
    group
        .attach_publisher(PublisherKind::Rtmp, "RTMPPUB1")
        .await
        .unwrap();
    let (session, mut client) = test_subscriber().await;
    session.set_wait_video_key_frame(false);
    group.add_sub_session(Arc::clone(&session)).await;

    group.on_media_tag(audio_tag(b"a")).await;
    let mut got = [0u8; 1];
    client.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"a");
}

#[tokio::test]
async fn test_second_publisher_is_rejected() {
    let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::default());
    let group = test_group(false, vec![], factory);
    group
        .attach_publisher(PublisherKind::Rtmp, "RTMPPUB1")
        .await
        .unwrap();
    assert!(
        group
            .attach_publisher(PublisherKind::Rtsp, "RTSPPUB1")
            .await
            .is_err()
    );

    group.detach_publisher("RTMPPUB1").await;
    group
        .attach_publisher(PublisherKind::Rtsp, "RTSPPUB1")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_publisher_gone_tears_down_subscribers() {
    let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::default());
    let group = test_group(false, vec![], factory);
    group
        .attach_publisher(PublisherKind::Rtmp, "RTMPPUB1")
        .await
        .unwrap();
    let (session, _client) = test_subscriber().await;
    group.add_sub_session(Arc::clone(&session)).await;

    group.detach_publisher("RTMPPUB1").await;
    assert!(session.has_closed());
    assert!(group.get_stat().await.subscribers.is_empty());
    assert!(group.is_dead().await);
}

#[tokio::test]
async fn test_kick_subscriber() {
    let factory: Arc<dyn TransportFactory> = Arc::new(MockFactory::default());
    let group = test_group(false, vec![], factory);
    let (session, _client) = test_subscriber().await;
    group.add_sub_session(Arc::clone(&session)).await;

    let session_id = session.unique_key().to_string();
    assert!(group.kick_session(&session_id).await);
    assert!(session.has_closed());
    assert!(group.get_stat().await.subscribers.is_empty());
    assert!(!group.kick_session(&session_id).await);
}

#[tokio::test]
async fn test_relay_push_connect_failure_deletes_proxy() {
    let factory = Arc::new(MockFactory::default());
    factory.fail_connect.store(true, Ordering::SeqCst);
    let group = test_group(
        true,
        vec!["rtmp://upstream/live/test".to_string()],
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
    );
    group
        .attach_publisher(PublisherKind::Rtmp, "RTMPPUB1")
        .await
        .unwrap();
    assert!(group.get_stat().await.pushes.is_empty());

    // the control plane may register the destination again afterwards
    factory.fail_connect.store(false, Ordering::SeqCst);
    group
        .add_rtmp_push("rtmp://upstream/live/test", "rtmp://upstream/live/test")
        .await;
    group.start_push_if_needed().await;

    let stat = group.get_stat().await;
    assert_eq!(stat.pushes.len(), 1);
    assert!(stat.pushes[0].is_pushing);
    assert!(stat.pushes[0].session_id.is_some());
}

#[tokio::test]
async fn test_media_reaches_active_push() {
    let factory = Arc::new(MockFactory::default());
    let state = Arc::clone(&factory.state);
    let group = test_group(
        true,
        vec!["rtmp://upstream/live/test".to_string()],
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
    );
    group
        .attach_publisher(PublisherKind::Rtmp, "RTMPPUB1")
        .await
        .unwrap();

    group.on_media_tag(video_key_tag(b"KEY")).await;
    wait_for(|| {
        state
            .writes
            .lock()
            .unwrap()
            .iter()
            .any(|chunk| chunk.as_ref() == b"KEY")
    })
    .await;

    group.stop_rtmp_push("rtmp://upstream/live/test").await;
    wait_for(|| state.close_count.load(Ordering::SeqCst) == 1).await;
    // the supervisor's delete is idempotent with the explicit stop
    assert!(group.get_stat().await.pushes.is_empty());
}
