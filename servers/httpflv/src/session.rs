use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::{bytes::Bytes, sync::CancellationToken};

use crate::{
    errors::{HttpFlvSessionError, HttpFlvSessionResult},
    http::parse_http_header,
    tag::MediaTag,
};

pub static FLV_HTTP_RESPONSE_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\nCache-Control: no-cache\r\nContent-Type: video/x-flv\r\nConnection: close\r\nExpires: -1\r\nPragma: no-cache\r\n\r\n";
pub static TS_HTTP_RESPONSE_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\nCache-Control: no-cache\r\nContent-Type: video/mp2t\r\nConnection: close\r\nExpires: -1\r\nPragma: no-cache\r\n\r\n";
pub static FLV_HEADER: [u8; 13] = [
    0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

const WRITE_CHAN_SIZE: usize = 1024;
const READ_BUF_SIZE: usize = 4096;
const READ_PROBE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubSessionKind {
    HttpFlv,
    HttpTs,
}

impl SubSessionKind {
    fn unique_key_prefix(&self) -> &'static str {
        match self {
            SubSessionKind::HttpFlv => "FLVSUB",
            SubSessionKind::HttpTs => "TSSUB",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct SubSessionStat {
    pub wanna_write_count: u64,
    pub wanna_write_byte: u64,
    pub write_count: u64,
    pub write_byte: u64,
}

#[derive(Debug, Default)]
struct StatInner {
    stat: SubSessionStat,
    prev: SubSessionStat,
}

struct SessionIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One HTTP-FLV (or HTTP-TS) subscriber on its own TCP connection.
///
/// The session runs two tasks: a read probe that tears the session down on
/// any inbound activity, and the write loop draining the bounded queue to the
/// socket. `dispose` is idempotent; once it ran, no further bytes reach the
/// network and queued buffers may be dropped.
pub struct SubSession {
    kind: SubSessionKind,
    unique_key: String,
    remote_addr: String,
    start_tick: u64,
    uri: String,
    app_name: String,
    stream_name: String,
    headers: HashMap<String, String>,
    is_web_socket: bool,
    web_socket_key: Option<String>,

    io: Mutex<Option<SessionIo>>,
    wchan_tx: mpsc::Sender<Bytes>,
    wchan_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,

    has_closed_flag: AtomicBool,
    exit: CancellationToken,

    has_key_frame: AtomicBool,
    wait_video_key_frame: AtomicBool,

    stat: Mutex<StatInner>,
}

impl SubSession {
    pub fn new(conn: TcpStream) -> Self {
        let remote_addr = conn
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("lifecycle new sub session, remote_addr: {}", remote_addr);
        let (read_half, write_half) = conn.into_split();
        let (wchan_tx, wchan_rx) = mpsc::channel(WRITE_CHAN_SIZE);
        Self {
            kind: SubSessionKind::HttpFlv,
            unique_key: String::new(),
            remote_addr,
            start_tick: 0,
            uri: String::new(),
            app_name: String::new(),
            stream_name: String::new(),
            headers: HashMap::new(),
            is_web_socket: false,
            web_socket_key: None,
            io: Mutex::new(Some(SessionIo {
                reader: BufReader::with_capacity(READ_BUF_SIZE, read_half),
                writer: write_half,
            })),
            wchan_tx,
            wchan_rx: Mutex::new(Some(wchan_rx)),
            has_closed_flag: AtomicBool::new(false),
            exit: CancellationToken::new(),
            has_key_frame: AtomicBool::new(false),
            wait_video_key_frame: AtomicBool::new(true),
            stat: Mutex::new(StatInner::default()),
        }
    }

    /// Parses the request line and headers off the hijacked socket. Any
    /// violation of the expected shape disposes the session without writing
    /// a response.
    pub async fn read_request(&mut self) -> HttpFlvSessionResult<()> {
        self.start_tick = utils::system::time::get_unix_seconds().unwrap_or(0);
        let res = self.read_request_inner().await;
        if let Err(err) = &res {
            let reason = format!("read request failed: {}", err);
            self.dispose(&reason);
        }
        res
    }

    async fn read_request_inner(&mut self) -> HttpFlvSessionResult<()> {
        let (first_line, headers) = {
            let io = self.io.get_mut().expect("io lock poisoned");
            let io = io.as_mut().ok_or(HttpFlvSessionError::SessionClosed)?;
            parse_http_header(&mut io.reader).await?
        };
        self.headers = headers;

        let items: Vec<&str> = first_line.split(' ').collect();
        if items.len() != 3 || items[0] != "GET" {
            return Err(HttpFlvSessionError::InvalidHttpRequest(format!(
                "bad request line: {}",
                first_line
            )));
        }
        let uri = items[1].to_string();
        self.parse_uri(&uri)?;

        self.is_web_socket = self
            .headers
            .get("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("Upgrade"))
            && self
                .headers
                .get("Upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if self.is_web_socket {
            self.web_socket_key = self.headers.get("Sec-WebSocket-Key").cloned();
        }

        self.unique_key = utils::unique_key::gen_unique_key(self.kind.unique_key_prefix());
        tracing::info!(
            "[{}] < read http request, uri: {}, remote_addr: {}",
            self.unique_key,
            self.uri,
            self.remote_addr
        );
        Ok(())
    }

    /// Derives kind, app name and stream name from the request path. Also
    /// used to re-derive them after a user hook rewrote the url.
    pub fn parse_uri(&mut self, uri: &str) -> HttpFlvSessionResult<()> {
        let kind = if uri.ends_with(".flv") {
            SubSessionKind::HttpFlv
        } else if uri.ends_with(".ts") {
            SubSessionKind::HttpTs
        } else {
            return Err(HttpFlvSessionError::InvalidHttpRequest(format!(
                "unsupported path suffix: {}",
                uri
            )));
        };
        let items: Vec<&str> = uri.split('/').collect();
        if items.len() != 3 {
            return Err(HttpFlvSessionError::InvalidHttpRequest(format!(
                "bad path shape: {}",
                uri
            )));
        }
        let last_items: Vec<&str> = items[2].split('.').collect();
        if last_items.len() < 2 {
            return Err(HttpFlvSessionError::InvalidHttpRequest(format!(
                "bad last path segment: {}",
                uri
            )));
        }
        self.kind = kind;
        self.app_name = items[1].to_string();
        self.stream_name = last_items[0].to_string();
        self.uri = uri.to_string();
        Ok(())
    }

    /// Runs the read probe and the write loop; returns when the write loop
    /// terminates.
    pub async fn run_loop(self: Arc<Self>) -> HttpFlvSessionResult<()> {
        let io = self
            .io
            .lock()
            .expect("io lock poisoned")
            .take()
            .ok_or(HttpFlvSessionError::SessionClosed)?;
        let rx = self
            .wchan_rx
            .lock()
            .expect("wchan lock poisoned")
            .take()
            .ok_or(HttpFlvSessionError::SessionClosed)?;
        let SessionIo { reader, writer } = io;
        let probe = Arc::clone(&self);
        tokio::spawn(async move { probe.run_read_probe(reader).await });
        self.run_write_loop(writer, rx).await
    }

    /// Subscribers have nothing more to say after the request; a read result
    /// of any kind (data, eof, error) tears the session down.
    async fn run_read_probe(&self, mut reader: BufReader<OwnedReadHalf>) {
        let mut buf = [0u8; READ_PROBE_SIZE];
        tokio::select! {
            _ = self.exit.cancelled() => {}
            res = reader.read(&mut buf) => {
                let reason = match res {
                    Ok(0) => "peer closed the connection".to_string(),
                    Ok(n) => format!("unexpected {} bytes from subscriber", n),
                    Err(err) => format!("read failed: {}", err),
                };
                self.dispose(&reason);
            }
        }
    }

    async fn run_write_loop(
        &self,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Bytes>,
    ) -> HttpFlvSessionResult<()> {
        loop {
            tokio::select! {
                _ = self.exit.cancelled() => {
                    let _ = writer.shutdown().await;
                    return Err(HttpFlvSessionError::SessionClosed);
                }
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else {
                        return Err(HttpFlvSessionError::SessionClosed);
                    };
                    if self.has_closed() {
                        return Err(HttpFlvSessionError::SessionClosed);
                    }
                    if let Err(err) = writer.write_all(&pkt).await {
                        let reason = format!("write failed: {}", err);
                        self.dispose(&reason);
                        return Err(err.into());
                    }
                    self.add_write_stat(pkt.len());
                }
            }
        }
    }

    pub fn write_http_response_header(&self) {
        tracing::info!("[{}] <----- http response header", self.unique_key);
        match self.kind {
            SubSessionKind::HttpFlv => self.write_packet(Bytes::from_static(FLV_HTTP_RESPONSE_HEADER)),
            SubSessionKind::HttpTs => self.write_packet(Bytes::from_static(TS_HTTP_RESPONSE_HEADER)),
        }
    }

    pub fn write_flv_header(&self) {
        if self.kind != SubSessionKind::HttpFlv {
            return;
        }
        tracing::info!("[{}] <----- http flv header", self.unique_key);
        self.write_packet(Bytes::from_static(&FLV_HEADER));
    }

    pub fn write_tag(&self, tag: &MediaTag) {
        self.write_packet(tag.raw.clone());
    }

    /// Non-blocking enqueue. A saturated queue means the subscriber cannot
    /// keep up with the live edge; the session is disposed rather than
    /// stalling or starving the broadcast path.
    pub fn write_packet(&self, pkt: Bytes) {
        if self.has_closed() {
            return;
        }
        self.add_wanna_write_stat(pkt.len());
        if let Err(err) = self.wchan_tx.try_send(pkt) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    self.dispose("write queue overflow, disconnecting slow subscriber");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    /// Idempotent: the first caller logs, raises the closed flag, signals
    /// the exit token and closes the connection; later callers no-op.
    pub fn dispose(&self, reason: &str) {
        if self.has_closed_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(
            "[{}] lifecycle dispose sub session, remote_addr: {}, reason: {}",
            self.unique_key,
            self.remote_addr,
            reason
        );
        self.exit.cancel();
        // loops not started yet means the halves are still parked here
        drop(self.io.lock().expect("io lock poisoned").take());
    }

    #[inline]
    pub fn has_closed(&self) -> bool {
        self.has_closed_flag.load(Ordering::Acquire)
    }

    /// Returns the running counters and the delta since the previous call,
    /// advancing the snapshot.
    pub fn get_stat(&self) -> (SubSessionStat, SubSessionStat) {
        let mut inner = self.stat.lock().expect("stat lock poisoned");
        let now = inner.stat;
        let diff = SubSessionStat {
            wanna_write_count: now.wanna_write_count - inner.prev.wanna_write_count,
            wanna_write_byte: now.wanna_write_byte - inner.prev.wanna_write_byte,
            write_count: now.write_count - inner.prev.write_count,
            write_byte: now.write_byte - inner.prev.write_byte,
        };
        inner.prev = now;
        (now, diff)
    }

    fn add_wanna_write_stat(&self, byte_count: usize) {
        let mut inner = self.stat.lock().expect("stat lock poisoned");
        inner.stat.wanna_write_count += 1;
        inner.stat.wanna_write_byte += byte_count as u64;
    }

    fn add_write_stat(&self, byte_count: usize) {
        let mut inner = self.stat.lock().expect("stat lock poisoned");
        inner.stat.write_count += 1;
        inner.stat.write_byte += byte_count as u64;
    }

    #[inline]
    pub fn has_key_frame(&self) -> bool {
        self.has_key_frame.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_has_key_frame(&self) {
        self.has_key_frame.store(true, Ordering::Release);
    }

    /// False once the subscriber opted into mid-GOP joining.
    #[inline]
    pub fn wait_video_key_frame(&self) -> bool {
        self.wait_video_key_frame.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_wait_video_key_frame(&self, wait: bool) {
        self.wait_video_key_frame.store(wait, Ordering::Release);
    }

    pub fn kind(&self) -> SubSessionKind {
        self.kind
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn is_web_socket(&self) -> bool {
        self.is_web_socket
    }

    pub fn web_socket_key(&self) -> Option<&str> {
        self.web_socket_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use crate::tag::TagKind;

    use super::*;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            TcpStream::connect(addr)
        );
        (server, client.unwrap())
    }

    async fn session_for_request(request: &[u8]) -> (SubSession, TcpStream) {
        let (server, mut client) = tcp_pair().await;
        client.write_all(request).await.unwrap();
        let mut session = SubSession::new(server);
        session.read_request().await.unwrap();
        (session, client)
    }

    #[tokio::test]
    async fn test_happy_path_flv_subscribe() {
        let (session, mut client) =
            session_for_request(b"GET /live/test.flv HTTP/1.1\r\n\r\n").await;
        assert_eq!(session.app_name(), "live");
        assert_eq!(session.stream_name(), "test");
        assert_eq!(session.kind(), SubSessionKind::HttpFlv);
        assert!(session.unique_key().starts_with("FLVSUB"));

        let session = Arc::new(session);
        let runner = Arc::clone(&session);
        let loop_handle = tokio::spawn(async move { runner.run_loop().await });

        session.write_http_response_header();
        session.write_flv_header();
        let tag = MediaTag {
            kind: TagKind::Audio,
            is_keyframe: false,
            raw: Bytes::from_static(b"\x08AUDIOTAG"),
        };
        session.write_tag(&tag);

        let mut expected = Vec::new();
        expected.extend_from_slice(FLV_HTTP_RESPONSE_HEADER);
        expected.extend_from_slice(&FLV_HEADER);
        expected.extend_from_slice(b"\x08AUDIOTAG");
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        session.dispose("test over");
        assert!(loop_handle.await.unwrap().is_err());
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ts_request_selects_ts_kind() {
        let (session, _client) = session_for_request(b"GET /live/test.ts HTTP/1.1\r\n\r\n").await;
        assert_eq!(session.kind(), SubSessionKind::HttpTs);
        assert!(session.unique_key().starts_with("TSSUB"));
        assert_eq!(session.stream_name(), "test");
    }

    #[tokio::test]
    async fn test_web_socket_upgrade_is_detected() {
        let (session, _client) = session_for_request(
            b"GET /live/test.flv HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: c2VjcmV0\r\n\r\n",
        )
        .await;
        assert!(session.is_web_socket());
        assert_eq!(session.web_socket_key(), Some("c2VjcmV0"));
    }

    #[tokio::test]
    async fn test_bad_request_closes_without_response() {
        let bad_requests: &[&[u8]] = &[
            b"GET /live/test HTTP/1.1\r\n\r\n",
            b"GET /test.flv HTTP/1.1\r\n\r\n",
            b"GET /a/b/test.flv HTTP/1.1\r\n\r\n",
            b"POST /live/test.flv HTTP/1.1\r\n\r\n",
            b"GET /live/test.flv\r\n\r\n",
        ];
        for request in bad_requests {
            let (server, mut client) = tcp_pair().await;
            client.write_all(request).await.unwrap();
            let mut session = SubSession::new(server);
            assert!(session.read_request().await.is_err());
            assert!(session.has_closed());
            // the peer sees eof without a single response byte
            let mut buf = [0u8; 16];
            assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_stat_delta_resets_between_calls() {
        let (server, _client) = tcp_pair().await;
        let session = SubSession::new(server);
        session.write_packet(Bytes::from_static(b"abcd"));

        let (now, diff) = session.get_stat();
        assert_eq!(now.wanna_write_count, 1);
        assert_eq!(now.wanna_write_byte, 4);
        assert_eq!(diff.wanna_write_count, 1);
        assert_eq!(diff.wanna_write_byte, 4);

        let (now, diff) = session.get_stat();
        assert_eq!(now.wanna_write_count, 1);
        assert_eq!(diff.wanna_write_count, 0);
        assert_eq!(diff.wanna_write_byte, 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (server, _client) = tcp_pair().await;
        let session = SubSession::new(server);
        session.dispose("first");
        session.dispose("second");
        assert!(session.has_closed());

        // closed sessions take no more buffers, not even into the stats
        session.write_packet(Bytes::from_static(b"late"));
        let (now, _) = session.get_stat();
        assert_eq!(now.wanna_write_count, 0);
    }

    #[tokio::test]
    async fn test_queue_overflow_disconnects_subscriber() {
        let (server, _client) = tcp_pair().await;
        let session = SubSession::new(server);
        for _ in 0..WRITE_CHAN_SIZE {
            session.write_packet(Bytes::from_static(b"x"));
        }
        assert!(!session.has_closed());
        session.write_packet(Bytes::from_static(b"x"));
        assert!(session.has_closed());

        let (now, _) = session.get_stat();
        assert_eq!(now.wanna_write_count, WRITE_CHAN_SIZE as u64 + 1);
    }
}
