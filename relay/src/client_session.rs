use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    sync::{mpsc, oneshot},
    time::{Duration, timeout},
};
use tokio_util::{bytes::Bytes, sync::CancellationToken};

use crate::{
    errors::{RelaySessionError, RelaySessionResult},
    transport::PublishTransport,
};

#[derive(Debug, Clone)]
pub struct ClientSessionOption {
    /// Deadline for `do_connect`, 0 means none.
    pub do_timeout_ms: u64,
    /// Per-write deadline for media bytes, 0 means none.
    pub write_av_timeout_ms: u64,
    /// Io-layer write buffer; 0 means unbuffered. Honored by transports that
    /// buffer, the session layer itself never re-frames bytes.
    pub write_buf_size: usize,
    /// Size of the async write queue; 0 means writes happen on the caller's
    /// task, synchronously.
    pub write_chan_size: usize,
    pub handshake_complex_flag: bool,
}

impl Default for ClientSessionOption {
    fn default() -> Self {
        Self {
            do_timeout_ms: 10_000,
            write_av_timeout_ms: 0,
            write_buf_size: 0,
            write_chan_size: 0,
            handshake_complex_flag: false,
        }
    }
}

enum WriteCmd {
    Chunk(Bytes),
    Flush,
}

struct DoneState {
    tx: Mutex<Option<oneshot::Sender<RelaySessionResult<()>>>>,
}

impl DoneState {
    fn finish(&self, result: RelaySessionResult<()>) {
        if let Some(tx) = self.tx.lock().expect("done lock poisoned").take() {
            let _ = tx.send(result);
        }
    }
}

/// Lifecycle plumbing shared by push and pull client sessions: connect with a
/// deadline, optional async write queue, idempotent dispose and a one-shot
/// completion channel.
pub struct ClientSession<T: PublishTransport> {
    unique_key: String,
    option: ClientSessionOption,
    // Some until do_connect; queued mode moves it into the writer task,
    // synchronous mode keeps it here.
    transport: Arc<tokio::sync::Mutex<Option<T>>>,
    wchan_tx: Mutex<Option<mpsc::Sender<WriteCmd>>>,
    disposed: AtomicBool,
    exit: CancellationToken,
    done: Arc<DoneState>,
    done_rx: Mutex<Option<oneshot::Receiver<RelaySessionResult<()>>>>,
}

impl<T: PublishTransport> ClientSession<T> {
    pub fn new(unique_key_prefix: &str, transport: T, option: ClientSessionOption) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            unique_key: utils::unique_key::gen_unique_key(unique_key_prefix),
            option,
            transport: Arc::new(tokio::sync::Mutex::new(Some(transport))),
            wchan_tx: Mutex::new(None),
            disposed: AtomicBool::new(false),
            exit: CancellationToken::new(),
            done: Arc::new(DoneState {
                tx: Mutex::new(Some(done_tx)),
            }),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    /// Blocks until the transport reports ready-to-publish, or the configured
    /// deadline fires. On success the write path is armed.
    pub async fn do_connect(&self, url: &str) -> RelaySessionResult<()> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(RelaySessionError::Disposed)?;

        let connect = transport.do_connect(url);
        if self.option.do_timeout_ms > 0 {
            match timeout(Duration::from_millis(self.option.do_timeout_ms), connect).await {
                Ok(res) => res?,
                Err(_) => {
                    return Err(RelaySessionError::ConnectTimeout(self.option.do_timeout_ms));
                }
            }
        } else {
            connect.await?;
        }

        if self.option.write_chan_size > 0 {
            let transport = guard.take().expect("transport checked above");
            let (tx, rx) = mpsc::channel(self.option.write_chan_size);
            *self.wchan_tx.lock().expect("wchan lock poisoned") = Some(tx);
            tokio::spawn(run_write_queue(
                self.unique_key.clone(),
                transport,
                rx,
                self.exit.clone(),
                Arc::clone(&self.done),
                self.option.write_av_timeout_ms,
            ));
        } else {
            tokio::spawn(run_dispose_watch(
                Arc::clone(&self.transport),
                self.exit.clone(),
                Arc::clone(&self.done),
            ));
        }
        Ok(())
    }

    /// Never blocks in queued mode; a saturated queue surfaces as
    /// `WriteQueueFull` so the caller can decide per target.
    pub async fn write(&self, chunk: Bytes) -> RelaySessionResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RelaySessionError::Disposed);
        }
        let tx = self.wchan_tx.lock().expect("wchan lock poisoned").clone();
        match tx {
            Some(tx) => tx.try_send(WriteCmd::Chunk(chunk)).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => RelaySessionError::WriteQueueFull,
                mpsc::error::TrySendError::Closed(_) => RelaySessionError::Disposed,
            }),
            None => {
                let mut guard = self.transport.lock().await;
                let transport = guard.as_mut().ok_or(RelaySessionError::Disposed)?;
                write_with_deadline(transport, chunk, self.option.write_av_timeout_ms).await
            }
        }
    }

    pub async fn flush(&self) -> RelaySessionResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RelaySessionError::Disposed);
        }
        let tx = self.wchan_tx.lock().expect("wchan lock poisoned").clone();
        match tx {
            Some(tx) => tx.try_send(WriteCmd::Flush).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => RelaySessionError::WriteQueueFull,
                mpsc::error::TrySendError::Closed(_) => RelaySessionError::Disposed,
            }),
            None => {
                let mut guard = self.transport.lock().await;
                let transport = guard.as_mut().ok_or(RelaySessionError::Disposed)?;
                transport.flush().await
            }
        }
    }

    /// Idempotent. The first caller wakes the supervising task, which closes
    /// the transport and resolves the completion channel.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("[{}] lifecycle dispose relay client session", self.unique_key);
        self.exit.cancel();
    }

    /// The terminal result is delivered exactly once; only the first caller
    /// gets the receiver.
    pub fn wait_chan(&self) -> Option<oneshot::Receiver<RelaySessionResult<()>>> {
        self.done_rx.lock().expect("done rx lock poisoned").take()
    }
}

async fn write_with_deadline<T: PublishTransport>(
    transport: &mut T,
    chunk: Bytes,
    write_av_timeout_ms: u64,
) -> RelaySessionResult<()> {
    if write_av_timeout_ms == 0 {
        return transport.write(chunk).await;
    }
    match timeout(
        Duration::from_millis(write_av_timeout_ms),
        transport.write(chunk),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => Err(RelaySessionError::WriteTimeout(write_av_timeout_ms)),
    }
}

async fn run_write_queue<T: PublishTransport>(
    unique_key: String,
    mut transport: T,
    mut rx: mpsc::Receiver<WriteCmd>,
    exit: CancellationToken,
    done: Arc<DoneState>,
    write_av_timeout_ms: u64,
) {
    let result = loop {
        tokio::select! {
            _ = exit.cancelled() => break Ok(()),
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break Ok(()); };
                let res = match cmd {
                    WriteCmd::Chunk(chunk) => {
                        write_with_deadline(&mut transport, chunk, write_av_timeout_ms).await
                    }
                    WriteCmd::Flush => transport.flush().await,
                };
                if let Err(err) = res {
                    tracing::error!("[{}] relay write failed: {}", unique_key, err);
                    break Err(err);
                }
            }
        }
    };
    let _ = transport.close().await;
    done.finish(result);
}

async fn run_dispose_watch<T: PublishTransport>(
    transport: Arc<tokio::sync::Mutex<Option<T>>>,
    exit: CancellationToken,
    done: Arc<DoneState>,
) {
    exit.cancelled().await;
    if let Some(mut transport) = transport.lock().await.take() {
        let _ = transport.close().await;
    }
    done.finish(Ok(()));
}
