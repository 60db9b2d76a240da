use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use codec::btp::{Frame, FrameType, SessionError};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, oneshot, watch},
    time::timeout,
};

/// Failure of one outbound request on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    PeerDisconnected,
    TimedOut,
}

/// Receiver of inbound `Message` frames.
///
/// Invoked in wire arrival order from the session's reader task; the
/// returned future is driven on its own task, so replies may complete
/// in any order. `None` means no reply is sent for this frame.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_message(
        &self,
        peer: &str,
        frame: Frame,
        closed: watch::Receiver<bool>,
    ) -> impl Future<Output = Option<Frame>> + Send + 'static;
}

enum WriteCmd {
    Frame(Bytes),
    Shutdown,
}

struct Inner {
    peer: String,
    writer: mpsc::UnboundedSender<WriteCmd>,
    pending: Mutex<AHashMap<u32, oneshot::Sender<Frame>>>,
    next_request: AtomicU32,
    closed: watch::Sender<bool>,
}

/// One live BTP session.
///
/// A dedicated reader task demultiplexes inbound frames: responses
/// complete the matching request slot, messages go to the handler. A
/// dedicated writer task serializes all outbound frames. The handle is
/// cheap to clone and safe to use from many tasks at once.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Takes ownership of an authenticated stream and starts the reader
    /// and writer tasks. Bytes already read past the handshake are
    /// handed over in `initial`.
    pub fn spawn<H: FrameHandler>(
        peer: &str,
        stream: TcpStream,
        initial: BytesMut,
        handler: Arc<H>,
    ) -> Self {
        // Any received frame should be processed as soon as possible,
        // response latency eats into every packet's expiry window.
        if let Err(err) = stream.set_nodelay(true) {
            log::error!("set nodelay failed: peer={}, err={}", peer, err);
        }

        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            peer: peer.to_string(),
            writer: writer_tx,
            pending: Mutex::new(AHashMap::new()),
            next_request: AtomicU32::new(1),
            closed,
        });

        tokio::spawn(write_loop(writer, writer_rx));
        tokio::spawn(read_loop(inner.clone(), reader, initial, handler));

        Self { inner }
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Sends a `Message` frame under a fresh request id and waits for
    /// the matching `Response` or `Error` frame.
    pub async fn request(&self, ilp: Bytes, deadline: Duration) -> Result<Frame, RequestError> {
        self.request_with(|id| Frame::message(id, ilp), deadline).await
    }

    /// As [`request`](Self::request), with a caller-built frame.
    pub async fn request_with<F>(&self, make: F, deadline: Duration) -> Result<Frame, RequestError>
    where
        F: FnOnce(u32) -> Frame,
    {
        let id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.inner.pending.lock().insert(id, sender);

        let frame = make(id);
        if self
            .inner
            .writer
            .send(WriteCmd::Frame(frame.to_bytes()))
            .is_err()
        {
            self.inner.pending.lock().remove(&id);
            return Err(RequestError::PeerDisconnected);
        }

        match timeout(deadline, receiver).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(RequestError::PeerDisconnected),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(RequestError::TimedOut)
            }
        }
    }

    /// Fire-and-forget frame send.
    pub fn send(&self, frame: &Frame) {
        let _ = self.inner.writer.send(WriteCmd::Frame(frame.to_bytes()));
    }

    /// Closes the session, optionally announcing the reason first.
    pub fn close(&self, reason: Option<(SessionError, &str)>) {
        if let Some((code, message)) = reason {
            let _ = self
                .inner
                .writer
                .send(WriteCmd::Frame(Frame::error(0, code, message).to_bytes()));
        }

        let _ = self.inner.writer.send(WriteCmd::Shutdown);
        finish(&self.inner);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Signal that flips to `true` once, when the session dies.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    pub async fn wait_closed(&self) {
        let mut closed = self.closed();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Whether two handles refer to the same live session.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Reads one frame from a raw stream, used for the handshake before a
/// session exists. Leftover bytes stay in `buf`.
pub async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<Frame> {
    loop {
        if let Some(size) = Frame::message_size(buf)? {
            let chunk = buf.split_to(size);
            return Ok(Frame::decode(&chunk)?);
        }

        if stream.read_buf(buf).await? == 0 {
            anyhow::bail!("connection closed during handshake");
        }
    }
}

/// Fails every pending request and latches the closed signal. Safe to
/// call more than once.
fn finish(inner: &Inner) {
    inner.closed.send_replace(true);
    inner.pending.lock().clear();
}

async fn write_loop(mut writer: OwnedWriteHalf, mut receiver: mpsc::UnboundedReceiver<WriteCmd>) {
    while let Some(cmd) = receiver.recv().await {
        match cmd {
            WriteCmd::Frame(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            WriteCmd::Shutdown => break,
        }
    }

    let _ = writer.shutdown().await;
}

async fn read_loop<H: FrameHandler>(
    inner: Arc<Inner>,
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    handler: Arc<H>,
) {
    'outer: loop {
        loop {
            match Frame::message_size(&buf) {
                Ok(Some(size)) => {
                    let chunk = buf.split_to(size);
                    match Frame::decode(&chunk) {
                        Ok(frame) => dispatch(&inner, frame, &handler),
                        // A frame that fails to decode is the remote
                        // misbehaving; drop it, keep the session.
                        Err(err) => {
                            log::warn!("bad frame: peer={}, err={}", inner.peer, err);
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("frame overflow: peer={}, err={}", inner.peer, err);
                    break 'outer;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    log::info!("session disconnect: peer={}", inner.peer);
    let _ = inner.writer.send(WriteCmd::Shutdown);
    finish(&inner);
}

fn dispatch<H: FrameHandler>(inner: &Arc<Inner>, frame: Frame, handler: &Arc<H>) {
    match frame.kind {
        FrameType::Response | FrameType::Error => {
            let slot = inner.pending.lock().remove(&frame.request_id);
            match slot {
                Some(slot) => {
                    let _ = slot.send(frame);
                }
                None => {
                    log::debug!(
                        "response with no pending request: peer={}, id={}",
                        inner.peer,
                        frame.request_id
                    );
                }
            }
        }
        FrameType::Message => {
            // The handler future is created here, in wire order; its
            // completion runs on its own task so slow packets do not
            // stall the session.
            let reply = handler.on_message(&inner.peer, frame, inner.closed.subscribe());
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Some(frame) = reply.await {
                    let _ = inner.writer.send(WriteCmd::Frame(frame.to_bytes()));
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct Echo;

    impl FrameHandler for Echo {
        fn on_message(
            &self,
            _: &str,
            frame: Frame,
            _: watch::Receiver<bool>,
        ) -> impl Future<Output = Option<Frame>> + Send + 'static {
            async move {
                let ilp = frame.get(codec::btp::PROTOCOL_ILP)?.content.clone();
                Some(Frame::response(frame.request_id, ilp))
            }
        }
    }

    struct Quiet;

    impl FrameHandler for Quiet {
        fn on_message(
            &self,
            _: &str,
            _: Frame,
            _: watch::Receiver<bool>,
        ) -> impl Future<Output = Option<Frame>> + Send + 'static {
            async move { None }
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (client, server) = pair().await;
        let client = Session::spawn("b", client, BytesMut::new(), Arc::new(Quiet));
        let _server = Session::spawn("a", server, BytesMut::new(), Arc::new(Echo));

        let frame = client
            .request(Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(frame.kind, FrameType::Response);
        assert_eq!(
            frame.get(codec::btp::PROTOCOL_ILP).unwrap().content,
            &b"ping"[..]
        );
    }

    #[tokio::test]
    async fn concurrent_requests_correlate() {
        let (client, server) = pair().await;
        let client = Session::spawn("b", client, BytesMut::new(), Arc::new(Quiet));
        let _server = Session::spawn("a", server, BytesMut::new(), Arc::new(Echo));

        let mut handles = Vec::new();
        for n in 0u8..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let body = Bytes::from(vec![n; 8]);
                let frame = client.request(body.clone(), Duration::from_secs(1)).await.unwrap();
                assert_eq!(frame.get(codec::btp::PROTOCOL_ILP).unwrap().content, body);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (client, server) = pair().await;
        let client = Session::spawn("b", client, BytesMut::new(), Arc::new(Quiet));
        let server = Session::spawn("a", server, BytesMut::new(), Arc::new(Quiet));

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request(Bytes::from_static(b"ping"), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close(None);

        assert_eq!(
            pending.await.unwrap(),
            Err(RequestError::PeerDisconnected)
        );

        client.wait_closed().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn request_deadline_expires() {
        let (client, server) = pair().await;
        let client = Session::spawn("b", client, BytesMut::new(), Arc::new(Quiet));
        let _server = Session::spawn("a", server, BytesMut::new(), Arc::new(Quiet));

        let result = client
            .request(Bytes::from_static(b"ping"), Duration::from_millis(50))
            .await;

        assert_eq!(result, Err(RequestError::TimedOut));
    }
}
