//! The fan-out hub.
//!
//! One listener serves both kinds of connections. A connection is
//! unidentified until its first useful frame: the literal
//! `ClientConnect` marks a subscriber, any valid telemetry event marks
//! an emitter under the event's `nodeId`. Ingested events fold into the
//! replayable state and broadcast verbatim to every ready subscriber
//! through a bounded per-subscriber queue; a subscriber that cannot
//! keep up is dropped, ingestion never blocks.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};

use crate::{config::Config, state::HubState};

const MAX_FRAME_LEN: usize = 256 * 1024;
const SUBSCRIBE_MAGIC: &[u8] = b"ClientConnect";

/// How often settled channels are checked for eviction.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Bytes>,
}

pub struct Hub {
    queue_capacity: usize,
    state: Mutex<HubState>,
    // Lock order is always state before subscribers, so a subscriber
    // registering under the state lock never misses a broadcast.
    subscribers: Mutex<Vec<Subscriber>>,
    emitters: Mutex<AHashMap<String, u64>>,
    next_id: AtomicU64,
}

impl Hub {
    fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(16),
            state: Mutex::new(HubState::default()),
            subscribers: Mutex::new(Vec::new()),
            emitters: Mutex::new(AHashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Node ids with a live emitter claim.
    pub fn emitters(&self) -> Vec<String> {
        self.emitters.lock().keys().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Validates and folds one frame; returns the reporting node id, or
    /// `None` for a malformed frame (which is logged and discarded
    /// without penalizing the sender).
    fn ingest(&self, frame: &Bytes) -> Option<String> {
        let event: Value = serde_json::from_slice(frame).ok()?;
        let kind = event.get("type")?.as_str()?;
        let node_id = event.get("nodeId")?.as_str()?;
        if kind.is_empty() || node_id.is_empty() {
            return None;
        }

        let mut state = self.state.lock();
        state.apply(kind, node_id, &event);
        self.broadcast(frame);
        Some(node_id.to_string())
    }

    /// Registers a subscriber and queues its replay: every cached
    /// `NodeStatus`, then one `InitialChannelState`.
    fn subscribe(&self, id: u64) -> mpsc::Receiver<Bytes> {
        let state = self.state.lock();

        let mut frames: Vec<Bytes> = Vec::new();
        for event in state.node_status_events() {
            if let Ok(body) = serde_json::to_vec(&event) {
                frames.push(Bytes::from(body));
            }
        }

        let initial = json!({
            "type": "InitialChannelState",
            "channels": state.channel_events(),
        });

        if let Ok(body) = serde_json::to_vec(&initial) {
            frames.push(Bytes::from(body));
        }

        let (sender, receiver) = mpsc::channel(self.queue_capacity + frames.len() + 1);
        for frame in frames {
            let _ = sender.try_send(frame);
        }

        self.subscribers.lock().push(Subscriber { id, sender });
        receiver
    }

    fn broadcast(&self, frame: &Bytes) {
        self.subscribers.lock().retain(|it| {
            match it.sender.try_send(frame.clone()) {
                Ok(()) => true,
                Err(_) => {
                    log::warn!("subscriber dropped for backpressure: id={}", it.id);
                    false
                }
            }
        });
    }

    fn remove_subscriber(&self, id: u64) {
        self.subscribers.lock().retain(|it| it.id != id);
    }

    fn claim(&self, node_id: &str, conn: u64) -> bool {
        // Latest claim wins; the prior connection keeps running but is
        // no longer the canonical source for this node id.
        self.emitters.lock().insert(node_id.to_string(), conn) != Some(conn)
    }

    fn release(&self, node_id: &str, conn: u64) {
        let mut emitters = self.emitters.lock();
        if emitters.get(node_id) == Some(&conn) {
            emitters.remove(node_id);
        }
    }
}

/// Binds the listener and starts serving. Returns the hub handle and
/// the bound address.
pub async fn start(config: Arc<Config>) -> anyhow::Result<(Arc<Hub>, SocketAddr)> {
    let hub = Arc::new(Hub::new(config.hub.subscriber_queue));
    let listener = TcpListener::bind(config.hub.listen).await?;
    let addr = listener.local_addr()?;
    log::info!("telemetry hub listening: addr={}", addr);

    {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            loop {
                interval.tick().await;
                hub.state.lock().sweep();
            }
        });
    }

    {
        let hub = hub.clone();
        tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                log::info!("connection accept: addr={:?}", addr);
                tokio::spawn(handle_connection(hub.clone(), stream, addr));
            }

            log::error!("telemetry hub close: addr={}", addr);
        });
    }

    Ok((hub, addr))
}

enum Role {
    Unknown,
    Emitter(String),
    Subscriber,
}

async fn handle_connection(hub: Arc<Hub>, stream: TcpStream, addr: SocketAddr) {
    let conn = hub.next_id.fetch_add(1, Ordering::Relaxed);
    let (mut reader, writer) = stream.into_split();
    let mut writer = Some(writer);
    let mut buf = BytesMut::new();
    let mut role = Role::Unknown;

    loop {
        let frame = match read_frame(&mut reader, &mut buf).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                log::warn!("connection error: addr={:?}, err={}", addr, err);
                break;
            }
        };

        if matches!(role, Role::Unknown) && frame.as_ref() == SUBSCRIBE_MAGIC {
            role = Role::Subscriber;
            let receiver = hub.subscribe(conn);
            if let Some(writer) = writer.take() {
                tokio::spawn(subscriber_writer(writer, receiver));
            }

            log::info!("subscriber registered: addr={:?}", addr);
            continue;
        }

        match hub.ingest(&frame) {
            Some(node_id) => {
                if !matches!(role, Role::Subscriber) {
                    if hub.claim(&node_id, conn) {
                        log::info!("emitter registered: addr={:?}, node={}", addr, node_id);
                    }

                    role = Role::Emitter(node_id);
                }
            }
            None => {
                log::warn!("malformed telemetry frame: addr={:?}", addr);
            }
        }
    }

    match role {
        Role::Emitter(node_id) => hub.release(&node_id, conn),
        Role::Subscriber => hub.remove_subscriber(conn),
        Role::Unknown => {}
    }

    log::info!("connection closed: addr={:?}", addr);
}

async fn subscriber_writer(mut writer: OwnedWriteHalf, mut receiver: mpsc::Receiver<Bytes>) {
    while let Some(frame) = receiver.recv().await {
        if writer
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .is_err()
        {
            break;
        }

        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn read_frame(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> anyhow::Result<Option<Bytes>> {
    loop {
        if buf.len() >= 4 {
            let size = u32::from_be_bytes(buf[..4].try_into()?) as usize;
            if size > MAX_FRAME_LEN {
                anyhow::bail!("frame too large: {}", size);
            }

            if buf.len() >= size + 4 {
                let mut chunk = buf.split_to(size + 4);
                chunk.advance(4);
                return Ok(Some(chunk.freeze()));
            }
        }

        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}
