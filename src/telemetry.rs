use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Notify, time::sleep};

use crate::{config, peers::backoff};

/// One telemetry event on the wire: a JSON document with a `type` tag,
/// the reporting node id and an ISO-8601 timestamp, inside a
/// length-delimited frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum EventBody {
    /// periodic health heartbeat
    NodeStatus {
        status: &'static str,
        peers: usize,
        ready_peers: usize,
    },
    /// a packet left this node
    PacketSent {
        peer: String,
        packet: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        amount: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// a packet arrived at this node
    PacketReceived {
        peer: String,
        packet: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        amount: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// outcome of one routing-table query
    RouteLookup {
        destination: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_hop: Option<String>,
    },
    /// free-form structured log line
    Log {
        level: &'static str,
        event: &'static str,
        message: String,
    },
    /// peer account balance changed
    AccountBalance {
        peer: String,
        token: String,
        balance: i64,
    },
    /// settlement started toward a peer
    SettlementTriggered { peer: String, amount: u64 },
    /// settlement finished
    SettlementCompleted { peer: String, amount: u64 },
    /// a payment channel opened on chain
    ChannelOpened {
        channel_id: String,
        peer: String,
        capacity: u64,
    },
    /// a payment channel balance moved
    ChannelBalanceUpdate { channel_id: String, balance: u64 },
    /// a payment channel closed
    ChannelSettled { channel_id: String },
}

impl EventBody {
    pub const fn kind_name(&self) -> &'static str {
        match *self {
            Self::NodeStatus { .. } => "NodeStatus",
            Self::PacketSent { .. } => "PacketSent",
            Self::PacketReceived { .. } => "PacketReceived",
            Self::RouteLookup { .. } => "RouteLookup",
            Self::Log { .. } => "Log",
            Self::AccountBalance { .. } => "AccountBalance",
            Self::SettlementTriggered { .. } => "SettlementTriggered",
            Self::SettlementCompleted { .. } => "SettlementCompleted",
            Self::ChannelOpened { .. } => "ChannelOpened",
            Self::ChannelBalanceUpdate { .. } => "ChannelBalanceUpdate",
            Self::ChannelSettled { .. } => "ChannelSettled",
        }
    }

    /// State-bearing events survive queue overflow; per-packet events
    /// are dropped first.
    const fn is_critical(&self) -> bool {
        matches!(
            *self,
            Self::NodeStatus { .. }
                | Self::AccountBalance { .. }
                | Self::SettlementTriggered { .. }
                | Self::SettlementCompleted { .. }
                | Self::ChannelOpened { .. }
                | Self::ChannelBalanceUpdate { .. }
                | Self::ChannelSettled { .. }
        )
    }
}

struct Queue {
    events: VecDeque<Event>,
    dropped: u64,
}

struct TelemetryInner {
    node_id: String,
    capacity: usize,
    enabled: bool,
    queue: Mutex<Queue>,
    notify: Notify,
}

/// Non-blocking telemetry emitter.
///
/// `emit` never waits: events land in a bounded queue drained by a
/// background publisher that owns the hub connection. When the queue is
/// full the oldest non-critical event is dropped and a single
/// `telemetry_dropped` warning is coalesced in.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

impl Telemetry {
    pub fn new(node_id: &str, config: &config::Telemetry) -> Self {
        let inner = Arc::new(TelemetryInner {
            node_id: node_id.to_string(),
            capacity: config.capacity.max(16),
            enabled: config.endpoint.is_some(),
            queue: Mutex::new(Queue {
                events: VecDeque::with_capacity(1024),
                dropped: 0,
            }),
            notify: Notify::new(),
        });

        if let Some(endpoint) = config.endpoint.clone() {
            tokio::spawn(publish_loop(inner.clone(), endpoint));
        }

        Self { inner }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Queues one event. Returns immediately in every case.
    pub fn emit(&self, body: EventBody) {
        if !self.inner.enabled {
            return;
        }

        let event = Event {
            kind: body.kind_name(),
            node_id: self.inner.node_id.clone(),
            timestamp: Utc::now(),
            body,
        };

        {
            let mut queue = self.inner.queue.lock();
            if queue.events.len() >= self.inner.capacity {
                match queue.events.iter().position(|it| !it.body.is_critical()) {
                    Some(at) => {
                        queue.events.remove(at);
                    }
                    None => {
                        queue.events.pop_front();
                    }
                }

                queue.dropped += 1;
            } else if queue.dropped > 0 {
                let dropped = std::mem::take(&mut queue.dropped);
                let warning = EventBody::Log {
                    level: "warn",
                    event: "telemetry_dropped",
                    message: format!("{} events dropped under backpressure", dropped),
                };

                queue.events.push_back(Event {
                    kind: warning.kind_name(),
                    node_id: self.inner.node_id.clone(),
                    timestamp: Utc::now(),
                    body: warning,
                });
            }

            queue.events.push_back(event);
        }

        self.inner.notify.notify_one();
    }

    /// Number of queued events, test and shutdown aid.
    pub fn backlog(&self) -> usize {
        self.inner.queue.lock().events.len()
    }
}

async fn publish_loop(inner: Arc<TelemetryInner>, endpoint: String) {
    let mut failures = 0u32;
    loop {
        let stream = match TcpStream::connect(&endpoint).await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!(
                    "telemetry hub unreachable: endpoint={}, err={}",
                    endpoint,
                    err
                );

                failures = failures.saturating_add(1);
                sleep(backoff(failures)).await;
                continue;
            }
        };

        log::info!("telemetry hub connected: endpoint={}", endpoint);
        failures = 0;

        if let Err(err) = publish(&inner, stream).await {
            log::warn!("telemetry publish failed: err={}", err);
        }

        sleep(backoff(failures)).await;
    }
}

async fn publish(inner: &Arc<TelemetryInner>, mut stream: TcpStream) -> anyhow::Result<()> {
    loop {
        let batch: Vec<Event> = {
            let mut queue = inner.queue.lock();
            queue.events.drain(..).collect()
        };

        if batch.is_empty() {
            inner.notify.notified().await;
            continue;
        }

        for event in batch {
            let body = serde_json::to_vec(&event)?;
            stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
            stream.write_all(&body).await?;
        }
    }
}
