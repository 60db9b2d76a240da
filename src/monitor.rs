use std::sync::{
    Arc, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use serde::Serialize;

/// Health of the node as exposed to external probes. `Healthy` requires
/// at least half of the configured outbound peers in a ready session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Starting,
    Healthy,
    Unhealthy,
}

impl Health {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Serialize)]
pub struct PeerCounts {
    pub received_bytes: usize,
    pub send_bytes: usize,
    pub received_pkts: usize,
    pub send_pkts: usize,
    pub fulfills: usize,
    pub rejects: usize,
}

/// The type of information passed in the monitoring channel
#[derive(Debug, Clone)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    Fulfills(usize),
    Rejects(usize),
}

#[derive(Default)]
struct Count(AtomicUsize);

impl Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-peer traffic statistics
#[derive(Default)]
struct Counts {
    received_bytes: Count,
    send_bytes: Count,
    received_pkts: Count,
    send_pkts: Count,
    fulfills: Count,
    rejects: Count,
}

impl Counts {
    fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::Fulfills(v) => self.fulfills.add(*v),
            Stats::Rejects(v) => self.rejects.add(*v),
        }
    }
}

/// Peer traffic monitor
#[derive(Clone, Default)]
pub struct Monitor {
    peers: Arc<RwLock<AHashMap<String, Counts>>>,
}

impl Monitor {
    /// get signal sender
    ///
    /// The signal sender can notify the monitoring instance to update
    /// internal statistics.
    pub fn get_actor(&self) -> MonitorActor {
        MonitorActor(self.peers.clone())
    }

    /// Add a peer to the watch list
    pub fn set(&self, peer: String) {
        self.peers.write().unwrap().insert(peer, Counts::default());
    }

    /// Remove a peer from the watch list
    pub fn delete(&self, peer: &str) {
        self.peers.write().unwrap().remove(peer);
    }

    /// Obtain a list of statistics from monitoring
    pub fn get_peers(&self) -> Vec<(String, PeerCounts)> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .map(|(peer, counts)| {
                (
                    peer.clone(),
                    PeerCounts {
                        received_bytes: counts.received_bytes.get(),
                        send_bytes: counts.send_bytes.get(),
                        received_pkts: counts.received_pkts.get(),
                        send_pkts: counts.send_pkts.get(),
                        fulfills: counts.fulfills.get(),
                        rejects: counts.rejects.get(),
                    },
                )
            })
            .collect()
    }
}

/// monitor sender
///
/// It is held by the observer, and status information can be sent to the
/// monitoring instance through this instance to update the internal
/// statistical information of the monitor.
#[derive(Clone)]
pub struct MonitorActor(Arc<RwLock<AHashMap<String, Counts>>>);

impl MonitorActor {
    pub fn send(&self, peer: &str, payload: &[Stats]) {
        if let Some(counts) = self.0.read().unwrap().get(peer) {
            for item in payload {
                counts.add(item);
            }
        }
    }
}
