//! Peer registry state.
//!
//! The registry tracks every configured peer and the single live session
//! slot each peer may hold. It is generic over the session handle type,
//! so the transport layer decides what a handle is; the registry only
//! enforces the lifecycle invariants:
//!
//! - at most one `ready` session per peer id at any instant,
//! - installing over a live session hands the displaced handle back to
//!   the caller so it can be closed with a replacement notice,
//! - removing a peer hands back the live handle for a removal notice.

use std::time::Instant;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Ready,
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: PeerId,
    pub direction: Direction,
    /// Dial target, outbound peers only.
    pub endpoint: Option<String>,
    pub auth_token: Bytes,
    /// Informational; routing is configured separately.
    pub declared_prefixes: Vec<String>,
}

struct PeerEntry<S> {
    config: PeerConfig,
    state: SessionState,
    session: Option<S>,
    last_activity: Instant,
}

/// Snapshot row for health and telemetry iteration.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub id: PeerId,
    pub direction: Direction,
    pub state: SessionState,
    pub idle: std::time::Duration,
}

pub struct Registry<S> {
    peers: RwLock<AHashMap<PeerId, PeerEntry<S>>>,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            peers: RwLock::new(AHashMap::new()),
        }
    }
}

impl<S: Clone> Registry<S> {
    /// Adds a peer, or updates its configuration in place.
    ///
    /// Returns `false` when an identical configuration was already
    /// present, so repeated configuration loads are no-ops.
    ///
    /// # Example
    ///
    /// ```
    /// use bytes::Bytes;
    /// use ilp_connector_service::registry::*;
    ///
    /// let registry: Registry<()> = Registry::default();
    /// let config = PeerConfig {
    ///     id: "b".to_string(),
    ///     direction: Direction::Outbound,
    ///     endpoint: Some("127.0.0.1:7768".to_string()),
    ///     auth_token: Bytes::from_static(b"secret"),
    ///     declared_prefixes: vec![],
    /// };
    ///
    /// assert!(registry.add_peer(config.clone()));
    /// assert!(!registry.add_peer(config));
    /// ```
    pub fn add_peer(&self, config: PeerConfig) -> bool {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(&config.id) {
            if entry.config == config {
                return false;
            }

            entry.config = config;
            return true;
        }

        peers.insert(
            config.id.clone(),
            PeerEntry {
                config,
                state: SessionState::Closed,
                session: None,
                last_activity: Instant::now(),
            },
        );

        true
    }

    /// Removes a peer, returning its live session handle so the caller
    /// can close it.
    ///
    /// # Example
    ///
    /// ```
    /// use bytes::Bytes;
    /// use ilp_connector_service::registry::*;
    ///
    /// let registry = Registry::default();
    /// registry.add_peer(PeerConfig {
    ///     id: "b".to_string(),
    ///     direction: Direction::Inbound,
    ///     endpoint: None,
    ///     auth_token: Bytes::from_static(b"secret"),
    ///     declared_prefixes: vec![],
    /// });
    ///
    /// registry.install("b", 7u32).unwrap();
    /// assert_eq!(registry.remove_peer("b"), Some(7));
    /// assert!(registry.config("b").is_none());
    /// ```
    pub fn remove_peer(&self, id: &str) -> Option<S> {
        self.peers.write().remove(id).and_then(|it| it.session)
    }

    /// Installs a ready session for a peer. Returns the displaced handle
    /// when the peer already had one; `Err` when the peer is unknown.
    pub fn install(&self, id: &str, session: S) -> Result<Option<S>, UnknownPeer> {
        let mut peers = self.peers.write();
        let entry = peers.get_mut(id).ok_or(UnknownPeer)?;

        let displaced = entry.session.replace(session);
        entry.state = SessionState::Ready;
        entry.last_activity = Instant::now();
        Ok(displaced)
    }

    /// Transitions the peer's session state. Leaving `Ready` clears the
    /// session slot; the handle is returned for cleanup.
    pub fn set_state(&self, id: &str, state: SessionState) -> Option<S> {
        let mut peers = self.peers.write();
        let entry = peers.get_mut(id)?;

        entry.state = state;
        entry.last_activity = Instant::now();
        if state == SessionState::Ready {
            None
        } else {
            entry.session.take()
        }
    }

    /// The ready session handle for a peer, if any.
    ///
    /// # Example
    ///
    /// ```
    /// use bytes::Bytes;
    /// use ilp_connector_service::registry::*;
    ///
    /// let registry = Registry::default();
    /// registry.add_peer(PeerConfig {
    ///     id: "b".to_string(),
    ///     direction: Direction::Outbound,
    ///     endpoint: Some("127.0.0.1:7768".to_string()),
    ///     auth_token: Bytes::from_static(b"secret"),
    ///     declared_prefixes: vec![],
    /// });
    ///
    /// assert_eq!(registry.lookup("b"), None);
    ///
    /// registry.install("b", 1u32).unwrap();
    /// assert_eq!(registry.lookup("b"), Some(1));
    ///
    /// registry.set_state("b", SessionState::Draining);
    /// assert_eq!(registry.lookup("b"), None);
    /// ```
    pub fn lookup(&self, id: &str) -> Option<S> {
        let peers = self.peers.read();
        let entry = peers.get(id)?;
        if entry.state != SessionState::Ready {
            return None;
        }

        entry.session.clone()
    }

    pub fn config(&self, id: &str) -> Option<PeerConfig> {
        self.peers.read().get(id).map(|it| it.config.clone())
    }

    pub fn auth_token(&self, id: &str) -> Option<Bytes> {
        self.peers.read().get(id).map(|it| it.config.auth_token.clone())
    }

    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.peers.write().get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Every live session handle, for drain-style shutdown.
    pub fn sessions(&self) -> Vec<S> {
        self.peers
            .read()
            .values()
            .filter_map(|it| it.session.clone())
            .collect()
    }

    /// Stable snapshot of every peer for health and telemetry.
    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.peers
            .read()
            .iter()
            .map(|(id, entry)| PeerStatus {
                id: id.clone(),
                direction: entry.config.direction,
                state: entry.state,
                idle: entry.last_activity.elapsed(),
            })
            .collect()
    }

    /// `(ready, configured)` counts over outbound peers, the health
    /// surface's input.
    pub fn outbound_ready(&self) -> (usize, usize) {
        let peers = self.peers.read();
        let outbound = peers
            .values()
            .filter(|it| it.config.direction == Direction::Outbound);

        let mut ready = 0;
        let mut total = 0;
        for entry in outbound {
            total += 1;
            if entry.state == SessionState::Ready {
                ready += 1;
            }
        }

        (ready, total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownPeer;

impl std::error::Error for UnknownPeer {}

impl std::fmt::Display for UnknownPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer is not registered")
    }
}
