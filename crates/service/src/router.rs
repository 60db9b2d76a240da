//! The packet router.
//!
//! One call to [`Router::route_prepare`] owns the whole life of one
//! packet: validation, route lookup, the accounting reserve, the
//! forward, response correlation and the exactly-once commit. The
//! caller runs it inside the task serving the originating session, so
//! originator cancellation is just a signal into the same future.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use codec::{
    condition::condition_matches,
    packet::{Address, ErrorCode, Packet, Prepare, Reject},
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    AccountingGate, LocalHandler, Observer, Outcome, PacketRef, PeerId, routing::RoutingTable,
};

/// Failure modes of one forward attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    /// No ready session for the next hop.
    Unreachable,
    /// The next-hop session was lost after the packet was handed over.
    Disconnected,
    /// The transport gave up before a response arrived.
    TimedOut,
}

/// Sends one encoded `Prepare` toward a peer and resolves with the raw
/// response packet.
///
/// The returned future must own everything it needs and resolve by
/// `expires_at` at the latest: after a local deadline the router keeps
/// polling it in the background so a late `Fulfill` is still credited
/// to accounting.
pub trait Forwarder: Send + Sync + 'static {
    fn forward(
        &self,
        peer: &str,
        packet: Bytes,
        expires_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Bytes, ForwardError>> + Send + 'static;
}

pub struct RouterOptions {
    pub self_address: Address,
    /// How many times one correlation id (execution condition) may enter
    /// the router within its expiry window before it is treated as a
    /// forwarding loop.
    pub max_reentries: u32,
    /// Slack kept between our response deadline and the packet expiry,
    /// so the originator sees our answer before its own deadline.
    pub headroom: Duration,
    /// Upper bound for one response wait.
    pub max_response_wait: Duration,
}

impl RouterOptions {
    pub fn new(self_address: Address) -> Self {
        Self {
            self_address,
            max_reentries: 16,
            headroom: Duration::from_secs(1),
            max_response_wait: Duration::from_secs(30),
        }
    }
}

struct InFlight {
    accepted_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    execution_condition: [u8; 32],
}

struct WindowEntry {
    count: u32,
    expires_at: DateTime<Utc>,
}

/// Correlation-window capacity that triggers a prune of expired entries.
const WINDOW_PRUNE_LEN: usize = 4096;

pub struct Router<F, G, L, O> {
    options: RouterOptions,
    routing: Arc<RoutingTable>,
    forwarder: F,
    gate: Arc<G>,
    local: L,
    observer: O,
    in_flight: Mutex<AHashMap<(PeerId, u32), InFlight>>,
    window: Mutex<AHashMap<[u8; 32], WindowEntry>>,
    sequence: AtomicU64,
}

enum Wait {
    Response(Result<Bytes, ForwardError>),
    Deadline,
    OriginGone,
}

impl<F, G, L, O> Router<F, G, L, O>
where
    F: Forwarder,
    G: AccountingGate,
    L: LocalHandler,
    O: Observer,
{
    pub fn new(
        options: RouterOptions,
        routing: Arc<RoutingTable>,
        forwarder: F,
        gate: G,
        local: L,
        observer: O,
    ) -> Self {
        Self {
            options,
            routing,
            forwarder,
            gate: Arc::new(gate),
            local,
            observer,
            in_flight: Mutex::new(AHashMap::with_capacity(1024)),
            window: Mutex::new(AHashMap::with_capacity(1024)),
            sequence: AtomicU64::new(0),
        }
    }

    /// Routes one `Prepare` received from `origin` and returns the
    /// encoded response to deliver back on that session.
    ///
    /// Returns `None` when the originating session closed while the
    /// packet was in flight; accounting is still committed (outcome
    /// `OriginatorGone`) but no response is attempted.
    pub async fn route_prepare(
        &self,
        origin: &str,
        origin_request: u32,
        raw: Bytes,
        mut origin_closed: watch::Receiver<bool>,
    ) -> Option<Bytes> {
        let prepare = match Packet::parse(&raw) {
            Ok(Packet::Prepare(prepare)) => prepare,
            Ok(_) => return Some(self.reject(origin, ErrorCode::F01_INVALID_PACKET, "expected a prepare")),
            Err(err) => {
                log::debug!("malformed packet: peer={}, err={}", origin, err);
                return Some(self.reject(origin, ErrorCode::F01_INVALID_PACKET, "invalid packet"));
            }
        };

        self.observer.prepare_received(origin, &prepare);

        if prepare.amount == 0 {
            return Some(self.reject(origin, ErrorCode::F06_UNEXPECTED_PAYMENT, "zero amount"));
        }

        if prepare.expires_at <= Utc::now() {
            return Some(self.reject(origin, ErrorCode::R00_TRANSFER_TIMED_OUT, "already expired"));
        }

        if self.is_local(&prepare.destination) {
            return Some(self.deliver_local(origin, prepare).await);
        }

        let key = (origin.to_string(), origin_request);
        let duplicate = self
            .in_flight
            .lock()
            .get(&key)
            .map(|it| (it.accepted_at, it.deadline, it.execution_condition));

        if let Some((accepted_at, deadline, condition)) = duplicate {
            log::error!(
                "duplicate request id: peer={}, request={}, accepted_at={}, deadline={}, same_packet={}",
                origin,
                origin_request,
                accepted_at,
                deadline,
                condition == prepare.execution_condition
            );
            return Some(self.reject(origin, ErrorCode::T00_INTERNAL_ERROR, "duplicate request id"));
        }

        if !self.window_admit(&prepare) {
            self.observer.loop_detected(origin, &prepare);
            log::warn!(
                "routing loop suspected: peer={}, destination={}",
                origin,
                prepare.destination
            );
            return Some(self.reject(origin, ErrorCode::T03_INTERNAL_ERROR, "routing loop detected"));
        }

        let route = self.routing.lookup(&prepare.destination);
        self.observer
            .route_lookup(&prepare, route.as_ref().map(|it| it.next_hop.as_str()));

        let route = match route {
            Some(route) => route,
            None => return Some(self.reject(origin, ErrorCode::F02_UNREACHABLE, "no route to destination")),
        };

        if route.next_hop == origin {
            return Some(self.reject(origin, ErrorCode::F02_UNREACHABLE, "refusing to reflect"));
        }

        let packet_ref = PacketRef(self.sequence.fetch_add(1, Ordering::Relaxed));
        if self
            .gate
            .reserve(&route.next_hop, prepare.amount, packet_ref)
            .await
            .is_err()
        {
            self.gate
                .commit(packet_ref, Outcome::Rejected(ErrorCode::T04_INSUFFICIENT_LIQUIDITY))
                .await;

            return Some(self.reject(
                origin,
                ErrorCode::T04_INSUFFICIENT_LIQUIDITY,
                "insufficient liquidity",
            ));
        }

        let now = Utc::now();
        let headroom = chrono::Duration::from_std(self.options.headroom)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let max_wait = chrono::Duration::from_std(self.options.max_response_wait)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let deadline = (prepare.expires_at - headroom).min(now + max_wait);
        if deadline <= now {
            self.gate
                .commit(packet_ref, Outcome::Rejected(ErrorCode::R00_TRANSFER_TIMED_OUT))
                .await;

            return Some(self.reject(origin, ErrorCode::R00_TRANSFER_TIMED_OUT, "expiry too tight"));
        }

        self.in_flight.lock().insert(
            key.clone(),
            InFlight {
                accepted_at: now,
                deadline,
                execution_condition: prepare.execution_condition,
            },
        );

        self.observer.prepare_forwarded(&route.next_hop, &prepare);

        let mut forward = Box::pin(self.forwarder.forward(
            &route.next_hop,
            raw.clone(),
            prepare.expires_at,
        ));

        let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        let arm = tokio::select! {
            response = &mut forward => Wait::Response(response),
            _ = tokio::time::sleep(wait) => Wait::Deadline,
            _ = origin_closed.wait_for(|closed| *closed) => Wait::OriginGone,
        };

        // Whichever arm resolved first owns the terminal transition;
        // the entry is gone before commit and response delivery.
        self.in_flight.lock().remove(&key);

        match arm {
            Wait::Response(Ok(bytes)) => {
                self.settle_response(origin, &route.next_hop, &prepare, packet_ref, bytes)
                    .await
            }
            Wait::Response(Err(err)) => {
                let code = match err {
                    ForwardError::Unreachable | ForwardError::Disconnected => {
                        ErrorCode::T01_PEER_UNREACHABLE
                    }
                    ForwardError::TimedOut => ErrorCode::R00_TRANSFER_TIMED_OUT,
                };

                self.gate.commit(packet_ref, Outcome::Rejected(code)).await;
                Some(self.reject(origin, code, "next hop unavailable"))
            }
            Wait::Deadline => {
                // The originator gets its timeout now; the downstream
                // leg stays alive until packet expiry so a late fulfill
                // is still credited to accounting.
                let gate = self.gate.clone();
                let condition = prepare.execution_condition;
                tokio::spawn(async move {
                    let outcome = match forward.await {
                        Ok(bytes) => match Packet::parse(&bytes) {
                            Ok(Packet::Fulfill(fulfill))
                                if condition_matches(&fulfill.fulfillment, &condition) =>
                            {
                                Outcome::Fulfilled
                            }
                            _ => Outcome::Rejected(ErrorCode::R00_TRANSFER_TIMED_OUT),
                        },
                        Err(_) => Outcome::Rejected(ErrorCode::R00_TRANSFER_TIMED_OUT),
                    };

                    gate.commit(packet_ref, outcome).await;
                });

                Some(self.reject(origin, ErrorCode::R00_TRANSFER_TIMED_OUT, "transfer timed out"))
            }
            Wait::OriginGone => {
                self.gate.commit(packet_ref, Outcome::OriginatorGone).await;
                None
            }
        }
    }

    /// Number of packets awaiting a response.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    async fn settle_response(
        &self,
        origin: &str,
        next_hop: &str,
        prepare: &Prepare,
        packet_ref: PacketRef,
        bytes: Bytes,
    ) -> Option<Bytes> {
        let packet = match Packet::parse(&bytes) {
            Ok(Packet::Prepare(_)) | Err(_) => {
                self.gate
                    .commit(packet_ref, Outcome::Rejected(ErrorCode::T00_INTERNAL_ERROR))
                    .await;

                return Some(self.reject(
                    origin,
                    ErrorCode::T00_INTERNAL_ERROR,
                    "invalid response from next hop",
                ));
            }
            Ok(packet) => packet,
        };

        self.observer.response_received(next_hop, &packet);

        match &packet {
            Packet::Fulfill(fulfill) => {
                if !condition_matches(&fulfill.fulfillment, &prepare.execution_condition) {
                    self.gate
                        .commit(packet_ref, Outcome::Rejected(ErrorCode::F05_WRONG_CONDITION))
                        .await;

                    return Some(self.reject(
                        origin,
                        ErrorCode::F05_WRONG_CONDITION,
                        "fulfillment does not match condition",
                    ));
                }

                self.gate.commit(packet_ref, Outcome::Fulfilled).await;
            }
            Packet::Reject(reject) => {
                self.gate
                    .commit(packet_ref, Outcome::Rejected(reject.code))
                    .await;
            }
            Packet::Prepare(_) => unreachable!(),
        }

        // Forwarded unchanged so `triggeredBy` is preserved.
        self.observer.response_delivered(origin, &packet);
        Some(bytes)
    }

    /// Local delivery hands the packet to the injected handler and
    /// returns whatever it answers; condition verification is the
    /// burden of every forwarder on the way back.
    async fn deliver_local(&self, origin: &str, prepare: Prepare) -> Bytes {
        match self.local.deliver(prepare).await {
            Some(packet) => self.deliver(origin, packet),
            None => self.reject(origin, ErrorCode::F02_UNREACHABLE, "no local handler"),
        }
    }

    fn is_local(&self, destination: &Address) -> bool {
        let own = self.options.self_address.as_bytes();
        if destination.as_bytes() == own {
            return true;
        }

        destination.starts_with(own) && destination.as_bytes().get(own.len()) == Some(&b'.')
    }

    /// Admits a packet into the correlation window, or reports a loop.
    fn window_admit(&self, prepare: &Prepare) -> bool {
        let now = Utc::now();
        let mut window = self.window.lock();
        if window.len() >= WINDOW_PRUNE_LEN {
            window.retain(|_, it| it.expires_at > now);
        }

        let entry = window
            .entry(prepare.execution_condition)
            .or_insert(WindowEntry {
                count: 0,
                expires_at: prepare.expires_at,
            });

        if entry.expires_at <= now {
            entry.count = 0;
        }

        entry.expires_at = entry.expires_at.max(prepare.expires_at);
        entry.count += 1;
        entry.count <= self.options.max_reentries
    }

    fn deliver(&self, origin: &str, packet: Packet) -> Bytes {
        self.observer.response_delivered(origin, &packet);
        packet.to_bytes()
    }

    fn reject(&self, origin: &str, code: ErrorCode, message: &str) -> Bytes {
        self.deliver(
            origin,
            Packet::Reject(Reject::new(
                code,
                self.options.self_address.clone(),
                message,
            )),
        )
    }
}
