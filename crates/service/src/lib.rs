//! Connector service logic: the routing table, the peer-registry state
//! and the packet-router state machine, all decoupled from any socket.
//!
//! The transport layer plugs in through three seams:
//!
//! - [`Forwarder`] sends an encoded `Prepare` toward a peer and resolves
//!   with the raw response,
//! - [`AccountingGate`] reserves and commits liquidity around every
//!   forwarded packet,
//! - [`Observer`] receives the router's lifecycle callbacks for
//!   telemetry and logging.
//!
//! All three are injected at construction; test doubles live in the
//! router's test module.

pub mod registry;
pub mod router;
pub mod routing;

use codec::packet::{ErrorCode, Packet, Prepare};

pub type PeerId = String;

/// Unique per-packet handle the accounting gate correlates `reserve`
/// and `commit` calls with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketRef(pub u64);

/// Terminal outcome reported to the accounting gate, exactly once per
/// reserved packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fulfilled,
    Rejected(ErrorCode),
    /// The originating session closed before a response could be
    /// delivered; the downstream leg was abandoned.
    OriginatorGone,
}

/// Refusal from the accounting gate, surfaced as `T04`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityError;

impl std::error::Error for LiquidityError {}

impl std::fmt::Display for LiquidityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "insufficient liquidity")
    }
}

/// Credit gate consulted before every forward.
///
/// The router guarantees `reserve` happens-before `commit` for one
/// packet, and that `commit` is called exactly once for every packet
/// that was reserved, whatever the terminal state.
pub trait AccountingGate: Send + Sync + 'static {
    fn reserve(
        &self,
        peer: &str,
        amount: u64,
        packet: PacketRef,
    ) -> impl Future<Output = Result<(), LiquidityError>> + Send;

    fn commit(&self, packet: PacketRef, outcome: Outcome) -> impl Future<Output = ()> + Send;
}

/// Accepts everything, records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGate;

impl AccountingGate for NoopGate {
    async fn reserve(&self, _: &str, _: u64, _: PacketRef) -> Result<(), LiquidityError> {
        Ok(())
    }

    async fn commit(&self, _: PacketRef, _: Outcome) {}
}

/// Handler for packets addressed to this node itself.
pub trait LocalHandler: Send + Sync + 'static {
    /// Returns the response packet, or `None` when local delivery is
    /// not available for this destination.
    fn deliver(&self, prepare: Prepare) -> impl Future<Output = Option<Packet>> + Send;
}

/// Default: no local delivery, local destinations are unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocalDelivery;

impl LocalHandler for NoLocalDelivery {
    async fn deliver(&self, _: Prepare) -> Option<Packet> {
        None
    }
}

/// Router lifecycle callbacks.
///
/// Called synchronously from the routing path; implementations must not
/// block. For one forwarded packet the order is: `prepare_received`,
/// `route_lookup`, `prepare_forwarded`, `response_received`,
/// `response_delivered`.
pub trait Observer: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn prepare_received(&self, peer: &str, prepare: &Prepare) {}

    #[allow(unused_variables)]
    fn route_lookup(&self, prepare: &Prepare, next_hop: Option<&str>) {}

    #[allow(unused_variables)]
    fn prepare_forwarded(&self, peer: &str, prepare: &Prepare) {}

    #[allow(unused_variables)]
    fn response_received(&self, peer: &str, packet: &Packet) {}

    #[allow(unused_variables)]
    fn response_delivered(&self, peer: &str, packet: &Packet) {}

    /// A packet's correlation id re-entered the router beyond the
    /// configured ceiling.
    #[allow(unused_variables)]
    fn loop_detected(&self, peer: &str, prepare: &Prepare) {}
}

/// Observer that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}
