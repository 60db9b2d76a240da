use codec::packet::{Packet, Prepare};
use service::Observer;

use crate::{
    monitor::{MonitorActor, Stats},
    telemetry::{EventBody, Telemetry},
};

/// Translates router callbacks into telemetry events, log lines and
/// per-peer counters.
pub struct ConnectorObserver {
    telemetry: Telemetry,
    monitor: MonitorActor,
}

impl ConnectorObserver {
    pub fn new(telemetry: Telemetry, monitor: MonitorActor) -> Self {
        Self { telemetry, monitor }
    }
}

fn response_fields(packet: &Packet) -> (&'static str, Option<String>) {
    match packet {
        Packet::Prepare(_) => ("prepare", None),
        Packet::Fulfill(_) => ("fulfill", None),
        Packet::Reject(reject) => ("reject", Some(reject.code.to_string())),
    }
}

fn prepare_len(prepare: &Prepare) -> usize {
    Packet::Prepare(prepare.clone()).to_bytes().len()
}

impl Observer for ConnectorObserver {
    fn prepare_received(&self, peer: &str, prepare: &Prepare) {
        log::debug!(
            "prepare received: peer={}, destination={}, amount={}",
            peer,
            prepare.destination,
            prepare.amount
        );

        self.monitor.send(
            peer,
            &[
                Stats::ReceivedPkts(1),
                Stats::ReceivedBytes(prepare_len(prepare)),
            ],
        );

        self.telemetry.emit(EventBody::PacketReceived {
            peer: peer.to_string(),
            packet: "prepare",
            amount: Some(prepare.amount),
            destination: Some(prepare.destination.to_string()),
            code: None,
        });
    }

    fn route_lookup(&self, prepare: &Prepare, next_hop: Option<&str>) {
        log::debug!(
            "route lookup: destination={}, next_hop={:?}",
            prepare.destination,
            next_hop
        );

        self.telemetry.emit(EventBody::RouteLookup {
            destination: prepare.destination.to_string(),
            next_hop: next_hop.map(|it| it.to_string()),
        });
    }

    fn prepare_forwarded(&self, peer: &str, prepare: &Prepare) {
        self.monitor.send(
            peer,
            &[Stats::SendPkts(1), Stats::SendBytes(prepare_len(prepare))],
        );

        self.telemetry.emit(EventBody::PacketSent {
            peer: peer.to_string(),
            packet: "prepare",
            amount: Some(prepare.amount),
            destination: Some(prepare.destination.to_string()),
            code: None,
        });
    }

    fn response_received(&self, peer: &str, packet: &Packet) {
        let (kind, code) = response_fields(packet);
        let outcome = match packet {
            Packet::Fulfill(_) => Stats::Fulfills(1),
            _ => Stats::Rejects(1),
        };

        self.monitor.send(
            peer,
            &[
                Stats::ReceivedPkts(1),
                Stats::ReceivedBytes(packet.to_bytes().len()),
                outcome,
            ],
        );

        self.telemetry.emit(EventBody::PacketReceived {
            peer: peer.to_string(),
            packet: kind,
            amount: None,
            destination: None,
            code,
        });
    }

    fn response_delivered(&self, peer: &str, packet: &Packet) {
        let (kind, code) = response_fields(packet);
        if let Some(code) = &code {
            log::debug!("reject delivered: peer={}, code={}", peer, code);
        }

        self.monitor.send(
            peer,
            &[
                Stats::SendPkts(1),
                Stats::SendBytes(packet.to_bytes().len()),
            ],
        );

        self.telemetry.emit(EventBody::PacketSent {
            peer: peer.to_string(),
            packet: kind,
            amount: None,
            destination: None,
            code,
        });
    }

    fn loop_detected(&self, peer: &str, prepare: &Prepare) {
        log::warn!(
            "routing loop: peer={}, destination={}",
            peer,
            prepare.destination
        );

        self.telemetry.emit(EventBody::Log {
            level: "warn",
            event: "routing_loop",
            message: format!(
                "packet for {} re-entered via {}",
                prepare.destination, peer
            ),
        });
    }
}
