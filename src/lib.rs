pub mod config;
pub mod monitor;
pub mod observer;
pub mod peers;
pub mod server;
pub mod session;
pub mod telemetry;

pub use codec;
pub use service;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use codec::{
    btp::{Frame, PROTOCOL_ILP, SessionError},
    packet::Address,
};
use service::{
    AccountingGate, LocalHandler, NoLocalDelivery, NoopGate,
    registry::{Direction, PeerConfig, Registry, SessionState},
    router::{Router, RouterOptions},
    routing::{Route, RoutingTable},
};
use tokio::sync::watch;

use crate::{
    config::Config,
    monitor::{Health, Monitor},
    observer::ConnectorObserver,
    peers::SessionForwarder,
    session::{FrameHandler, Session},
    telemetry::{EventBody, Telemetry},
};

/// One connector node: registry, routing table, router and telemetry,
/// wired from one configuration struct. The accounting gate and the
/// local delivery handler are injected so the settlement subsystem and
/// node-local applications stay external.
pub struct Connector<G: AccountingGate, L: LocalHandler> {
    pub config: Arc<Config>,
    pub registry: Arc<Registry<Session>>,
    pub routing: Arc<RoutingTable>,
    pub router: Router<SessionForwarder, G, L, ConnectorObserver>,
    pub telemetry: Telemetry,
    pub monitor: Monitor,
    running: AtomicBool,
}

impl<G: AccountingGate, L: LocalHandler> Connector<G, L> {
    pub fn new(config: Arc<Config>, gate: G, local: L) -> anyhow::Result<Arc<Self>> {
        let address = Address::new(&config.node.address)
            .map_err(|err| anyhow::anyhow!("invalid node address: {}", err))?;

        let registry = Arc::new(Registry::default());
        let monitor = Monitor::default();
        for peer in &config.peers {
            registry.add_peer(PeerConfig {
                id: peer.id.clone(),
                direction: match peer.direction {
                    config::Direction::Inbound => Direction::Inbound,
                    config::Direction::Outbound => Direction::Outbound,
                },
                endpoint: peer.endpoint.clone(),
                auth_token: Bytes::copy_from_slice(peer.auth_token.as_bytes()),
                declared_prefixes: peer.prefixes.clone(),
            });

            monitor.set(peer.id.clone());
        }

        let routing = Arc::new(RoutingTable::default());
        routing.update(
            config
                .routes
                .iter()
                .map(|it| Route {
                    prefix: it.prefix.as_bytes().to_vec(),
                    next_hop: it.next_hop.clone(),
                    priority: it.priority,
                })
                .collect(),
        );

        let telemetry = Telemetry::new(&config.node.id, &config.telemetry);
        let observer = ConnectorObserver::new(telemetry.clone(), monitor.get_actor());

        let mut options = RouterOptions::new(address);
        options.max_reentries = config.router.max_reentries;
        options.headroom = Duration::from_millis(config.router.headroom_ms);
        options.max_response_wait = Duration::from_millis(config.router.max_response_wait_ms);

        let router = Router::new(
            options,
            routing.clone(),
            SessionForwarder::new(registry.clone()),
            gate,
            local,
            observer,
        );

        Ok(Arc::new(Self {
            config,
            registry,
            routing,
            router,
            telemetry,
            monitor,
            running: AtomicBool::new(false),
        }))
    }

    pub fn health(&self) -> Health {
        if !self.running.load(Ordering::Relaxed) {
            return Health::Starting;
        }

        let (ready, total) = self.registry.outbound_ready();
        if total == 0 || ready * 2 >= total {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }
}

/// Serves inbound `Message` frames on every session: ILP prepares go
/// through the router, auth refreshes are acknowledged, anything else
/// is a session error.
pub struct ConnectorHandler<G: AccountingGate, L: LocalHandler>(Arc<Connector<G, L>>);

impl<G: AccountingGate, L: LocalHandler> ConnectorHandler<G, L> {
    pub fn new(connector: Arc<Connector<G, L>>) -> Self {
        Self(connector)
    }
}

impl<G: AccountingGate, L: LocalHandler> FrameHandler for ConnectorHandler<G, L> {
    fn on_message(
        &self,
        peer: &str,
        frame: Frame,
        closed: watch::Receiver<bool>,
    ) -> impl Future<Output = Option<Frame>> + Send + 'static {
        let connector = self.0.clone();
        let peer = peer.to_string();

        async move {
            connector.registry.touch(&peer);

            if frame.is_auth() {
                return Some(Frame::empty_response(frame.request_id));
            }

            let Some(data) = frame.get(PROTOCOL_ILP) else {
                return Some(Frame::error(
                    frame.request_id,
                    SessionError::InternalError,
                    "unsupported message",
                ));
            };

            let response = connector
                .router
                .route_prepare(&peer, frame.request_id, data.content.clone(), closed)
                .await?;

            Some(Frame::response(frame.request_id, response))
        }
    }
}

/// Builds the connector from `config` and brings the whole node up:
/// the BTP listener, one maintainer task per outbound peer, and the
/// status heartbeat. Returns the running connector, which integration
/// tests drive directly.
pub async fn startup<G, L>(
    config: Arc<Config>,
    gate: G,
    local: L,
) -> anyhow::Result<Arc<Connector<G, L>>>
where
    G: AccountingGate,
    L: LocalHandler,
{
    let connector = Connector::new(config.clone(), gate, local)?;
    let handler = Arc::new(ConnectorHandler::new(connector.clone()));

    server::run(connector.clone(), handler.clone()).await?;

    for peer in &config.peers {
        if peer.direction == config::Direction::Outbound {
            peers::spawn_outbound(connector.clone(), handler.clone(), peer.clone());
        }
    }

    {
        let connector = connector.clone();
        let period = Duration::from_secs(config.telemetry.status_interval.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;

                let statuses = connector.registry.statuses();
                let ready = statuses
                    .iter()
                    .filter(|it| it.state == SessionState::Ready)
                    .count();

                connector.telemetry.emit(EventBody::NodeStatus {
                    status: connector.health().as_str(),
                    peers: statuses.len(),
                    ready_peers: ready,
                });
            }
        });
    }

    connector.running.store(true, Ordering::Relaxed);
    Ok(connector)
}

/// Runs the node until ctrl-c, then drains.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let connector = startup(config, NoopGate, NoLocalDelivery).await?;
    tokio::signal::ctrl_c().await?;

    log::info!("shutting down");
    for status in connector.registry.statuses() {
        if let Some(session) = connector
            .registry
            .set_state(&status.id, SessionState::Draining)
        {
            session.close(None);
        }
    }

    // Bounded grace for the telemetry publisher to flush.
    let started = std::time::Instant::now();
    while connector.telemetry.backlog() > 0 && started.elapsed() < Duration::from_secs(1) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
