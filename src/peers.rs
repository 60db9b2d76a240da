use std::{sync::Arc, time::Duration};

use anyhow::{Context, bail};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use codec::btp::{Frame, FrameType, PROTOCOL_ILP, SessionError};
use rand::Rng;
use service::{
    AccountingGate, LocalHandler,
    registry::{Registry, SessionState},
    router::{ForwardError, Forwarder},
};
use tokio::{net::TcpStream, time::timeout};

use crate::{
    Connector, ConnectorHandler, config,
    session::{RequestError, Session},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Full-jitter exponential backoff, 1 s base, 30 s cap.
pub(crate) fn backoff(failures: u32) -> Duration {
    const BASE_MS: u64 = 1_000;
    const CAP_MS: u64 = 30_000;

    let ceiling = BASE_MS.saturating_mul(1u64 << failures.min(5)).min(CAP_MS);
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}

/// Resolves the next hop through the registry at send time, so a
/// replaced session is picked up transparently.
#[derive(Clone)]
pub struct SessionForwarder {
    registry: Arc<Registry<Session>>,
}

impl SessionForwarder {
    pub fn new(registry: Arc<Registry<Session>>) -> Self {
        Self { registry }
    }
}

impl Forwarder for SessionForwarder {
    fn forward(
        &self,
        peer: &str,
        packet: Bytes,
        expires_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Bytes, ForwardError>> + Send + 'static {
        let session = self.registry.lookup(peer);
        async move {
            let session = session.ok_or(ForwardError::Unreachable)?;
            let wait = (expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            let frame = session.request(packet, wait).await.map_err(|err| match err {
                RequestError::PeerDisconnected => ForwardError::Disconnected,
                RequestError::TimedOut => ForwardError::TimedOut,
            })?;

            match frame.kind {
                // A response without an ilp payload decodes to nothing
                // and is rejected upstream as an invalid response.
                FrameType::Response => Ok(frame
                    .get(PROTOCOL_ILP)
                    .map(|it| it.content.clone())
                    .unwrap_or_default()),
                _ => Err(ForwardError::Disconnected),
            }
        }
    }
}

/// Makes `session` the peer's live session, closing a displaced one
/// with `SessionReplaced`, and arranges the registry cleanup for when
/// it dies.
pub(crate) fn install_session<G, L>(
    connector: &Arc<Connector<G, L>>,
    peer: &str,
    session: Session,
) where
    G: AccountingGate,
    L: LocalHandler,
{
    match connector.registry.install(peer, session.clone()) {
        Ok(Some(displaced)) if !displaced.same(&session) => {
            log::info!("session replaced: peer={}", peer);
            displaced.close(Some((
                SessionError::SessionReplaced,
                "a newer session took over",
            )));
        }
        Ok(_) => {}
        Err(_) => {
            session.close(Some((SessionError::SessionRemoved, "peer not configured")));
            return;
        }
    }

    log::info!("session ready: peer={}", peer);

    let connector = connector.clone();
    let peer = peer.to_string();
    tokio::spawn(async move {
        session.wait_closed().await;

        // Only clear the slot if this session is still the one
        // installed; a replacement may already own it.
        let current = connector
            .registry
            .lookup(&peer)
            .map(|it| it.same(&session))
            .unwrap_or(false);

        if current {
            connector.registry.set_state(&peer, SessionState::Closed);
        }
    });
}

/// Owns one outbound peer: connects, authenticates, installs the
/// session, and reconnects with backoff until the peer is removed.
pub(crate) fn spawn_outbound<G, L>(
    connector: Arc<Connector<G, L>>,
    handler: Arc<ConnectorHandler<G, L>>,
    peer: config::Peer,
) where
    G: AccountingGate,
    L: LocalHandler,
{
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            if connector.registry.config(&peer.id).is_none() {
                log::info!("outbound peer removed: peer={}", peer.id);
                break;
            }

            match connect(&connector, &handler, &peer).await {
                Ok(session) => {
                    failures = 0;
                    install_session(&connector, &peer.id, session.clone());
                    session.wait_closed().await;
                    log::warn!("outbound session lost: peer={}", peer.id);
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    connector.registry.set_state(&peer.id, SessionState::Closed);
                    log::warn!("outbound connect failed: peer={}, err={}", peer.id, err);
                }
            }

            tokio::time::sleep(backoff(failures)).await;
        }
    });
}

async fn connect<G, L>(
    connector: &Arc<Connector<G, L>>,
    handler: &Arc<ConnectorHandler<G, L>>,
    peer: &config::Peer,
) -> anyhow::Result<Session>
where
    G: AccountingGate,
    L: LocalHandler,
{
    let endpoint = peer.endpoint.as_ref().context("peer has no endpoint")?;

    connector
        .registry
        .set_state(&peer.id, SessionState::Connecting);

    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint))
        .await
        .context("connect timed out")??;

    connector
        .registry
        .set_state(&peer.id, SessionState::Authenticating);

    let session = Session::spawn(&peer.id, stream, BytesMut::new(), handler.clone());
    let username = connector.config.node.id.clone();
    let token = peer.auth_token.clone();

    let reply = session
        .request_with(
            move |id| Frame::auth(id, &username, token.as_bytes()),
            AUTH_TIMEOUT,
        )
        .await;

    match reply {
        Ok(frame) if frame.kind == FrameType::Response => Ok(session),
        Ok(frame) => {
            session.close(None);
            bail!("authentication rejected: {:?}", frame.session_error());
        }
        Err(err) => {
            session.close(None);
            bail!("authentication failed: {:?}", err);
        }
    }
}
