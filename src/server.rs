use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use codec::btp::{Frame, PROTOCOL_AUTH_TOKEN, PROTOCOL_AUTH_USERNAME, SessionError};
use service::{AccountingGate, LocalHandler};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::timeout,
};

use crate::{Connector, ConnectorHandler, peers::install_session, session};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the BTP listener and starts accepting inbound peers.
pub async fn run<G, L>(
    connector: Arc<Connector<G, L>>,
    handler: Arc<ConnectorHandler<G, L>>,
) -> anyhow::Result<()>
where
    G: AccountingGate,
    L: LocalHandler,
{
    let listener = TcpListener::bind(connector.config.server.listen).await?;
    log::info!("connector listening: addr={}", connector.config.server.listen);

    tokio::spawn(accept_loop(listener, connector, handler));
    Ok(())
}

async fn accept_loop<G, L>(
    listener: TcpListener,
    connector: Arc<Connector<G, L>>,
    handler: Arc<ConnectorHandler<G, L>>,
) where
    G: AccountingGate,
    L: LocalHandler,
{
    let local_addr = listener
        .local_addr()
        .expect("get tcp listener local addr failed!");

    while let Ok((stream, addr)) = listener.accept().await {
        log::info!("socket accept: addr={:?}, interface={:?}", addr, local_addr);
        tokio::spawn(handle_inbound(stream, addr, connector.clone(), handler.clone()));
    }

    log::error!("server close: interface={:?}", local_addr);
}

/// Runs the authentication handshake and installs the session.
///
/// The first frame must be a `Message` carrying `auth`, `auth_username`
/// and `auth_token` sub-payloads; the claimed peer id selects the
/// expected shared secret. Anything else closes the connection with
/// `AuthenticationFailed`.
async fn handle_inbound<G, L>(
    mut stream: TcpStream,
    addr: SocketAddr,
    connector: Arc<Connector<G, L>>,
    handler: Arc<ConnectorHandler<G, L>>,
) where
    G: AccountingGate,
    L: LocalHandler,
{
    let mut buf = BytesMut::new();
    let frame = match timeout(HANDSHAKE_TIMEOUT, session::read_frame(&mut stream, &mut buf)).await {
        Ok(Ok(frame)) => frame,
        _ => {
            log::warn!("handshake never arrived: addr={:?}", addr);
            return;
        }
    };

    let claimed = frame
        .get(PROTOCOL_AUTH_USERNAME)
        .and_then(|it| std::str::from_utf8(&it.content).ok())
        .map(|it| it.to_string());

    let authenticated = frame.is_auth()
        && match (&claimed, frame.get(PROTOCOL_AUTH_TOKEN)) {
            (Some(claimed), Some(token)) => connector
                .registry
                .auth_token(claimed)
                .map(|expected| expected == token.content)
                .unwrap_or(false),
            _ => false,
        };

    if !authenticated {
        log::warn!(
            "authentication failed: addr={:?}, claimed={:?}",
            addr,
            claimed
        );

        let error = Frame::error(
            frame.request_id,
            SessionError::AuthenticationFailed,
            "invalid credentials",
        );

        let _ = stream.write_all(&error.to_bytes()).await;
        return;
    }

    let Some(peer) = claimed else {
        return;
    };

    log::info!("peer authenticated: addr={:?}, peer={}", addr, peer);

    let session = session::Session::spawn(&peer, stream, buf, handler);
    session.send(&Frame::empty_response(frame.request_id));
    install_session(&connector, &peer, session);
}
