use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::sleep,
};

use ilp_connector::{
    Connector, config,
    monitor::Health,
    session::{FrameHandler, Session},
    startup,
};

use ilp_connector::codec::{
    btp::{Frame, FrameType, PROTOCOL_ILP, SessionError},
    condition::fulfillment_to_condition,
    packet::{Address, ErrorCode, Fulfill, Packet, Prepare},
};

use ilp_connector::service::{LocalHandler, NoLocalDelivery, NoopGate};

struct Quiet;

impl FrameHandler for Quiet {
    fn on_message(
        &self,
        _: &str,
        _: Frame,
        _: watch::Receiver<bool>,
    ) -> impl Future<Output = Option<Frame>> + Send + 'static {
        async move { None }
    }
}

/// Terminal node behavior: release the given preimage for every local
/// delivery.
#[derive(Clone)]
struct Fulfiller([u8; 32]);

impl LocalHandler for Fulfiller {
    async fn deliver(&self, _: Prepare) -> Option<Packet> {
        Some(Packet::Fulfill(Fulfill {
            fulfillment: self.0,
            data: Bytes::new(),
        }))
    }
}

/// Terminal node behavior: accept the packet and never answer.
struct Silent;

impl LocalHandler for Silent {
    async fn deliver(&self, _: Prepare) -> Option<Packet> {
        std::future::pending().await
    }
}

fn inbound_peer(id: &str, token: &str) -> config::Peer {
    config::Peer {
        id: id.to_string(),
        direction: config::Direction::Inbound,
        endpoint: None,
        auth_token: token.to_string(),
        prefixes: vec![],
    }
}

fn outbound_peer(id: &str, port: u16, token: &str) -> config::Peer {
    config::Peer {
        id: id.to_string(),
        direction: config::Direction::Outbound,
        endpoint: Some(format!("127.0.0.1:{}", port)),
        auth_token: token.to_string(),
        prefixes: vec![],
    }
}

fn route(prefix: &str, next_hop: &str) -> config::Route {
    config::Route {
        prefix: prefix.to_string(),
        next_hop: next_hop.to_string(),
        priority: 0,
    }
}

fn node_config(
    id: &str,
    address: &str,
    port: u16,
    peers: Vec<config::Peer>,
    routes: Vec<config::Route>,
) -> Arc<config::Config> {
    Arc::new(config::Config {
        node: config::Node {
            id: id.to_string(),
            address: address.to_string(),
        },
        server: config::Server {
            listen: format!("127.0.0.1:{}", port).parse().unwrap(),
        },
        peers,
        routes,
        telemetry: config::Telemetry {
            endpoint: None,
            capacity: 10_000,
            // Quiet during tests; packet events are what we look at.
            status_interval: 3_600,
        },
        router: config::Router::default(),
        log: config::Log::default(),
    })
}

async fn connect_client(port: u16, username: &str, token: &str) -> Session {
    let stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let session = Session::spawn("server", stream, BytesMut::new(), Arc::new(Quiet));
    let reply = session
        .request_with(
            |id| Frame::auth(id, username, token.as_bytes()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(reply.kind, FrameType::Response);
    session
}

fn prepare_bytes(destination: &str, condition: [u8; 32], amount: u64, expires_in: Duration) -> Bytes {
    Packet::Prepare(Prepare {
        amount,
        expires_at: Utc::now() + chrono::Duration::from_std(expires_in).unwrap(),
        execution_condition: condition,
        destination: Address::new(destination).unwrap(),
        data: Bytes::from_static(b"payload"),
    })
    .to_bytes()
}

async fn send_prepare(session: &Session, bytes: Bytes) -> Packet {
    let frame = session
        .request(bytes, Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(frame.kind, FrameType::Response);
    Packet::parse(&frame.get(PROTOCOL_ILP).unwrap().content).unwrap()
}

fn assert_reject(packet: Packet, code: ErrorCode) -> ilp_connector::codec::packet::Reject {
    match packet {
        Packet::Reject(reject) => {
            assert_eq!(reject.code, code, "unexpected code: {}", reject.message);
            reject
        }
        other => panic!("expected a reject, got {:?}", other),
    }
}

/// Brings up the client → a → b → c chain used by the multi-hop tests.
/// `c` serves local deliveries with the given handler.
async fn three_nodes<L: LocalHandler>(base: u16, terminal: L) {
    let c = node_config(
        "c",
        "g.node-c",
        base + 2,
        vec![inbound_peer("b", "token-bc")],
        vec![],
    );
    startup(c, NoopGate, terminal).await.unwrap();

    let b = node_config(
        "b",
        "g.node-b",
        base + 1,
        vec![
            inbound_peer("a", "token-ab"),
            outbound_peer("c", base + 2, "token-bc"),
        ],
        vec![route("g.node-c", "c")],
    );
    startup(b, NoopGate, NoLocalDelivery).await.unwrap();

    let a = node_config(
        "a",
        "g.node-a",
        base,
        vec![
            inbound_peer("client", "token-client"),
            outbound_peer("b", base + 1, "token-ab"),
        ],
        vec![route("g.node-c", "b")],
    );
    startup(a, NoopGate, NoLocalDelivery).await.unwrap();

    // Give the outbound maintainers one jittered backoff round to come
    // up ready.
    sleep(Duration::from_millis(1_500)).await;
}

#[tokio::test]
async fn three_hop_fulfill() {
    let fulfillment = [7u8; 32];
    three_nodes(40710, Fulfiller(fulfillment)).await;

    let client = connect_client(40710, "client", "token-client").await;
    let response = send_prepare(
        &client,
        prepare_bytes(
            "g.node-c.shop",
            fulfillment_to_condition(&fulfillment),
            1_000,
            Duration::from_secs(10),
        ),
    )
    .await;

    match response {
        Packet::Fulfill(fulfill) => assert_eq!(fulfill.fulfillment, fulfillment),
        other => panic!("expected a fulfill, got {:?}", other),
    }
}

#[tokio::test]
async fn unhandled_local_destination_yields_f02() {
    three_nodes(40720, NoLocalDelivery).await;

    // c has no local handler, so this destination dies at c with F02.
    let client = connect_client(40720, "client", "token-client").await;
    let response = send_prepare(
        &client,
        prepare_bytes("g.node-c.shop", [1u8; 32], 10, Duration::from_secs(10)),
    )
    .await;

    assert_reject(response, ErrorCode::F02_UNREACHABLE);
}

#[tokio::test]
async fn silent_terminal_times_out_with_r00() {
    three_nodes(40730, Silent).await;

    let client = connect_client(40730, "client", "token-client").await;
    let response = send_prepare(
        &client,
        prepare_bytes("g.node-c.shop", [1u8; 32], 10, Duration::from_secs(4)),
    )
    .await;

    assert_reject(response, ErrorCode::R00_TRANSFER_TIMED_OUT);
}

#[tokio::test]
async fn wrong_condition_yields_f05_from_the_verifying_hop() {
    // The terminal releases a preimage that does not hash to the
    // condition the client asked for.
    three_nodes(40740, Fulfiller([9u8; 32])).await;

    let client = connect_client(40740, "client", "token-client").await;
    let response = send_prepare(
        &client,
        prepare_bytes("g.node-c.shop", [1u8; 32], 10, Duration::from_secs(10)),
    )
    .await;

    let reject = assert_reject(response, ErrorCode::F05_WRONG_CONDITION);
    // b is the first forwarder to verify the fulfillment.
    assert_eq!(reject.triggered_by, Address::new("g.node-b").unwrap());
}

#[tokio::test]
async fn reflection_yields_f02_without_forwarding() {
    let a = node_config(
        "a",
        "g.node-a",
        40750,
        vec![inbound_peer("client", "token-client")],
        vec![route("g.reflect", "client")],
    );
    startup(a, NoopGate, NoLocalDelivery).await.unwrap();

    let client = connect_client(40750, "client", "token-client").await;
    let response = send_prepare(
        &client,
        prepare_bytes("g.reflect.x", [1u8; 32], 10, Duration::from_secs(10)),
    )
    .await;

    let reject = assert_reject(response, ErrorCode::F02_UNREACHABLE);
    assert_eq!(reject.triggered_by, Address::new("g.node-a").unwrap());
}

#[tokio::test]
async fn dead_next_hop_yields_t01() {
    let a = node_config(
        "a",
        "g.node-a",
        40760,
        vec![
            inbound_peer("client", "token-client"),
            // Nothing listens on this port.
            outbound_peer("b", 40769, "token-ab"),
        ],
        vec![route("g.node-c", "b")],
    );
    let connector = startup(a, NoopGate, NoLocalDelivery).await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert_eq!(connector.health(), Health::Unhealthy);

    let client = connect_client(40760, "client", "token-client").await;
    let response = send_prepare(
        &client,
        prepare_bytes("g.node-c.shop", [1u8; 32], 10, Duration::from_secs(10)),
    )
    .await;

    assert_reject(response, ErrorCode::T01_PEER_UNREACHABLE);
}

#[tokio::test]
async fn second_session_replaces_the_first() {
    let a = node_config(
        "a",
        "g.node-a",
        40770,
        vec![inbound_peer("client", "token-client")],
        vec![],
    );
    startup(a, NoopGate, NoLocalDelivery).await.unwrap();

    let first = connect_client(40770, "client", "token-client").await;
    let second = connect_client(40770, "client", "token-client").await;

    first.wait_closed().await;
    assert!(first.is_closed());
    assert!(!second.is_closed());
}

#[tokio::test]
async fn bad_token_is_rejected() {
    let a = node_config(
        "a",
        "g.node-a",
        40780,
        vec![inbound_peer("client", "token-client")],
        vec![],
    );
    startup(a, NoopGate, NoLocalDelivery).await.unwrap();

    let stream = TcpStream::connect("127.0.0.1:40780").await.unwrap();
    let session = Session::spawn("server", stream, BytesMut::new(), Arc::new(Quiet));
    let reply = session
        .request_with(
            |id| Frame::auth(id, "client", b"wrong"),
            Duration::from_secs(5),
        )
        .await;

    match reply {
        Ok(frame) => {
            assert_eq!(frame.kind, FrameType::Error);
            assert_eq!(
                frame.session_error(),
                Some(SessionError::AuthenticationFailed)
            );
        }
        // The server may also close before the error frame is read.
        Err(_) => {}
    }
}

/// Minimal hand-rolled BTP peer used to drop a session mid-flight.
struct StubPeer {
    listener: TcpListener,
}

impl StubPeer {
    async fn bind(port: u16) -> Self {
        Self {
            listener: TcpListener::bind(format!("127.0.0.1:{}", port))
                .await
                .unwrap(),
        }
    }

    /// Accepts one session and authenticates it.
    async fn accept(&self) -> (TcpStream, BytesMut) {
        let (mut stream, _) = self.listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        let auth = read_raw_frame(&mut stream, &mut buf).await;
        assert!(auth.is_auth());

        stream
            .write_all(&Frame::empty_response(auth.request_id).to_bytes())
            .await
            .unwrap();

        (stream, buf)
    }
}

async fn read_raw_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Frame {
    loop {
        if let Some(size) = Frame::message_size(buf).unwrap() {
            let chunk = buf.split_to(size);
            return Frame::decode(&chunk).unwrap();
        }

        assert_ne!(stream.read_buf(buf).await.unwrap(), 0, "peer closed");
    }
}

#[tokio::test]
async fn session_drop_mid_flight_yields_t01_and_reconnect_recovers() {
    let stub = StubPeer::bind(40791).await;

    let a = node_config(
        "a",
        "g.node-a",
        40790,
        vec![
            inbound_peer("client", "token-client"),
            outbound_peer("b", 40791, "token-ab"),
        ],
        vec![route("g.node-c", "b")],
    );
    startup(a, NoopGate, NoLocalDelivery).await.unwrap();

    // First session: swallow the forwarded prepare, then drop the link.
    let (mut stream, mut buf) = stub.accept().await;
    sleep(Duration::from_millis(200)).await;
    let client = connect_client(40790, "client", "token-client").await;

    let fulfillment = [3u8; 32];
    let pending = {
        let client = client.clone();
        let bytes = prepare_bytes(
            "g.node-c.shop",
            fulfillment_to_condition(&fulfillment),
            10,
            Duration::from_secs(10),
        );
        tokio::spawn(async move { send_prepare(&client, bytes).await })
    };

    let forwarded = read_raw_frame(&mut stream, &mut buf).await;
    assert_eq!(forwarded.kind, FrameType::Message);
    drop(stream);

    assert_reject(pending.await.unwrap(), ErrorCode::T01_PEER_UNREACHABLE);

    // The maintainer reconnects; a fresh prepare goes through.
    let (mut stream, mut buf) = stub.accept().await;
    sleep(Duration::from_millis(200)).await;
    let pending = {
        let client = client.clone();
        let bytes = prepare_bytes(
            "g.node-c.shop",
            fulfillment_to_condition(&fulfillment),
            10,
            Duration::from_secs(10),
        );
        tokio::spawn(async move { send_prepare(&client, bytes).await })
    };

    let forwarded = read_raw_frame(&mut stream, &mut buf).await;
    let fulfill = Packet::Fulfill(Fulfill {
        fulfillment,
        data: Bytes::new(),
    });

    stream
        .write_all(&Frame::response(forwarded.request_id, fulfill.to_bytes()).to_bytes())
        .await
        .unwrap();

    match pending.await.unwrap() {
        Packet::Fulfill(received) => assert_eq!(received.fulfillment, fulfillment),
        other => panic!("expected a fulfill, got {:?}", other),
    }
}

/// Captures per-packet frames a connector publishes to its telemetry
/// hub, skipping heartbeats and log events.
async fn collect_packet_events(listener: TcpListener, count: usize) -> Vec<serde_json::Value> {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = BytesMut::new();
    let mut events: Vec<serde_json::Value> = Vec::new();

    while events.len() < count {
        while buf.len() < 4
            || buf.len() < 4 + u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize
        {
            assert_ne!(stream.read_buf(&mut buf).await.unwrap(), 0, "emitter closed");
        }

        let size = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        let chunk = buf.split_to(size + 4);
        let event: serde_json::Value = serde_json::from_slice(&chunk[4..]).unwrap();
        if !matches!(event["type"].as_str(), Some("NodeStatus") | Some("Log")) {
            events.push(event);
        }
    }

    events
}

#[tokio::test]
async fn packet_telemetry_is_emitted_in_order() {
    let hub = TcpListener::bind("127.0.0.1:40801").await.unwrap();
    let collector = tokio::spawn(collect_packet_events(hub, 5));

    let fulfillment = [5u8; 32];
    let terminal = node_config(
        "c",
        "g.node-c",
        40803,
        vec![inbound_peer("a", "token-ac")],
        vec![],
    );
    startup(terminal, NoopGate, Fulfiller(fulfillment)).await.unwrap();

    let mut config = node_config(
        "a",
        "g.node-a",
        40802,
        vec![
            inbound_peer("client", "token-client"),
            outbound_peer("c", 40803, "token-ac"),
        ],
        vec![route("g.node-c", "c")],
    );
    Arc::get_mut(&mut config).unwrap().telemetry.endpoint = Some("127.0.0.1:40801".to_string());
    startup(config, NoopGate, NoLocalDelivery).await.unwrap();
    sleep(Duration::from_millis(1_500)).await;

    let client = connect_client(40802, "client", "token-client").await;
    let response = send_prepare(
        &client,
        prepare_bytes(
            "g.node-c.shop",
            fulfillment_to_condition(&fulfillment),
            42,
            Duration::from_secs(10),
        ),
    )
    .await;
    assert!(matches!(response, Packet::Fulfill(_)));

    let events = collector.await.unwrap();
    let kinds: Vec<&str> = events
        .iter()
        .map(|it| it["type"].as_str().unwrap())
        .collect();

    assert_eq!(
        kinds,
        vec![
            "PacketReceived",
            "RouteLookup",
            "PacketSent",
            "PacketReceived",
            "PacketSent"
        ]
    );

    assert_eq!(events[0]["nodeId"], "a");
    assert_eq!(events[0]["packet"], "prepare");
    assert_eq!(events[0]["amount"], 42);
    assert_eq!(events[1]["nextHop"], "c");
    assert_eq!(events[3]["packet"], "fulfill");
}

#[tokio::test]
async fn connector_with_ready_peers_is_healthy() {
    let fulfillment = [8u8; 32];
    let c: Arc<Connector<NoopGate, Fulfiller>> = {
        let config = node_config(
            "c",
            "g.node-c",
            40811,
            vec![inbound_peer("a", "token-ac")],
            vec![],
        );
        startup(config, NoopGate, Fulfiller(fulfillment)).await.unwrap()
    };

    // No outbound peers configured: vacuously healthy.
    assert_eq!(c.health(), Health::Healthy);

    let a = node_config(
        "a",
        "g.node-a",
        40810,
        vec![outbound_peer("c", 40811, "token-ac")],
        vec![route("g.node-c", "c")],
    );
    let connector = startup(a, NoopGate, NoLocalDelivery).await.unwrap();

    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(connector.health(), Health::Healthy);
}
