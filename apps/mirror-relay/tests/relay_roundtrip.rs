use std::sync::Arc;
use std::time::Duration;

use mirror_proto::{Chunk, Envelope, EventKind, Role, SessionId};
use mirror_relay::{router, RelayServerConfig, RelayState};
use mirror_transport::relay::{RelayConfig, RelayLink};
use mirror_transport::{LinkError, PeerTransport, TransportConfig, TransportError, TransportStatus};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay(key: Option<&str>) -> (RelayConfig, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server_config = RelayServerConfig {
        host: "127.0.0.1".into(),
        port,
        path: "/relay".into(),
        key: key.map(str::to_owned),
    };
    let state = RelayState::new(server_config.key.clone());
    let app = router(state.clone(), &server_config);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let client = RelayConfig {
        host: "127.0.0.1".into(),
        port,
        path: "/relay".into(),
        secure: false,
        key: key.unwrap_or("any").into(),
    };
    (client, state)
}

async fn peer(config: &RelayConfig, session: &SessionId, role: Role) -> PeerTransport {
    let link = RelayLink::connect(config, session.address(role))
        .await
        .expect("relay link");
    PeerTransport::bind(session.clone(), role, Arc::new(link), TransportConfig::default())
        .expect("transport")
}

fn collect(transport: &PeerTransport, kind: EventKind) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.on(kind, move |envelope| {
        let _ = tx.send(envelope.clone());
    });
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("envelope timeout")
        .expect("envelope")
}

#[tokio::test]
async fn envelopes_cross_the_relay_in_order() {
    let (config, state) = start_relay(Some("secret")).await;
    let session = SessionId::new("relay-room");
    let source = peer(&config, &session, Role::Source).await;
    let viewer = peer(&config, &session, Role::Viewer).await;
    assert!(state.is_registered("relay-room-source"));
    assert_eq!(state.peer_count(), 2);

    let mut starts = collect(&source, EventKind::Start);
    let mut records = collect(&viewer, EventKind::RecordEvent);

    viewer.send_start().await.expect("start");
    assert_eq!(recv(&mut starts).await.event, EventKind::Start);

    for id in 0..5 {
        source
            .send_record(&Chunk {
                id,
                data: json!({ "seq": id }),
            })
            .await
            .expect("record");
    }
    for id in 0..5 {
        let chunk: Chunk = recv(&mut records).await.payload_as().unwrap();
        assert_eq!(chunk.id, id);
    }
}

#[tokio::test]
async fn second_bind_to_an_address_is_rejected() {
    let (config, _state) = start_relay(None).await;
    let _first = RelayLink::connect(&config, "dup-source").await.expect("first");
    let err = RelayLink::connect(&config, "dup-source")
        .await
        .err()
        .expect("duplicate rejected");
    assert_eq!(err, LinkError::AddressInUse("dup-source".into()));
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let (mut config, _state) = start_relay(Some("secret")).await;
    config.key = "guess".into();
    let err = RelayLink::connect(&config, "k-viewer")
        .await
        .err()
        .expect("bad key");
    assert!(matches!(err, LinkError::Setup(_)));
}

#[tokio::test]
async fn dialling_an_absent_peer_fails() {
    let (config, _state) = start_relay(None).await;
    let session = SessionId::new("lonely");
    let viewer = peer(&config, &session, Role::Viewer).await;
    let err = viewer.connect().await.expect_err("no source");
    assert!(matches!(err, TransportError::Link(LinkError::Failed(_))));
}

#[tokio::test]
async fn departing_peer_closes_its_connections() {
    let (config, _state) = start_relay(None).await;
    let session = SessionId::new("leave");
    let source = peer(&config, &session, Role::Source).await;
    let viewer = peer(&config, &session, Role::Viewer).await;
    let mut status = source.subscribe_status();

    viewer.connect().await.expect("connect");
    let opened = tokio::time::timeout(WAIT, status.recv()).await.unwrap().unwrap();
    assert!(matches!(opened, TransportStatus::Open { .. }));

    drop(viewer);
    let closed = tokio::time::timeout(WAIT, status.recv()).await.unwrap().unwrap();
    assert_eq!(
        closed,
        TransportStatus::Closed {
            remote: session.address(Role::Viewer)
        }
    );
}
