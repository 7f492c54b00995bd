use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mirror_transport::relay::{RejectReason, RelayFrame};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayServerConfig;

/// Registered peers: address -> outbound frame queue of its socket.
#[derive(Clone, Default)]
pub struct RelayState {
    peers: Arc<DashMap<String, mpsc::UnboundedSender<RelayFrame>>>,
    key: Option<Arc<str>>,
}

impl RelayState {
    pub fn new(key: Option<String>) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            key: key.map(Arc::from),
        }
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn accepts_key(&self, provided: Option<&str>) -> bool {
        match &self.key {
            Some(expected) => provided == Some(expected.as_ref()),
            None => true,
        }
    }

    fn deliver(&self, address: &str, frame: RelayFrame) -> bool {
        match self.peers.get(address) {
            Some(peer) => peer.send(frame).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PeerQuery {
    key: Option<String>,
}

pub fn router(state: RelayState, config: &RelayServerConfig) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(&config.peer_route(), get(peer_socket))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Runs the relay on an already bound listener until the server fails.
pub async fn serve(listener: TcpListener, config: RelayServerConfig) -> anyhow::Result<()> {
    let state = RelayState::new(config.key.clone());
    let app = router(state, &config);
    info!(
        target = "mirror.relay",
        addr = %listener.local_addr()?,
        route = %config.peer_route(),
        "relay listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn peer_socket(
    ws: WebSocketUpgrade,
    Path(address): Path<String>,
    Query(query): Query<PeerQuery>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, address, query.key, state))
}

async fn handle_socket(socket: WebSocket, address: String, key: Option<String>, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    if !state.accepts_key(key.as_deref()) {
        warn!(target = "mirror.relay", %address, "rejecting peer with bad key");
        let _ = tx.send(RelayFrame::Rejected {
            reason: RejectReason::BadKey,
        });
        drop(tx);
        let _ = writer.await;
        return;
    }

    let registered = match state.peers.entry(address.clone()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(tx.clone());
            true
        }
    };
    if !registered {
        warn!(target = "mirror.relay", %address, "address already bound");
        let _ = tx.send(RelayFrame::Rejected {
            reason: RejectReason::AddressInUse,
        });
        drop(tx);
        let _ = writer.await;
        return;
    }
    let _ = tx.send(RelayFrame::Welcome {
        address: address.clone(),
    });
    info!(target = "mirror.relay", %address, "peer registered");

    // (remote, conn) pairs this socket took part in, closed when it leaves.
    let mut links: HashSet<(String, String)> = HashSet::new();
    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(target = "mirror.relay", %address, error = %err, "socket error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<RelayFrame>(&text) {
                Ok(frame) => route(&state, &address, frame, &tx, &mut links),
                Err(err) => {
                    warn!(target = "mirror.relay", %address, error = %err, "malformed frame");
                    let _ = tx.send(RelayFrame::Error {
                        message: format!("malformed frame: {err}"),
                    });
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state
        .peers
        .remove_if(&address, |_, registered| registered.same_channel(&tx));
    for (remote, conn) in links {
        state.deliver(
            &remote,
            RelayFrame::Close {
                src: address.clone(),
                dst: remote.clone(),
                conn,
            },
        );
    }
    drop(tx);
    let _ = writer.await;
    info!(target = "mirror.relay", %address, "peer left");
}

fn route(
    state: &RelayState,
    from: &str,
    mut frame: RelayFrame,
    reply: &mpsc::UnboundedSender<RelayFrame>,
    links: &mut HashSet<(String, String)>,
) {
    let (Some(dst), Some(conn)) = (
        frame.destination().map(str::to_owned),
        frame.connection_id().map(str::to_owned),
    ) else {
        let _ = reply.send(RelayFrame::Error {
            message: "peers may only send offer, accept, data or close".into(),
        });
        return;
    };
    frame.set_source(from);

    let closing = matches!(frame, RelayFrame::Close { .. });
    if closing {
        links.remove(&(dst.clone(), conn.clone()));
    } else if matches!(frame, RelayFrame::Offer { .. } | RelayFrame::Accept { .. }) {
        links.insert((dst.clone(), conn.clone()));
    }

    if !state.deliver(&dst, frame) && !closing {
        debug!(target = "mirror.relay", %from, %dst, %conn, "destination unavailable");
        let _ = reply.send(RelayFrame::Unavailable { dst, conn });
    }
}
