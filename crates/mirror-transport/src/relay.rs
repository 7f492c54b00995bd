//! [`PeerLink`] over a WebSocket relay.
//!
//! Each link holds one socket to the relay, registered under its address.
//! Logical connections are multiplexed on that socket by connection id: the
//! dialler sends `offer`, the callee answers `accept`, then both sides exchange
//! `data` frames until one of them sends `close`.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::error::LinkError;
use crate::link::{self, ConnectionDriver, LinkState, PeerConnection, PeerLink, close_state};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the relay lives and the shared key it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    pub key: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            path: "/".to_string(),
            secure: false,
            key: "mirror".to_string(),
        }
    }
}

impl RelayConfig {
    /// Reads `MIRROR_RELAY_{HOST,PORT,PATH,SECURE,KEY}` over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("MIRROR_RELAY_HOST").unwrap_or(defaults.host),
            port: env::var("MIRROR_RELAY_PORT")
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(defaults.port),
            path: env::var("MIRROR_RELAY_PATH").unwrap_or(defaults.path),
            secure: env::var("MIRROR_RELAY_SECURE")
                .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
                .unwrap_or(defaults.secure),
            key: env::var("MIRROR_RELAY_KEY").unwrap_or(defaults.key),
        }
    }

    /// WebSocket URL registering `address`: `{ws|wss}://host:port{path}/peers/{address}?key=..`.
    pub fn endpoint(&self, address: &str) -> Result<Url, LinkError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}", self.host, self.port))
            .map_err(|err| LinkError::Setup(format!("invalid relay address: {err}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| LinkError::Setup("relay url cannot carry a path".into()))?;
            segments.clear();
            for segment in self.path.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
            segments.push("peers");
            segments.push(address);
        }
        url.query_pairs_mut().append_pair("key", &self.key);
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AddressInUse,
    BadKey,
}

/// Frames exchanged between links and the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Welcome {
        address: String,
    },
    Rejected {
        reason: RejectReason,
    },
    Offer {
        src: String,
        dst: String,
        conn: String,
    },
    Accept {
        src: String,
        dst: String,
        conn: String,
    },
    Data {
        src: String,
        dst: String,
        conn: String,
        /// Base64 of the payload bytes.
        payload: String,
    },
    Close {
        src: String,
        dst: String,
        conn: String,
    },
    Unavailable {
        dst: String,
        conn: String,
    },
    Error {
        message: String,
    },
}

impl RelayFrame {
    /// Destination of a peer-to-peer frame; `None` for relay control frames.
    pub fn destination(&self) -> Option<&str> {
        match self {
            RelayFrame::Offer { dst, .. }
            | RelayFrame::Accept { dst, .. }
            | RelayFrame::Data { dst, .. }
            | RelayFrame::Close { dst, .. } => Some(dst),
            _ => None,
        }
    }

    /// Stamps the sender on a peer-to-peer frame.
    pub fn set_source(&mut self, address: &str) {
        match self {
            RelayFrame::Offer { src, .. }
            | RelayFrame::Accept { src, .. }
            | RelayFrame::Data { src, .. }
            | RelayFrame::Close { src, .. } => *src = address.to_string(),
            _ => {}
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        match self {
            RelayFrame::Offer { conn, .. }
            | RelayFrame::Accept { conn, .. }
            | RelayFrame::Data { conn, .. }
            | RelayFrame::Close { conn, .. }
            | RelayFrame::Unavailable { conn, .. } => Some(conn),
            _ => None,
        }
    }
}

struct Route {
    state: Arc<watch::Sender<LinkState>>,
    inbound: mpsc::UnboundedSender<Bytes>,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// A link registered with a relay server.
pub struct RelayLink {
    address: String,
    frames: mpsc::UnboundedSender<RelayFrame>,
    routes: Routes,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<PeerConnection>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayLink {
    pub async fn connect(config: &RelayConfig, address: impl Into<String>) -> Result<Self, LinkError> {
        let address = address.into();
        let url = config.endpoint(&address)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| LinkError::Setup(format!("relay connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Ok(frame) = serde_json::from_str::<RelayFrame>(&text) {
                            return Some(frame);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
            None
        })
        .await
        .map_err(|_| LinkError::OpenTimeout(HANDSHAKE_TIMEOUT))?;
        match welcome {
            Some(RelayFrame::Welcome { .. }) => {}
            Some(RelayFrame::Rejected {
                reason: RejectReason::AddressInUse,
            }) => return Err(LinkError::AddressInUse(address)),
            Some(RelayFrame::Rejected {
                reason: RejectReason::BadKey,
            }) => return Err(LinkError::Setup("relay rejected key".into())),
            Some(other) => {
                return Err(LinkError::Setup(format!(
                    "unexpected relay handshake frame: {other:?}"
                )));
            }
            None => return Err(LinkError::Setup("relay closed during handshake".into())),
        }
        debug!(target = "mirror.relay", %address, url = %url, "registered with relay");

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target = "mirror.relay", error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let demux = Demux {
            address: address.clone(),
            frames: frames_tx.clone(),
            routes: Arc::clone(&routes),
            incoming: incoming_tx,
        };
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => demux.handle(frame),
                        Err(err) => {
                            warn!(target = "mirror.relay", error = %err, "malformed relay frame")
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(target = "mirror.relay", error = %err, "relay socket error");
                        break;
                    }
                }
            }
            demux.shutdown();
        });

        Ok(Self {
            address,
            frames: frames_tx,
            routes,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            tasks: Mutex::new(vec![writer, reader]),
        })
    }
}

#[async_trait]
impl PeerLink for RelayLink {
    fn local_address(&self) -> &str {
        &self.address
    }

    async fn dial(&self, remote: &str) -> Result<Arc<PeerConnection>, LinkError> {
        let conn_id = Uuid::new_v4().to_string();
        let (conn, driver) = link::connection(remote);
        register(&self.routes, &conn_id, &driver);
        self.frames
            .send(RelayFrame::Offer {
                src: self.address.clone(),
                dst: remote.to_string(),
                conn: conn_id.clone(),
            })
            .map_err(|_| LinkError::Closed)?;
        trace!(target = "mirror.relay", local = %self.address, %remote, conn = %conn_id, "offer sent");
        let pump = spawn_pump(
            self.address.clone(),
            conn_id,
            driver,
            self.frames.clone(),
            Arc::clone(&self.routes),
        );
        self.tasks.lock().push(pump);
        Ok(conn)
    }

    async fn accept(&self) -> Option<Arc<PeerConnection>> {
        self.incoming.lock().await.recv().await
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        for (_, route) in self.routes.lock().drain() {
            close_state(&route.state);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Routes frames from the relay socket to logical connections.
struct Demux {
    address: String,
    frames: mpsc::UnboundedSender<RelayFrame>,
    routes: Routes,
    incoming: mpsc::UnboundedSender<Arc<PeerConnection>>,
}

impl Demux {
    fn handle(&self, frame: RelayFrame) {
        match frame {
            RelayFrame::Offer { src, conn, .. } => {
                let (connection, driver) = link::connection(src.clone());
                register(&self.routes, &conn, &driver);
                driver.open();
                let _ = self.frames.send(RelayFrame::Accept {
                    src: self.address.clone(),
                    dst: src.clone(),
                    conn: conn.clone(),
                });
                debug!(target = "mirror.relay", local = %self.address, remote = %src, %conn, "accepted relay connection");
                spawn_pump(
                    self.address.clone(),
                    conn,
                    driver,
                    self.frames.clone(),
                    Arc::clone(&self.routes),
                );
                let _ = self.incoming.send(connection);
            }
            RelayFrame::Accept { conn, .. } => {
                if let Some(route) = self.routes.lock().get(&conn) {
                    link::open_state(&route.state);
                }
            }
            RelayFrame::Data { conn, payload, .. } => {
                let bytes = match BASE64.decode(payload.as_bytes()) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(err) => {
                        warn!(target = "mirror.relay", %conn, error = %err, "undecodable data frame");
                        return;
                    }
                };
                if let Some(route) = self.routes.lock().get(&conn) {
                    let _ = route.inbound.send(bytes);
                }
            }
            RelayFrame::Close { conn, .. } => {
                if let Some(route) = self.routes.lock().remove(&conn) {
                    close_state(&route.state);
                }
            }
            RelayFrame::Unavailable { dst, conn } => {
                if let Some(route) = self.routes.lock().remove(&conn) {
                    route.state.send_if_modified(|state| {
                        if state.is_terminal() {
                            return false;
                        }
                        *state = LinkState::Failed(format!("peer {dst} is not reachable"));
                        true
                    });
                }
            }
            RelayFrame::Error { message } => {
                warn!(target = "mirror.relay", %message, "relay reported an error");
            }
            RelayFrame::Welcome { .. } | RelayFrame::Rejected { .. } => {}
        }
    }

    fn shutdown(&self) {
        for (conn, route) in self.routes.lock().drain() {
            trace!(target = "mirror.relay", %conn, "relay lost; failing connection");
            route.state.send_if_modified(|state| {
                if state.is_terminal() {
                    return false;
                }
                *state = LinkState::Failed("relay connection lost".into());
                true
            });
        }
    }
}

fn register(routes: &Routes, conn_id: &str, driver: &ConnectionDriver) {
    routes.lock().insert(
        conn_id.to_string(),
        Route {
            state: Arc::clone(&driver.state),
            inbound: driver.inbound.clone(),
        },
    );
}

/// Forwards bytes sent on one connection as `data` frames once it is open,
/// and emits `close` when it ends.
fn spawn_pump(
    local: String,
    conn_id: String,
    driver: ConnectionDriver,
    frames: mpsc::UnboundedSender<RelayFrame>,
    routes: Routes,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ConnectionDriver {
            remote,
            state,
            mut outbound,
            ..
        } = driver;
        let mut watch = state.subscribe();
        if link::opened(&state).await && watch.borrow_and_update().is_open() {
            loop {
                tokio::select! {
                    biased;
                    message = outbound.recv() => match message {
                        Some(bytes) => {
                            let frame = RelayFrame::Data {
                                src: local.clone(),
                                dst: remote.clone(),
                                conn: conn_id.clone(),
                                payload: BASE64.encode(&bytes),
                            };
                            if frames.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    changed = watch.changed() => {
                        if changed.is_err() || !watch.borrow().is_open() {
                            break;
                        }
                    }
                }
            }
        }
        if routes.lock().remove(&conn_id).is_some() {
            let _ = frames.send(RelayFrame::Close {
                src: local,
                dst: remote,
                conn: conn_id,
            });
        }
        close_state(&state);
    })
}
