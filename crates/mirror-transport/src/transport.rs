use std::sync::Arc;

use bytes::Bytes;
use mirror_proto::{Chunk, Envelope, EventKind, RecordedEvent, RemoteControl, Role, SessionId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{LinkError, TransportError, TransportResult};
use crate::handlers::{HandlerId, HandlerRegistry};
use crate::link::{LinkState, PeerConnection, PeerLink};

/// Connection lifecycle notifications for observers of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Open { remote: String },
    Closed { remote: String },
    Error { remote: String, reason: String },
}

/// Role-addressed, event-typed channel between the two peers of one session.
///
/// Binds the local role's address on a [`PeerLink`] and talks to the
/// counterpart role's address. Must be created inside a Tokio runtime.
pub struct PeerTransport {
    inner: Arc<Inner>,
    accept_task: JoinHandle<()>,
}

struct Inner {
    session: SessionId,
    role: Role,
    remote: String,
    link: Arc<dyn PeerLink>,
    config: TransportConfig,
    active: RwLock<Option<Arc<PeerConnection>>>,
    connecting: tokio::sync::Mutex<()>,
    handlers: HandlerRegistry,
    status: broadcast::Sender<TransportStatus>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerTransport {
    pub fn bind(
        session: SessionId,
        role: Role,
        link: Arc<dyn PeerLink>,
        config: TransportConfig,
    ) -> TransportResult<Self> {
        let expected = session.address(role);
        if link.local_address() != expected {
            return Err(TransportError::AddressMismatch {
                expected,
                actual: link.local_address().to_string(),
            });
        }
        let remote = session.address(role.counterpart());
        let inner = Arc::new(Inner {
            session,
            role,
            remote,
            link,
            config,
            active: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
            handlers: HandlerRegistry::new(),
            status: broadcast::channel(32).0,
            pumps: Mutex::new(Vec::new()),
        });

        let acceptor = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move {
            while let Some(conn) = acceptor.link.accept().await {
                debug!(
                    target = "mirror.transport",
                    role = %acceptor.role,
                    remote = %conn.remote(),
                    "accepted inbound connection"
                );
                acceptor.attach(conn);
            }
        });

        Ok(Self { inner, accept_task })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn session(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn local_address(&self) -> &str {
        self.inner.link.local_address()
    }

    pub fn remote_address(&self) -> &str {
        &self.inner.remote
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .live_connection()
            .map(|conn| conn.is_open())
            .unwrap_or(false)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<TransportStatus> {
        self.inner.status.subscribe()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.handlers.on(kind, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.off(id)
    }

    /// Establishes the link to the counterpart. A no-op while a live
    /// connection exists.
    pub async fn connect(&self) -> TransportResult<()> {
        let _guard = self.inner.connecting.lock().await;
        if self.inner.live_connection().is_some() {
            return Ok(());
        }

        let timeout = self.inner.config.connect_timeout;
        let conn = self.inner.link.dial(&self.inner.remote).await?;
        self.inner.attach(Arc::clone(&conn));
        match conn.wait_open(timeout).await {
            Ok(()) => {
                info!(
                    target = "mirror.transport",
                    role = %self.inner.role,
                    remote = %self.inner.remote,
                    "connected to counterpart"
                );
                Ok(())
            }
            Err(err) => {
                conn.close();
                self.inner.detach(&conn);
                match err {
                    LinkError::OpenTimeout(_) => Err(TransportError::ConnectTimeout(timeout)),
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Delivers one envelope, connecting first when needed. The source role
    /// never writes into a channel that is not open on both ends.
    pub async fn send(&self, envelope: &Envelope) -> TransportResult<()> {
        let bytes = Bytes::from(envelope.encode()?);
        let conn = match self.inner.live_connection() {
            Some(conn) => conn,
            None => {
                self.connect().await?;
                self.inner
                    .live_connection()
                    .ok_or(TransportError::Closed)?
            }
        };

        if self.inner.role == Role::Source && !conn.is_open() {
            let waited = self.inner.config.open_timeout;
            conn.wait_open(waited).await.map_err(|err| match err {
                LinkError::OpenTimeout(_) => TransportError::NotOpen {
                    remote: conn.remote().to_string(),
                    waited,
                },
                other => other.into(),
            })?;
        }

        conn.send(bytes)?;
        trace!(
            target = "mirror.transport",
            role = %self.inner.role,
            event = %envelope.event,
            "envelope sent"
        );
        Ok(())
    }

    pub async fn send_source_ready(&self) -> TransportResult<()> {
        self.send(&Envelope::new(EventKind::SourceReady)).await
    }

    pub async fn send_viewer_ready(&self) -> TransportResult<()> {
        self.send(&Envelope::new(EventKind::ViewerReady)).await
    }

    pub async fn send_start(&self) -> TransportResult<()> {
        self.send(&Envelope::new(EventKind::Start)).await
    }

    pub async fn send_record(&self, chunk: &Chunk<RecordedEvent>) -> TransportResult<()> {
        self.send(&Envelope::with_payload(EventKind::RecordEvent, chunk)?)
            .await
    }

    /// Acknowledges every chunk with an id up to and including `id`.
    pub async fn ack_record(&self, id: u64) -> TransportResult<()> {
        self.send(&Envelope::with_payload(EventKind::AckRecord, &id)?)
            .await
    }

    pub async fn send_stop(&self) -> TransportResult<()> {
        self.send(&Envelope::new(EventKind::Stop)).await
    }

    pub async fn send_remote_control(&self, payload: RemoteControl) -> TransportResult<()> {
        self.send(&payload.into_envelope()?).await
    }

    /// Closes the active connection; the next send reconnects.
    pub fn close(&self) {
        if let Some(conn) = self.inner.active.write().take() {
            conn.close();
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        for pump in self.inner.pumps.lock().drain(..) {
            pump.abort();
        }
        if let Some(conn) = self.inner.active.write().take() {
            conn.close();
        }
    }
}

impl Inner {
    fn live_connection(&self) -> Option<Arc<PeerConnection>> {
        self.active
            .read()
            .as_ref()
            .filter(|conn| !conn.state().is_terminal())
            .cloned()
    }

    /// Makes `conn` the active channel and starts delivering its envelopes.
    fn attach(self: &Arc<Self>, conn: Arc<PeerConnection>) {
        *self.active.write() = Some(Arc::clone(&conn));
        let inner = Arc::clone(self);
        let pump = tokio::spawn(async move { inner.pump(conn).await });
        let mut pumps = self.pumps.lock();
        pumps.retain(|handle| !handle.is_finished());
        pumps.push(pump);
    }

    fn detach(&self, conn: &Arc<PeerConnection>) {
        let mut active = self.active.write();
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            *active = None;
        }
    }

    async fn pump(self: Arc<Self>, conn: Arc<PeerConnection>) {
        let Some(mut inbound) = conn.take_inbound() else {
            return;
        };
        let remote = conn.remote().to_string();
        let mut state = conn.subscribe_state();
        let mut announced = false;
        if state.borrow_and_update().is_open() {
            self.announce_open(&remote);
            announced = true;
        }

        let final_state = loop {
            tokio::select! {
                biased;
                message = inbound.recv() => match message {
                    Some(bytes) => self.deliver(&remote, &bytes),
                    None => break conn.state(),
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break conn.state();
                    }
                    let current = state.borrow_and_update().clone();
                    match current {
                        LinkState::Open if !announced => {
                            self.announce_open(&remote);
                            announced = true;
                        }
                        LinkState::Closed | LinkState::Failed(_) => break current,
                        _ => {}
                    }
                }
            }
        };
        while let Ok(bytes) = inbound.try_recv() {
            self.deliver(&remote, &bytes);
        }

        self.detach(&conn);
        let status = match final_state {
            LinkState::Failed(reason) => {
                warn!(
                    target = "mirror.transport",
                    role = %self.role,
                    %remote,
                    %reason,
                    "connection failed"
                );
                TransportStatus::Error { remote, reason }
            }
            _ => {
                info!(
                    target = "mirror.transport",
                    role = %self.role,
                    %remote,
                    "connection closed"
                );
                TransportStatus::Closed { remote }
            }
        };
        let _ = self.status.send(status);
    }

    fn announce_open(&self, remote: &str) {
        debug!(
            target = "mirror.transport",
            role = %self.role,
            %remote,
            "channel open"
        );
        let _ = self.status.send(TransportStatus::Open {
            remote: remote.to_string(),
        });
    }

    fn deliver(&self, remote: &str, bytes: &[u8]) {
        match Envelope::decode(bytes) {
            Ok(Some(envelope)) => {
                let handled = self.handlers.dispatch(&envelope);
                trace!(
                    target = "mirror.transport",
                    role = %self.role,
                    event = %envelope.event,
                    handled,
                    "envelope received"
                );
            }
            Ok(None) => {
                debug!(
                    target = "mirror.transport",
                    role = %self.role,
                    %remote,
                    "ignoring envelope with unknown event kind"
                );
            }
            Err(err) => {
                warn!(
                    target = "mirror.transport",
                    role = %self.role,
                    %remote,
                    error = %err,
                    "dropping malformed envelope"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryHub, OpenPolicy};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn bind_pair(hub: &MemoryHub, config: TransportConfig) -> (PeerTransport, PeerTransport) {
        let session = SessionId::new("room");
        let source_link = hub.bind(session.address(Role::Source)).expect("bind source");
        let viewer_link = hub.bind(session.address(Role::Viewer)).expect("bind viewer");
        let source = PeerTransport::bind(
            session.clone(),
            Role::Source,
            Arc::new(source_link),
            config.clone(),
        )
        .expect("source transport");
        let viewer =
            PeerTransport::bind(session, Role::Viewer, Arc::new(viewer_link), config).expect("viewer");
        (source, viewer)
    }

    fn collect(transport: &PeerTransport, kind: EventKind) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.on(kind, move |envelope| {
            let _ = tx.send(envelope.clone());
        });
        rx
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("envelope timeout")
            .expect("envelope")
    }

    #[tokio::test]
    async fn bind_rejects_foreign_address() {
        let hub = MemoryHub::new();
        let link = hub.bind("room-viewer").unwrap();
        let result = PeerTransport::bind(
            SessionId::new("room"),
            Role::Source,
            Arc::new(link),
            TransportConfig::default(),
        );
        assert!(matches!(
            result,
            Err(TransportError::AddressMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn envelopes_reach_registered_handlers() {
        let hub = MemoryHub::new();
        let (source, viewer) = bind_pair(&hub, TransportConfig::default());
        let mut starts = collect(&source, EventKind::Start);
        let mut records = collect(&viewer, EventKind::RecordEvent);

        viewer.send_start().await.expect("viewer send");
        assert_eq!(recv(&mut starts).await.event, EventKind::Start);

        let chunk = Chunk {
            id: 0,
            data: serde_json::json!({"type": 4}),
        };
        source.send_record(&chunk).await.expect("source send");
        let received = recv(&mut records).await;
        assert_eq!(received.payload_as::<Chunk>().unwrap(), chunk);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let hub = MemoryHub::new();
        let (_source, viewer) = bind_pair(&hub, TransportConfig::default());
        viewer.connect().await.expect("first connect");
        assert!(viewer.is_open());
        viewer.connect().await.expect("second connect is a no-op");
        assert!(viewer.is_open());
    }

    #[tokio::test]
    async fn connect_fails_when_counterpart_absent() {
        let hub = MemoryHub::new();
        let link = hub.bind("room-viewer").unwrap();
        let viewer = PeerTransport::bind(
            SessionId::new("room"),
            Role::Viewer,
            Arc::new(link),
            TransportConfig::default(),
        )
        .unwrap();
        let err = viewer.send_viewer_ready().await.expect_err("nobody home");
        assert!(matches!(
            err,
            TransportError::Link(LinkError::PeerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn source_send_waits_for_open_channel() {
        let hub = MemoryHub::with_open_policy(OpenPolicy::Manual);
        let (source, viewer) = bind_pair(&hub, TransportConfig::default());
        let source = Arc::new(source);
        let mut ready = collect(&viewer, EventKind::SourceReady);
        let mut status = source.subscribe_status();

        let viewer_connect = tokio::spawn(async move {
            viewer.connect().await.expect("viewer connect");
            viewer
        });
        while !hub_has_pending(&source) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sender = Arc::clone(&source);
        let send = tokio::spawn(async move { sender.send_source_ready().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!send.is_finished(), "source must wait for open");
        assert!(ready.try_recv().is_err());

        assert_eq!(hub.open_pending(), 1);
        send.await.expect("join").expect("send after open");
        let _viewer = viewer_connect.await.expect("join viewer");
        assert_eq!(recv(&mut ready).await.event, EventKind::SourceReady);
        assert!(matches!(
            status.recv().await.expect("status"),
            TransportStatus::Open { .. }
        ));
    }

    #[tokio::test]
    async fn source_send_fails_when_channel_never_opens() {
        let hub = MemoryHub::with_open_policy(OpenPolicy::Manual);
        let config = TransportConfig::default()
            .with_connect_timeout(Duration::from_millis(40))
            .with_open_timeout(Duration::from_millis(40));
        let (source, _viewer) = bind_pair(&hub, config);
        let err = source.send_stop().await.expect_err("never opens");
        assert!(matches!(err, TransportError::ConnectTimeout(_)));
    }

    #[tokio::test]
    async fn close_is_reported_to_observers() {
        let hub = MemoryHub::new();
        let (source, viewer) = bind_pair(&hub, TransportConfig::default());
        let mut status = source.subscribe_status();
        viewer.connect().await.unwrap();
        assert!(matches!(
            recv_status(&mut status).await,
            TransportStatus::Open { .. }
        ));
        viewer.close();
        assert_eq!(
            recv_status(&mut status).await,
            TransportStatus::Closed {
                remote: "room-viewer".into()
            }
        );
        assert!(!source.is_open());
    }

    #[tokio::test]
    async fn unknown_kinds_are_ignored() {
        let hub = MemoryHub::new();
        let session = SessionId::new("room");
        let raw = hub.bind(session.address(Role::Viewer)).unwrap();
        let source_link = hub.bind(session.address(Role::Source)).unwrap();
        let source = PeerTransport::bind(
            session,
            Role::Source,
            Arc::new(source_link),
            TransportConfig::default(),
        )
        .unwrap();
        let mut stops = collect(&source, EventKind::Stop);

        let conn = raw.dial("room-source").await.unwrap();
        conn.send(Bytes::from_static(br#"{"event":"bogus"}"#)).unwrap();
        conn.send(Bytes::from_static(b"garbage")).unwrap();
        conn.send(Bytes::from_static(br#"{"event":"stop"}"#)).unwrap();
        assert_eq!(recv(&mut stops).await.event, EventKind::Stop);
    }

    async fn recv_status(rx: &mut broadcast::Receiver<TransportStatus>) -> TransportStatus {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("status timeout")
            .expect("status")
    }

    fn hub_has_pending(source: &PeerTransport) -> bool {
        source.inner.live_connection().is_some()
    }
}
