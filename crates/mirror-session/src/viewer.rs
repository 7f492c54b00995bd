//! Viewer-role wiring: replays the incoming stream and drives the viewer
//! machines from inbound envelopes.

use std::sync::Arc;

use mirror_proto::{Chunk, EventKind};
use mirror_transport::{HandlerId, PeerTransport};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::engine::Replayer;
use crate::error::MachineResult;
use crate::machine::{Outcome, Service, ServiceHandle};
use crate::viewer_control::{ViewerControlEvent, ViewerControlMachine, ViewerControlState};
use crate::viewer_session::{
    StopCallback, ViewerSessionEvent, ViewerSessionMachine, ViewerSessionState,
};

/// What the viewer does with one incoming chunk id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// Next in sequence; `new_run` when it is id 0.
    Accept { new_run: bool },
    /// Already seen in this run.
    Stale,
    /// A discontinuity; `resync` is true only for the first one noticed.
    Gap { expected: Option<u64>, resync: bool },
}

/// Tracks the next expected chunk id of the current recording run.
#[derive(Debug, Default)]
pub struct StreamCursor {
    next: Option<u64>,
    resyncing: bool,
}

impl StreamCursor {
    pub fn observe(&mut self, id: u64) -> ChunkVerdict {
        if id == 0 {
            self.next = Some(1);
            self.resyncing = false;
            return ChunkVerdict::Accept { new_run: true };
        }
        match self.next {
            Some(next) if id == next => {
                self.next = Some(next + 1);
                ChunkVerdict::Accept { new_run: false }
            }
            Some(next) if id < next => ChunkVerdict::Stale,
            expected => {
                let resync = !self.resyncing;
                self.resyncing = true;
                self.next = None;
                ChunkVerdict::Gap { expected, resync }
            }
        }
    }

    pub fn next_expected(&self) -> Option<u64> {
        self.next
    }
}

enum Outbound {
    Ack(u64),
    Resync,
}

/// The replaying side of a mirroring session.
pub struct ViewerSession {
    transport: Arc<PeerTransport>,
    session: ServiceHandle<ViewerSessionMachine>,
    control: ServiceHandle<ViewerControlMachine>,
    handlers: Vec<HandlerId>,
    outbound_task: JoinHandle<()>,
}

impl ViewerSession {
    /// Must be called inside a Tokio runtime. `on_stop` runs each time the
    /// source stops streaming.
    pub fn new(
        transport: Arc<PeerTransport>,
        replayer: Arc<dyn Replayer>,
        on_stop: StopCallback,
    ) -> Self {
        let session = Service::spawn(ViewerSessionMachine::machine(
            Arc::clone(&transport),
            on_stop,
        ));
        let control = Service::spawn(ViewerControlMachine::machine(Arc::clone(&transport)));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let sender = Arc::clone(&transport);
        let outbound_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let result = match message {
                    Outbound::Ack(id) => sender.ack_record(id).await,
                    Outbound::Resync => sender.send_start().await,
                };
                if let Err(err) = result {
                    warn!(target = "mirror.viewer", error = %err, "failed to reach source");
                }
            }
        });

        let mut handlers = Vec::new();

        let ready = session.clone();
        handlers.push(transport.on(EventKind::SourceReady, move |_| {
            if ready.state() == ViewerSessionState::Stopped {
                ready.send(ViewerSessionEvent::Reset);
            }
            ready.send(ViewerSessionEvent::SourceReady);
        }));

        let cursor = Mutex::new(StreamCursor::default());
        let feed = Arc::clone(&replayer);
        let first = session.clone();
        handlers.push(transport.on(EventKind::RecordEvent, move |envelope| {
            let chunk = match envelope.payload_as::<Chunk>() {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(target = "mirror.viewer", error = %err, "malformed record");
                    return;
                }
            };
            let verdict = cursor.lock().observe(chunk.id);
            match verdict {
                ChunkVerdict::Accept { new_run } => {
                    if new_run {
                        debug!(target = "mirror.viewer", "recording run started");
                    }
                    let id = chunk.id;
                    if let Err(err) = feed.add_event(chunk.data) {
                        warn!(target = "mirror.viewer", id, error = %err, "replayer rejected event");
                    }
                    let _ = outbound_tx.send(Outbound::Ack(id));
                    if first.state() != ViewerSessionState::Connected {
                        first.send(ViewerSessionEvent::FirstRecord);
                    }
                }
                ChunkVerdict::Stale => {
                    trace!(target = "mirror.viewer", id = chunk.id, "stale record skipped");
                }
                ChunkVerdict::Gap { expected, resync } => {
                    warn!(
                        target = "mirror.viewer",
                        id = chunk.id,
                        expected = ?expected,
                        "gap in record stream"
                    );
                    if resync {
                        info!(target = "mirror.viewer", "requesting a fresh recording run");
                        let _ = outbound_tx.send(Outbound::Resync);
                    }
                }
            }
        }));

        let stops = session.clone();
        handlers.push(transport.on(EventKind::Stop, move |_| {
            stops.send(ViewerSessionEvent::Stop);
        }));

        let accepted = control.clone();
        handlers.push(transport.on(EventKind::RemoteControlAccept, move |_| {
            accepted.send(ViewerControlEvent::Accepted {
                replayer: Some(Arc::clone(&replayer)),
            });
        }));

        let revoked = control.clone();
        handlers.push(transport.on(EventKind::RemoteControlStop, move |_| {
            if revoked.state() == ViewerControlState::Controlling {
                revoked.send(ViewerControlEvent::StopControl);
            }
        }));

        Self {
            transport,
            session,
            control,
            handlers,
            outbound_task,
        }
    }

    /// Tells the source a viewer is present.
    pub async fn announce(&self) -> MachineResult<()> {
        self.transport.send_viewer_ready().await?;
        Ok(())
    }

    pub async fn request_control(&self) -> MachineResult<Outcome<ViewerControlState>> {
        self.control.dispatch(ViewerControlEvent::Request).await
    }

    pub async fn stop_control(&self) -> MachineResult<Outcome<ViewerControlState>> {
        self.control.dispatch(ViewerControlEvent::StopControl).await
    }

    pub async fn reset(&self) -> MachineResult<Outcome<ViewerSessionState>> {
        self.session.dispatch(ViewerSessionEvent::Reset).await
    }

    pub fn state(&self) -> ViewerSessionState {
        self.session.state()
    }

    pub fn control_state(&self) -> ViewerControlState {
        self.control.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ViewerSessionState> {
        self.session.subscribe()
    }

    pub fn subscribe_control(&self) -> watch::Receiver<ViewerControlState> {
        self.control.subscribe()
    }

    pub async fn wait_for_state(&self, state: ViewerSessionState) -> MachineResult<()> {
        self.session.wait_for(state).await
    }

    pub async fn wait_for_control(&self, state: ViewerControlState) -> MachineResult<()> {
        self.control.wait_for(state).await
    }

    pub fn transport(&self) -> &Arc<PeerTransport> {
        &self.transport
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        for id in self.handlers.drain(..) {
            self.transport.off(id);
        }
        self.outbound_task.abort();
    }
}
