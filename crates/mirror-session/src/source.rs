//! Source-role wiring: binds inbound envelopes to the source machines.

use std::sync::Arc;

use mirror_proto::{EventKind, InteractiveAction, RemoteControl};
use mirror_transport::{HandlerId, PeerTransport};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferStats, SourceBuffer};
use crate::engine::{ControlSink, RecordOptions, Recorder};
use crate::error::MachineResult;
use crate::machine::{Outcome, Service, ServiceHandle};
use crate::source_control::{SourceControlEvent, SourceControlMachine, SourceControlState};
use crate::source_session::{
    SourceSessionContext, SourceSessionEvent, SourceSessionMachine, SourceSessionState,
};

#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub record: RecordOptions,
    /// Bound on unacknowledged events; unbounded when `None`.
    pub buffer_capacity: Option<usize>,
}

/// The recording side of a mirroring session.
pub struct SourceSession {
    transport: Arc<PeerTransport>,
    session: ServiceHandle<SourceSessionMachine>,
    control: ServiceHandle<SourceControlMachine>,
    buffer: Arc<Mutex<SourceBuffer>>,
    handlers: Vec<HandlerId>,
    sink_task: JoinHandle<()>,
}

impl SourceSession {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        transport: Arc<PeerTransport>,
        recorder: Arc<dyn Recorder>,
        sink: Arc<dyn ControlSink>,
        options: SourceOptions,
    ) -> Self {
        let buffer = Arc::new(Mutex::new(match options.buffer_capacity {
            Some(capacity) => SourceBuffer::with_capacity(capacity),
            None => SourceBuffer::new(),
        }));
        let session = Service::spawn(SourceSessionMachine::machine(SourceSessionContext::new(
            Arc::clone(&transport),
            Arc::clone(&recorder),
            options.record,
            Arc::clone(&buffer),
        )));
        let control = Service::spawn(SourceControlMachine::machine(
            Arc::clone(&transport),
            recorder,
        ));

        let (actions_tx, mut actions_rx) = mpsc::unbounded_channel::<InteractiveAction>();
        let sink_task = tokio::spawn(async move {
            while let Some(action) = actions_rx.recv().await {
                if let Err(err) = sink.apply(action).await {
                    warn!(target = "mirror.source", error = %err, "failed to apply remote action");
                }
            }
        });

        let mut handlers = Vec::new();
        let starts = session.clone();
        handlers.push(transport.on(EventKind::Start, move |_| {
            trace!(target = "mirror.source", "viewer wants the stream");
            starts.send(SourceSessionEvent::Connect);
        }));

        // A viewer that shows up after `start()` missed the first SourceReady.
        let announced = session.clone();
        let replier = Arc::downgrade(&transport);
        handlers.push(transport.on(EventKind::ViewerReady, move |_| {
            if announced.state() == SourceSessionState::Idle {
                debug!(target = "mirror.source", "viewer announced before start");
                return;
            }
            let Some(replier) = replier.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(err) = replier.send_source_ready().await {
                    warn!(target = "mirror.source", error = %err, "failed to answer viewer");
                }
            });
        }));

        let acked = Arc::clone(&buffer);
        handlers.push(transport.on(EventKind::AckRecord, move |envelope| {
            match envelope.payload_as::<u64>() {
                Ok(id) => {
                    let removed = acked.lock().ack(id);
                    trace!(target = "mirror.source", id, removed, "ack");
                }
                Err(err) => warn!(target = "mirror.source", error = %err, "malformed ack"),
            }
        }));

        let requests = control.clone();
        handlers.push(transport.on(EventKind::RemoteControlRequest, move |_| {
            requests.send(SourceControlEvent::Request);
        }));
        let stops = control.clone();
        handlers.push(transport.on(EventKind::RemoteControlStop, move |_| {
            stops.send(SourceControlEvent::Stop);
        }));

        for kind in [EventKind::PointerMove, EventKind::RemoteInput] {
            let control = control.clone();
            let actions = actions_tx.clone();
            handlers.push(transport.on(kind, move |envelope| {
                if control.state() != SourceControlState::Controlled {
                    debug!(target = "mirror.source", event = %envelope.event, "interaction dropped; not controlled");
                    return;
                }
                match envelope.payload_as::<InteractiveAction>() {
                    Ok(action) => {
                        let _ = actions.send(action);
                    }
                    Err(err) => {
                        warn!(target = "mirror.source", error = %err, "malformed interaction")
                    }
                }
            }));
        }

        Self {
            transport,
            session,
            control,
            buffer,
            handlers,
            sink_task,
        }
    }

    /// Arms recording and announces the source to the viewer.
    pub async fn start(&self) -> MachineResult<Outcome<SourceSessionState>> {
        let outcome = self.session.dispatch(SourceSessionEvent::Start).await?;
        self.transport.send_source_ready().await?;
        Ok(outcome)
    }

    pub async fn stop(&self) -> MachineResult<Outcome<SourceSessionState>> {
        self.session.dispatch(SourceSessionEvent::Stop).await
    }

    pub async fn accept_control(&self) -> MachineResult<Outcome<SourceControlState>> {
        self.control.dispatch(SourceControlEvent::Accept).await
    }

    /// Takes control back from the viewer.
    pub async fn revoke_control(&self) -> MachineResult<Outcome<SourceControlState>> {
        let outcome = self.control.dispatch(SourceControlEvent::Stop).await?;
        if matches!(outcome, Outcome::Transitioned { .. }) {
            self.transport
                .send_remote_control(RemoteControl::Stop)
                .await?;
        }
        Ok(outcome)
    }

    pub fn state(&self) -> SourceSessionState {
        self.session.state()
    }

    pub fn control_state(&self) -> SourceControlState {
        self.control.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SourceSessionState> {
        self.session.subscribe()
    }

    pub fn subscribe_control(&self) -> watch::Receiver<SourceControlState> {
        self.control.subscribe()
    }

    pub async fn wait_for_state(&self, state: SourceSessionState) -> MachineResult<()> {
        self.session.wait_for(state).await
    }

    pub async fn wait_for_control(&self, state: SourceControlState) -> MachineResult<()> {
        self.control.wait_for(state).await
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.lock().stats()
    }

    pub fn transport(&self) -> &Arc<PeerTransport> {
        &self.transport
    }
}

impl Drop for SourceSession {
    fn drop(&mut self) {
        for id in self.handlers.drain(..) {
            self.transport.off(id);
        }
        self.sink_task.abort();
    }
}
