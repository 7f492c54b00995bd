use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mirror_proto::{Chunk, RecordedEvent};
use mirror_transport::PeerTransport;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::SourceBuffer;
use crate::engine::{EmitFn, RecordOptions, Recorder, RecordingHandle};
use crate::error::MachineResult;
use crate::machine::{Definition, Machine, MachineEvent, Transition, TransitionOf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceSessionState {
    Idle,
    Ready,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceSessionEvent {
    Start,
    Connect,
    Stop,
}

impl MachineEvent for SourceSessionEvent {
    type Kind = SourceSessionEvent;

    fn kind(&self) -> Self {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSessionAction {
    Start,
    Connect,
    Stop,
}

/// One recording run: the recorder hook plus the task that forwards its
/// buffered chunks to the viewer in id order.
pub struct Recording {
    handle: Mutex<Option<RecordingHandle>>,
    active: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

impl Recording {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.stop();
        }
        self.forwarder.abort();
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct SourceSessionContext {
    pub transport: Arc<PeerTransport>,
    pub recorder: Arc<dyn Recorder>,
    pub options: RecordOptions,
    pub buffer: Arc<Mutex<SourceBuffer>>,
    pub armed: bool,
    pub recording: Option<Arc<Recording>>,
}

impl SourceSessionContext {
    pub fn new(
        transport: Arc<PeerTransport>,
        recorder: Arc<dyn Recorder>,
        options: RecordOptions,
        buffer: Arc<Mutex<SourceBuffer>>,
    ) -> Self {
        Self {
            transport,
            recorder,
            options,
            buffer,
            armed: false,
            recording: None,
        }
    }
}

/// Source-side session lifecycle: `idle -> ready -> connected`, with CONNECT
/// restarting the recording run while connected.
pub struct SourceSessionMachine;

static TABLE: &[TransitionOf<SourceSessionMachine>] = &[
    Transition {
        from: SourceSessionState::Idle,
        on: SourceSessionEvent::Start,
        to: SourceSessionState::Ready,
        actions: &[SourceSessionAction::Start],
    },
    Transition {
        from: SourceSessionState::Ready,
        on: SourceSessionEvent::Connect,
        to: SourceSessionState::Connected,
        actions: &[SourceSessionAction::Connect],
    },
    Transition {
        from: SourceSessionState::Connected,
        on: SourceSessionEvent::Connect,
        to: SourceSessionState::Connected,
        actions: &[SourceSessionAction::Connect],
    },
    Transition {
        from: SourceSessionState::Connected,
        on: SourceSessionEvent::Stop,
        to: SourceSessionState::Idle,
        actions: &[SourceSessionAction::Stop],
    },
];

impl SourceSessionMachine {
    pub fn machine(context: SourceSessionContext) -> Machine<Self> {
        Machine::new(Self, context)
    }
}

#[async_trait]
impl Definition for SourceSessionMachine {
    type State = SourceSessionState;
    type Event = SourceSessionEvent;
    type Action = SourceSessionAction;
    type Context = SourceSessionContext;

    const NAME: &'static str = "source_session";

    fn initial() -> SourceSessionState {
        SourceSessionState::Idle
    }

    fn table() -> &'static [TransitionOf<Self>] {
        TABLE
    }

    async fn execute(
        &self,
        action: SourceSessionAction,
        mut context: SourceSessionContext,
        _event: &SourceSessionEvent,
    ) -> MachineResult<SourceSessionContext> {
        match action {
            SourceSessionAction::Start => {
                context.armed = true;
                info!(
                    target = "mirror.source",
                    session = %context.transport.session(),
                    "recording armed"
                );
            }
            SourceSessionAction::Connect => {
                if let Some(previous) = context.recording.take() {
                    previous.stop();
                }
                context.buffer.lock().reset();
                let recording = start_recording(&context).await?;
                context.recording = Some(Arc::new(recording));
                info!(
                    target = "mirror.source",
                    session = %context.transport.session(),
                    "recording run started"
                );
            }
            SourceSessionAction::Stop => {
                if let Some(recording) = context.recording.take() {
                    recording.stop();
                }
                context.buffer.lock().reset();
                context.armed = false;
                info!(
                    target = "mirror.source",
                    session = %context.transport.session(),
                    "recording stopped"
                );
                // The viewer may already be gone; stopping stays local then.
                if let Err(err) = context.transport.send_stop().await {
                    warn!(
                        target = "mirror.source",
                        error = %err,
                        "could not notify viewer of stop"
                    );
                }
            }
        }
        Ok(context)
    }
}

async fn start_recording(context: &SourceSessionContext) -> MachineResult<Recording> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Chunk<RecordedEvent>>();
    let active = Arc::new(AtomicBool::new(true));

    let transport = Arc::clone(&context.transport);
    let forwarder = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let id = chunk.id;
            if let Err(err) = transport.send_record(&chunk).await {
                warn!(target = "mirror.source", id, error = %err, "failed to forward recorded event");
            }
        }
        debug!(target = "mirror.source", "forwarder finished");
    });

    let buffer = Arc::clone(&context.buffer);
    let live = Arc::clone(&active);
    let emit: EmitFn = Arc::new(move |event: RecordedEvent| {
        // CONNECT clears `live` before it resets the buffer, so checking it
        // under the lock keeps a stopped run out of the next one. Queueing
        // under the lock keeps send order in id order.
        let mut buffer = buffer.lock();
        if !live.load(Ordering::SeqCst) {
            return;
        }
        match buffer.add(event) {
            Ok(chunk) => {
                let _ = tx.send(chunk);
            }
            Err(err) => {
                warn!(target = "mirror.source", error = %err, "recorded event dropped");
            }
        }
    });

    match context.recorder.record(&context.options, emit).await {
        Ok(handle) => Ok(Recording {
            handle: Mutex::new(Some(handle)),
            active,
            forwarder,
        }),
        Err(err) => {
            forwarder.abort();
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRecorder;
    use crate::test_support::{collect, eventually, recv, transport_pair};
    use mirror_proto::EventKind;
    use serde_json::json;
    use std::time::Duration;

    fn context(
        transport: Arc<PeerTransport>,
        recorder: Arc<MockRecorder>,
    ) -> SourceSessionContext {
        SourceSessionContext::new(
            transport,
            recorder,
            RecordOptions::default(),
            Arc::new(Mutex::new(SourceBuffer::new())),
        )
    }

    #[tokio::test]
    async fn start_arms_without_recording() {
        let (source, _viewer, _hub) = transport_pair("s1");
        let recorder = MockRecorder::new();
        let mut machine = SourceSessionMachine::machine(context(source, recorder.clone()));

        machine.dispatch(SourceSessionEvent::Start).await.unwrap();
        assert_eq!(machine.state(), SourceSessionState::Ready);
        assert!(machine.context().armed);
        assert_eq!(recorder.runs(), 0);
    }

    #[tokio::test]
    async fn connect_in_idle_is_ignored() {
        let (source, _viewer, _hub) = transport_pair("s2");
        let recorder = MockRecorder::new();
        let mut machine = SourceSessionMachine::machine(context(source, recorder.clone()));
        machine.dispatch(SourceSessionEvent::Connect).await.unwrap();
        assert_eq!(machine.state(), SourceSessionState::Idle);
        assert_eq!(recorder.runs(), 0);
    }

    #[tokio::test]
    async fn reconnect_restarts_the_run() {
        let (source, viewer, _hub) = transport_pair("s3");
        let mut records = collect(&viewer, EventKind::RecordEvent);
        let recorder = MockRecorder::new();
        let ctx = context(source, recorder.clone());
        let buffer = Arc::clone(&ctx.buffer);
        let mut machine = SourceSessionMachine::machine(ctx);

        machine.dispatch(SourceSessionEvent::Start).await.unwrap();
        machine.dispatch(SourceSessionEvent::Connect).await.unwrap();
        assert_eq!(machine.state(), SourceSessionState::Connected);
        assert!(recorder.emit(json!("a")));
        assert!(recorder.emit(json!("b")));
        for expected in 0..2 {
            let chunk: Chunk = recv(&mut records).await.payload_as().unwrap();
            assert_eq!(chunk.id, expected);
        }
        assert_eq!(buffer.lock().len(), 2);

        machine.dispatch(SourceSessionEvent::Connect).await.unwrap();
        assert_eq!(machine.state(), SourceSessionState::Connected);
        assert_eq!(recorder.runs(), 2);
        assert_eq!(recorder.active_runs(), 1, "previous hook stopped");
        assert!(buffer.lock().is_empty(), "buffer reset for the new run");

        recorder.emit(json!("c"));
        let chunk: Chunk = recv(&mut records).await.payload_as().unwrap();
        assert_eq!(chunk, Chunk { id: 0, data: json!("c") });
    }

    #[tokio::test]
    async fn stop_notifies_viewer_and_halts_recording() {
        let (source, viewer, _hub) = transport_pair("s4");
        let mut stops = collect(&viewer, EventKind::Stop);
        let recorder = MockRecorder::new();
        let ctx = context(source, recorder.clone());
        let buffer = Arc::clone(&ctx.buffer);
        let mut machine = SourceSessionMachine::machine(ctx);

        machine.dispatch(SourceSessionEvent::Start).await.unwrap();
        machine.dispatch(SourceSessionEvent::Connect).await.unwrap();
        recorder.emit(json!(1));
        eventually(|| buffer.lock().len() == 1).await;

        machine.dispatch(SourceSessionEvent::Stop).await.unwrap();
        assert_eq!(machine.state(), SourceSessionState::Idle);
        assert_eq!(recv(&mut stops).await.event, EventKind::Stop);
        assert_eq!(recorder.active_runs(), 0);
        assert!(buffer.lock().is_empty());
        assert!(machine.context().recording.is_none());
        assert!(!recorder.emit(json!(2)));
    }

    #[tokio::test]
    async fn stop_without_a_viewer_still_halts_recording() {
        let (source, viewer, hub) = transport_pair("s5");
        let recorder = MockRecorder::new();
        let ctx = context(source, recorder.clone());
        let buffer = Arc::clone(&ctx.buffer);
        let mut machine = SourceSessionMachine::machine(ctx);

        machine.dispatch(SourceSessionEvent::Start).await.unwrap();
        machine.dispatch(SourceSessionEvent::Connect).await.unwrap();
        recorder.emit(json!("pending"));
        eventually(|| buffer.lock().len() == 1).await;

        let address = viewer.local_address().to_string();
        drop(viewer);
        eventually(|| !hub.is_bound(&address)).await;

        machine.dispatch(SourceSessionEvent::Stop).await.unwrap();
        assert_eq!(machine.state(), SourceSessionState::Idle);
        assert_eq!(recorder.active_runs(), 0);
        assert!(buffer.lock().is_empty());
        assert!(!recorder.emit(json!("late")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emit_racing_a_reconnect_stays_out_of_the_new_run() {
        let (source, viewer, _hub) = transport_pair("s6");
        let mut records = collect(&viewer, EventKind::RecordEvent);
        let recorder = MockRecorder::new();
        let ctx = context(source, recorder.clone());
        let buffer = Arc::clone(&ctx.buffer);
        let mut machine = SourceSessionMachine::machine(ctx);
        machine.dispatch(SourceSessionEvent::Start).await.unwrap();
        machine.dispatch(SourceSessionEvent::Connect).await.unwrap();
        let stale = recorder.emitter(0).unwrap();

        // Park the old run's emit on the buffer lock while CONNECT stops it.
        let guard = buffer.lock();
        let emitter = std::thread::spawn(move || stale(json!("stale")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reconnect = tokio::spawn(async move {
            machine.dispatch(SourceSessionEvent::Connect).await.unwrap();
            machine
        });
        eventually(|| recorder.active_runs() == 0).await;
        drop(guard);

        emitter.join().unwrap();
        let machine = reconnect.await.unwrap();
        assert_eq!(machine.state(), SourceSessionState::Connected);
        assert!(buffer.lock().is_empty(), "stale event kept");

        recorder.emit(json!("fresh"));
        let chunk: Chunk = recv(&mut records).await.payload_as().unwrap();
        assert_eq!(chunk, Chunk { id: 0, data: json!("fresh") });
    }
}
