//! In-memory engine doubles for tests and demos.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use mirror_proto::{CustomEventTag, InteractiveAction, RecordedEvent};
use parking_lot::Mutex;
use serde_json::Value;

use crate::engine::{
    ActionFn, ControlSink, EmitFn, InteractionSource, ListenerHandle, RecordOptions, Recorder,
    RecordingHandle, Replayer,
};
use crate::error::EngineError;

struct Run {
    emit: EmitFn,
    active: Arc<AtomicBool>,
}

/// Recorder whose events are pushed by the test through [`MockRecorder::emit`].
#[derive(Default)]
pub struct MockRecorder {
    runs: Mutex<Vec<Run>>,
    options: Mutex<Vec<RecordOptions>>,
    custom: Mutex<Vec<(CustomEventTag, Value)>>,
}

impl MockRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of recording runs started so far.
    pub fn runs(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn active_runs(&self) -> usize {
        self.runs
            .lock()
            .iter()
            .filter(|run| run.active.load(Ordering::SeqCst))
            .count()
    }

    pub fn last_options(&self) -> Option<RecordOptions> {
        self.options.lock().last().cloned()
    }

    /// Emits `event` on the latest active run; false when nothing records.
    pub fn emit(&self, event: RecordedEvent) -> bool {
        let emit = self
            .runs
            .lock()
            .iter()
            .rev()
            .find(|run| run.active.load(Ordering::SeqCst))
            .map(|run| Arc::clone(&run.emit));
        match emit {
            Some(emit) => {
                emit(event);
                true
            }
            None => false,
        }
    }

    /// The emit callback handed to run `index`, whether or not it still records.
    pub fn emitter(&self, index: usize) -> Option<EmitFn> {
        self.runs.lock().get(index).map(|run| Arc::clone(&run.emit))
    }

    pub fn custom_events(&self) -> Vec<(CustomEventTag, Value)> {
        self.custom.lock().clone()
    }
}

#[async_trait]
impl Recorder for MockRecorder {
    async fn record(
        &self,
        options: &RecordOptions,
        emit: EmitFn,
    ) -> Result<RecordingHandle, EngineError> {
        let active = Arc::new(AtomicBool::new(true));
        self.runs.lock().push(Run {
            emit,
            active: Arc::clone(&active),
        });
        self.options.lock().push(options.clone());
        Ok(RecordingHandle::new(move || {
            active.store(false, Ordering::SeqCst);
        }))
    }

    async fn add_custom_event(
        &self,
        tag: CustomEventTag,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.custom.lock().push((tag, payload));
        Ok(())
    }
}

type Listeners = Arc<Mutex<Vec<(usize, ActionFn)>>>;

/// Interaction source the test drives through [`MockReplayer::interact`].
#[derive(Default)]
pub struct MockMirror {
    listeners: Listeners,
    next: AtomicUsize,
}

impl InteractionSource for MockMirror {
    fn listen(&self, handler: ActionFn) -> ListenerHandle {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, handler));
        let listeners = Arc::clone(&self.listeners);
        ListenerHandle::new(move || {
            listeners.lock().retain(|(existing, _)| *existing != id);
        })
    }
}

/// Replayer that records what it was fed and whether interaction is enabled.
#[derive(Default)]
pub struct MockReplayer {
    events: Mutex<Vec<RecordedEvent>>,
    interactive: AtomicBool,
    toggles: AtomicUsize,
    mirror: Arc<MockMirror>,
}

impl MockReplayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::SeqCst)
    }

    /// Enable plus disable calls so far.
    pub fn toggles(&self) -> usize {
        self.toggles.load(Ordering::SeqCst)
    }

    pub fn listeners(&self) -> usize {
        self.mirror.listeners.lock().len()
    }

    /// Simulates a local interaction on the mirrored document.
    pub fn interact(&self, action: InteractiveAction) {
        let listeners: Vec<ActionFn> = self
            .mirror
            .listeners
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for listener in listeners {
            listener(action.clone());
        }
    }
}

#[async_trait]
impl Replayer for MockReplayer {
    async fn enable_interact(&self) -> Result<(), EngineError> {
        self.interactive.store(true, Ordering::SeqCst);
        self.toggles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_interact(&self) -> Result<(), EngineError> {
        self.interactive.store(false, Ordering::SeqCst);
        self.toggles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mirror(&self) -> Arc<dyn InteractionSource> {
        Arc::clone(&self.mirror) as Arc<dyn InteractionSource>
    }

    fn add_event(&self, event: RecordedEvent) -> Result<(), EngineError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Control sink that keeps every applied action.
#[derive(Default)]
pub struct MockControlSink {
    applied: Mutex<Vec<InteractiveAction>>,
}

impl MockControlSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied(&self) -> Vec<InteractiveAction> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl ControlSink for MockControlSink {
    async fn apply(&self, action: InteractiveAction) -> Result<(), EngineError> {
        self.applied.lock().push(action);
        Ok(())
    }
}
