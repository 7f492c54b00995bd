//! Line-oriented engines backing the CLI: stdin lines become recorded events
//! on the source, and replayed events are printed as JSON lines on the viewer.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use mirror_proto::{CustomEventTag, InteractiveAction, RecordedEvent};
use mirror_session::{
    ActionFn, ControlSink, EmitFn, EngineError, InteractionSource, ListenerHandle, RecordOptions,
    Recorder, RecordingHandle, Replayer,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info};

/// Lines kept for the snapshot that opens each recording run.
const HISTORY_LIMIT: usize = 1024;

/// Parses a stdin line as JSON, falling back to a plain string.
pub fn parse_line(line: &str) -> Option<RecordedEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}

struct LineRun {
    emit: EmitFn,
    active: Arc<AtomicBool>,
}

impl LineRun {
    fn live(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct LineState {
    history: VecDeque<RecordedEvent>,
    run: Option<LineRun>,
}

/// Recorder fed by [`LineRecorder::push`]. Every run opens with a snapshot
/// of the lines seen so far, so a fresh run rebuilds the viewer's state.
#[derive(Default)]
pub struct LineRecorder {
    // Emits happen under this lock so a line is either in a snapshot or
    // streamed after it, never both.
    state: Mutex<LineState>,
}

impl LineRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: RecordedEvent) {
        let mut state = self.state.lock();
        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        if let Some(run) = state.run.as_ref().filter(|run| run.live()) {
            (run.emit)(json!({ "type": "line", "data": event }));
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().run.as_ref().is_some_and(LineRun::live)
    }
}

#[async_trait]
impl Recorder for LineRecorder {
    async fn record(
        &self,
        _options: &RecordOptions,
        emit: EmitFn,
    ) -> Result<RecordingHandle, EngineError> {
        let active = Arc::new(AtomicBool::new(true));
        let mut state = self.state.lock();
        let snapshot: Vec<RecordedEvent> = state.history.iter().cloned().collect();
        debug!(target = "mirror.source", lines = snapshot.len(), "recording run started");
        emit(json!({ "type": "snapshot", "lines": snapshot }));
        state.run = Some(LineRun {
            emit,
            active: Arc::clone(&active),
        });
        Ok(RecordingHandle::new(move || {
            active.store(false, Ordering::SeqCst);
        }))
    }

    async fn add_custom_event(
        &self,
        tag: CustomEventTag,
        payload: Value,
    ) -> Result<(), EngineError> {
        let state = self.state.lock();
        let run = state
            .run
            .as_ref()
            .filter(|run| run.live())
            .ok_or_else(|| EngineError::Recorder("no active recording".into()))?;
        (run.emit)(json!({ "type": "custom", "tag": tag.as_str(), "payload": payload }));
        Ok(())
    }
}

/// Logs remote actions instead of driving a document.
#[derive(Default)]
pub struct LoggingSink {
    applied: AtomicUsize,
}

impl LoggingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlSink for LoggingSink {
    async fn apply(&self, action: InteractiveAction) -> Result<(), EngineError> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        info!(target = "mirror.source", ?action, "remote action");
        Ok(())
    }
}

/// Fans locally typed actions out to whoever listens on the mirror.
#[derive(Default)]
pub struct LineInteractions {
    next_id: AtomicUsize,
    listeners: Arc<Mutex<Vec<(usize, ActionFn)>>>,
}

impl LineInteractions {
    /// Returns false when no listener is installed.
    pub fn dispatch(&self, action: InteractiveAction) -> bool {
        let listeners: Vec<ActionFn> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &listeners {
            handler(action.clone());
        }
        !listeners.is_empty()
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.lock().is_empty()
    }
}

impl InteractionSource for LineInteractions {
    fn listen(&self, handler: ActionFn) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, handler));
        let listeners = Arc::clone(&self.listeners);
        ListenerHandle::new(move || {
            listeners.lock().retain(|(existing, _)| *existing != id);
        })
    }
}

/// Writes each replayed event to `out` as one JSON line.
pub struct ConsoleReplayer {
    out: Mutex<Box<dyn Write + Send>>,
    interactions: Arc<LineInteractions>,
    interactive: AtomicBool,
}

impl ConsoleReplayer {
    pub fn new(out: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            out: Mutex::new(out),
            interactions: Arc::new(LineInteractions::default()),
            interactive: AtomicBool::new(false),
        })
    }

    pub fn stdout() -> Arc<Self> {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn interactions(&self) -> Arc<LineInteractions> {
        Arc::clone(&self.interactions)
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::SeqCst)
    }

    fn write_line(&self, value: &Value) -> Result<(), EngineError> {
        let mut out = self.out.lock();
        writeln!(out, "{value}")
            .and_then(|_| out.flush())
            .map_err(|err| EngineError::Replayer(err.to_string()))
    }
}

#[async_trait]
impl Replayer for ConsoleReplayer {
    async fn enable_interact(&self) -> Result<(), EngineError> {
        self.interactive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_interact(&self) -> Result<(), EngineError> {
        self.interactive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn mirror(&self) -> Arc<dyn InteractionSource> {
        self.interactions.clone()
    }

    fn add_event(&self, event: RecordedEvent) -> Result<(), EngineError> {
        match event.get("type").and_then(Value::as_str) {
            Some("snapshot") => {
                if let Some(lines) = event.get("lines").and_then(Value::as_array) {
                    for line in lines {
                        self.write_line(line)?;
                    }
                }
                Ok(())
            }
            Some("line") => self.write_line(event.get("data").unwrap_or(&Value::Null)),
            Some("custom") => {
                debug!(target = "mirror.viewer", tag = ?event.get("tag"), "custom event");
                Ok(())
            }
            _ => self.write_line(&event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().clone())
                .unwrap()
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    fn collecting_emit() -> (EmitFn, Arc<Mutex<Vec<RecordedEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |event| sink.lock().push(event)), seen)
    }

    #[test]
    fn lines_parse_as_json_or_text() {
        assert_eq!(parse_line(r#"{"a":1}"#), Some(json!({ "a": 1 })));
        assert_eq!(parse_line("  hello "), Some(json!("hello")));
        assert_eq!(parse_line("   "), None);
    }

    #[tokio::test]
    async fn each_run_opens_with_a_snapshot() {
        let recorder = LineRecorder::new();
        recorder.push(json!("before"));

        let (emit, seen) = collecting_emit();
        let handle = recorder
            .record(&RecordOptions::default(), emit)
            .await
            .unwrap();
        recorder.push(json!("during"));
        assert_eq!(
            *seen.lock(),
            vec![
                json!({ "type": "snapshot", "lines": ["before"] }),
                json!({ "type": "line", "data": "during" }),
            ]
        );

        handle.stop();
        assert!(!recorder.is_recording());
        recorder.push(json!("after"));
        assert_eq!(seen.lock().len(), 2);

        let (emit, seen) = collecting_emit();
        let _handle = recorder
            .record(&RecordOptions::default(), emit)
            .await
            .unwrap();
        assert_eq!(
            seen.lock()[0],
            json!({ "type": "snapshot", "lines": ["before", "during", "after"] })
        );
    }

    #[tokio::test]
    async fn custom_events_need_an_active_run() {
        let recorder = LineRecorder::new();
        let err = recorder
            .add_custom_event(CustomEventTag::AcceptRemoteControl, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Recorder(_)));

        let (emit, seen) = collecting_emit();
        let _handle = recorder
            .record(&RecordOptions::default(), emit)
            .await
            .unwrap();
        recorder
            .add_custom_event(CustomEventTag::AcceptRemoteControl, Value::Null)
            .await
            .unwrap();
        assert_eq!(seen.lock()[1]["tag"], json!("accept_remote_control"));
    }

    #[test]
    fn replayer_prints_snapshot_lines_then_updates() {
        let buf = SharedBuf::default();
        let replayer = ConsoleReplayer::new(Box::new(buf.clone()));
        replayer
            .add_event(json!({ "type": "snapshot", "lines": ["a", { "b": 2 }] }))
            .unwrap();
        replayer
            .add_event(json!({ "type": "line", "data": "c" }))
            .unwrap();
        replayer
            .add_event(json!({ "type": "custom", "tag": "accept_remote_control" }))
            .unwrap();
        assert_eq!(buf.lines(), vec![r#""a""#, r#"{"b":2}"#, r#""c""#]);
    }

    #[test]
    fn interactions_reach_only_installed_listeners() {
        let interactions = LineInteractions::default();
        let action = InteractiveAction::PointerMove { x: 1.0, y: 2.0 };
        assert!(!interactions.dispatch(action.clone()));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = interactions.listen(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(interactions.dispatch(action.clone()));
        handle.remove();
        assert!(!interactions.dispatch(action));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
