//! Seams to the DOM recording and replay engines.

use std::sync::Arc;

use async_trait::async_trait;
use mirror_proto::{CustomEventTag, InteractiveAction, RecordedEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Receives every recorded event, in recording order.
pub type EmitFn = Arc<dyn Fn(RecordedEvent) + Send + Sync>;

/// Receives every local interactive action while control is held.
pub type ActionFn = Arc<dyn Fn(InteractiveAction) + Send + Sync>;

/// Privacy and rendering options handed to the recorder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_text_class: Option<String>,
    #[serde(default)]
    pub inline_stylesheet: bool,
}

/// Stops the attached recording when stopped or dropped.
pub struct RecordingHandle {
    stop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RecordingHandle {
    pub fn new(stop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        self.halt();
    }
}

impl std::fmt::Debug for RecordingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingHandle")
            .field("active", &self.stop.is_some())
            .finish()
    }
}

/// Removes an installed interaction listener when stopped or dropped.
pub struct ListenerHandle {
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new(teardown: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn remove(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("installed", &self.teardown.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Recorder: Send + Sync {
    /// Starts a recording run; `emit` is called once per recorded event.
    async fn record(
        &self,
        options: &RecordOptions,
        emit: EmitFn,
    ) -> Result<RecordingHandle, EngineError>;

    /// Writes a custom marker into the active recording stream.
    async fn add_custom_event(&self, tag: CustomEventTag, payload: Value)
    -> Result<(), EngineError>;
}

/// Source of local interactive actions on the replayed mirror.
pub trait InteractionSource: Send + Sync {
    fn listen(&self, handler: ActionFn) -> ListenerHandle;
}

#[async_trait]
pub trait Replayer: Send + Sync {
    async fn enable_interact(&self) -> Result<(), EngineError>;
    async fn disable_interact(&self) -> Result<(), EngineError>;
    fn mirror(&self) -> Arc<dyn InteractionSource>;
    /// Feeds one recorded event into the replay.
    fn add_event(&self, event: RecordedEvent) -> Result<(), EngineError>;
}

/// Applies remote interactive actions to the source's live document.
#[async_trait]
pub trait ControlSink: Send + Sync {
    async fn apply(&self, action: InteractiveAction) -> Result<(), EngineError>;
}
