//! Mirror session runtime shared by the source and viewer peers.
//!
//! Responsibilities:
//! - buffering recorded events until the viewer acknowledges them
//! - driving the session and remote-control state machines for both roles
//! - wiring inbound envelopes to those machines and to the replay engine

pub mod buffer;
pub mod engine;
pub mod error;
pub mod machine;
pub mod mock;
pub mod source;
pub mod source_control;
pub mod source_session;
pub mod viewer;
pub mod viewer_control;
pub mod viewer_session;

pub use buffer::{BufferStats, SourceBuffer};
pub use engine::{
    ActionFn, ControlSink, EmitFn, InteractionSource, ListenerHandle, RecordOptions, Recorder,
    RecordingHandle, Replayer,
};
pub use error::{BufferError, EngineError, MachineError, MachineResult};
pub use machine::{Outcome, Service, ServiceHandle};
pub use source::{SourceOptions, SourceSession};
pub use source_control::SourceControlState;
pub use source_session::SourceSessionState;
pub use viewer::ViewerSession;
pub use viewer_control::ViewerControlState;
pub use viewer_session::{StopCallback, ViewerSessionState};
