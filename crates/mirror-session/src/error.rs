use mirror_proto::ProtoError;
use mirror_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer full ({capacity} unacknowledged events)")]
    Full { capacity: usize },
}

/// Failures reported by the recording or replay engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("recorder failed: {0}")]
    Recorder(String),
    #[error("replayer failed: {0}")]
    Replayer(String),
    #[error("control sink failed: {0}")]
    Control(String),
}

#[derive(Debug, Error)]
pub enum MachineError {
    /// A required collaborator is missing; the transition is abandoned.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("machine service stopped")]
    ServiceStopped,
}

pub type MachineResult<T> = Result<T, MachineError>;
