use std::time::Duration;

use mirror_proto::ProtoError;
use thiserror::Error;

/// Failures of the underlying peer-link primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("address {0} is already bound")]
    AddressInUse(String),
    #[error("peer {0} is not reachable")]
    PeerUnavailable(String),
    #[error("connection did not open within {0:?}")]
    OpenTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("link failed: {0}")]
    Failed(String),
    #[error("link setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link bound to {actual} but role expects {expected}")]
    AddressMismatch { expected: String, actual: String },
    #[error("timed out after {0:?} connecting to counterpart")]
    ConnectTimeout(Duration),
    #[error("channel to {remote} did not open within {waited:?}")]
    NotOpen { remote: String, waited: Duration },
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

pub type TransportResult<T> = Result<T, TransportError>;
