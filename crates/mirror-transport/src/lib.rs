//! Role-addressed event channel between the source and viewer of a mirroring
//! session, layered over a pluggable [`PeerLink`].

mod config;
mod error;
mod handlers;
mod link;
mod memory;
mod transport;

#[cfg(feature = "relay")]
pub mod relay;

pub use config::TransportConfig;
pub use error::{LinkError, TransportError, TransportResult};
pub use handlers::{Handler, HandlerId, HandlerRegistry};
pub use link::{ConnectionDriver, LinkState, PeerConnection, PeerLink, connection};
pub use memory::{MemoryHub, MemoryLink, OpenPolicy};
pub use transport::{PeerTransport, TransportStatus};
