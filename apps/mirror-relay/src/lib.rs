//! WebSocket relay carrying peer-link frames between registered addresses.

pub mod config;
pub mod server;

pub use config::RelayServerConfig;
pub use server::{router, serve, RelayState};
