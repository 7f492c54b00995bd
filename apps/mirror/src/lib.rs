//! Command-line peers for mirroring a live session over a relay.

pub mod app;
pub mod cli;
pub mod config;
pub mod console;
pub mod telemetry;
