use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Config;
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "mirror", about = "Stream a live session from a source to a viewer")]
pub struct Cli {
    #[arg(long, value_enum, env = "MIRROR_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long, env = "MIRROR_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub relay: RelayArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Overrides for the `MIRROR_RELAY_*` settings.
#[derive(Args, Debug, Default)]
pub struct RelayArgs {
    #[arg(long = "relay-host", global = true)]
    pub host: Option<String>,
    #[arg(long = "relay-port", global = true)]
    pub port: Option<u16>,
    #[arg(long = "relay-path", global = true)]
    pub path: Option<String>,
    #[arg(long = "relay-secure", global = true)]
    pub secure: bool,
    #[arg(long = "relay-key", global = true)]
    pub key: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record stdin lines and stream them to the viewer
    Source {
        session: String,
        /// Let the viewer take control when it asks
        #[arg(long)]
        allow_control: bool,
        /// Bound on events awaiting acknowledgment
        #[arg(long)]
        buffer_capacity: Option<usize>,
    },
    /// Print the source's stream; stdin lines are sent as actions while in control
    Viewer {
        session: String,
        /// Request control once the stream is live
        #[arg(long)]
        control: bool,
    },
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }

    /// Environment configuration with command-line overrides applied.
    pub fn config(&self, mut base: Config) -> Config {
        let relay = &self.relay;
        if let Some(host) = &relay.host {
            base.relay.host = host.clone();
        }
        if let Some(port) = relay.port {
            base.relay.port = port;
        }
        if let Some(path) = &relay.path {
            base.relay.path = path.clone();
        }
        if relay.secure {
            base.relay.secure = true;
        }
        if let Some(key) = &relay.key {
            base.relay.key = key.clone();
        }
        if let Command::Source {
            buffer_capacity: Some(capacity),
            ..
        } = &self.command
        {
            base.buffer_capacity = Some(*capacity).filter(|capacity| *capacity > 0);
        }
        base
    }
}
