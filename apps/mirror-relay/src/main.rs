use anyhow::Context;
use clap::Parser;
use mirror_relay::{serve, RelayServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mirror-relay", about = "Relay for mirror source and viewer peers")]
struct Cli {
    /// Interface to listen on
    #[arg(long, env = "MIRROR_RELAY_BIND", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "MIRROR_RELAY_PORT", default_value_t = 9000)]
    port: u16,

    /// Path prefix in front of /peers/{address}
    #[arg(long, env = "MIRROR_RELAY_PATH", default_value = "/")]
    path: String,

    /// Shared key peers must present
    #[arg(long, env = "MIRROR_RELAY_KEY")]
    key: Option<String>,
}

impl From<Cli> for RelayServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            host: cli.host,
            port: cli.port,
            path: cli.path,
            key: cli.key.filter(|key| !key.is_empty()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = RelayServerConfig::from(Cli::parse());
    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    serve(listener, config).await
}
