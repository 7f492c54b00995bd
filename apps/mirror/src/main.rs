use clap::Parser;
use mirror_cli::app::{self, SourceRun};
use mirror_cli::cli::{Cli, Command};
use mirror_cli::config::Config;
use mirror_cli::console::{ConsoleReplayer, LineRecorder, LoggingSink};
use mirror_cli::telemetry;
use mirror_proto::{Role, SessionId};
use mirror_session::SourceOptions;
use tokio::io::BufReader;

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_config())?;
    let config = cli.config(Config::from_env());
    let input = BufReader::new(tokio::io::stdin());

    match cli.command {
        Command::Source {
            session,
            allow_control,
            ..
        } => {
            let session = SessionId::new(session);
            let transport = app::relay_transport(&config, &session, Role::Source).await?;
            eprintln!("source ready for session {session}; type lines to stream them");
            let run = SourceRun {
                recorder: LineRecorder::new(),
                sink: LoggingSink::new(),
                options: SourceOptions {
                    buffer_capacity: config.buffer_capacity,
                    ..SourceOptions::default()
                },
                allow_control,
            };
            app::run_source(transport, run, input, shutdown_signal()).await
        }
        Command::Viewer { session, control } => {
            let session = SessionId::new(session);
            let transport = app::relay_transport(&config, &session, Role::Viewer).await?;
            eprintln!("viewing session {session}");
            app::run_viewer(
                transport,
                ConsoleReplayer::stdout(),
                control,
                input,
                shutdown_signal(),
            )
            .await
        }
    }
}
