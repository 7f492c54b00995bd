//! Drives one source or viewer peer until shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use mirror_proto::{InteractiveAction, Role, SessionId};
use mirror_session::{
    ControlSink, SourceControlState, SourceOptions, SourceSession, StopCallback,
    ViewerControlState, ViewerSession, ViewerSessionState,
};
use mirror_transport::PeerTransport;
use mirror_transport::relay::RelayLink;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::console::{ConsoleReplayer, LineRecorder, parse_line};

/// Registers `role` for `session` with the relay and binds a transport to it.
pub async fn relay_transport(
    config: &Config,
    session: &SessionId,
    role: Role,
) -> anyhow::Result<Arc<PeerTransport>> {
    let address = session.address(role);
    let link = RelayLink::connect(&config.relay, address.clone())
        .await
        .with_context(|| {
            format!(
                "failed to register {address} with relay {}:{}",
                config.relay.host, config.relay.port
            )
        })?;
    let transport =
        PeerTransport::bind(session.clone(), role, Arc::new(link), config.transport.clone())?;
    Ok(Arc::new(transport))
}

pub struct SourceRun {
    pub recorder: Arc<LineRecorder>,
    pub sink: Arc<dyn ControlSink>,
    pub options: SourceOptions,
    /// Grant control to the viewer whenever it asks.
    pub allow_control: bool,
}

/// Streams `input` lines to the viewer until `shutdown` resolves. Input EOF
/// keeps the session alive so a late viewer still gets the snapshot.
pub async fn run_source<R>(
    transport: Arc<PeerTransport>,
    run: SourceRun,
    input: R,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let session = SourceSession::new(
        transport,
        run.recorder.clone(),
        run.sink,
        run.options,
    );
    let mut control = session.subscribe_control();

    if let Err(err) = session.start().await {
        warn!(target = "mirror.source", error = %err, "viewer not reachable yet; waiting for it");
    }

    let mut lines = input.lines();
    let mut input_open = true;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line(), if input_open => match line.context("failed to read input")? {
                Some(line) => {
                    if let Some(event) = parse_line(&line) {
                        run.recorder.push(event);
                    }
                }
                None => {
                    info!(target = "mirror.source", "input closed; still serving the viewer");
                    input_open = false;
                }
            },
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *control.borrow_and_update();
                if state != SourceControlState::Requesting {
                    continue;
                }
                if run.allow_control {
                    session.accept_control().await?;
                    info!(target = "mirror.source", "viewer took control");
                } else {
                    warn!(target = "mirror.source", "viewer asked for control; pass --allow-control to grant it");
                }
            }
        }
    }

    // The viewer may already be gone; shutdown still completes locally.
    if session.control_state() == SourceControlState::Controlled {
        if let Err(err) = session.revoke_control().await {
            warn!(target = "mirror.source", error = %err, "could not revoke control");
        }
    }
    if let Err(err) = session.stop().await {
        warn!(target = "mirror.source", error = %err, "could not notify viewer of stop");
    }
    info!(target = "mirror.source", stats = ?session.buffer_stats(), "source stopped");
    Ok(())
}

/// Prints the replayed stream until `shutdown` resolves. While control is
/// held, `input` lines are parsed as interactive actions and forwarded.
pub async fn run_viewer<R>(
    transport: Arc<PeerTransport>,
    replayer: Arc<ConsoleReplayer>,
    want_control: bool,
    input: R,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let on_stop: StopCallback = Arc::new(|| {
        info!(target = "mirror.viewer", "source stopped streaming");
    });
    let session = ViewerSession::new(transport, replayer.clone(), on_stop);
    let mut state = session.subscribe_state();

    if let Err(err) = session.announce().await {
        warn!(target = "mirror.viewer", error = %err, "source not reachable yet; waiting for it");
    }

    let interactions = replayer.interactions();
    let mut lines = input.lines();
    let mut input_open = true;
    let mut requested = false;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                debug!(target = "mirror.viewer", state = ?current, "session state");
                if current == ViewerSessionState::Connected && want_control && !requested {
                    session.request_control().await?;
                    requested = true;
                }
            }
            line = lines.next_line(), if input_open => match line.context("failed to read input")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match serde_json::from_str::<InteractiveAction>(line.trim()) {
                    Ok(action) => {
                        if !interactions.dispatch(action) {
                            debug!(target = "mirror.viewer", "not in control; action dropped");
                        }
                    }
                    Err(err) => warn!(target = "mirror.viewer", error = %err, "unrecognised action"),
                },
                None => input_open = false,
            },
        }
    }

    if session.control_state() == ViewerControlState::Controlling {
        if let Err(err) = session.stop_control().await {
            warn!(target = "mirror.viewer", error = %err, "could not hand control back");
        }
    }
    Ok(())
}
