use std::sync::Arc;

use async_trait::async_trait;
use mirror_proto::{InteractiveAction, RemoteControl};
use mirror_transport::PeerTransport;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ListenerHandle, Replayer};
use crate::error::{MachineError, MachineResult};
use crate::machine::{Definition, Machine, MachineEvent, Transition, TransitionOf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerControlState {
    NotControl,
    Requested,
    Controlling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerControlKind {
    Request,
    Accepted,
    StopControl,
}

pub enum ViewerControlEvent {
    Request,
    /// The source granted control; interaction is mirrored through `replayer`.
    Accepted {
        replayer: Option<Arc<dyn Replayer>>,
    },
    StopControl,
}

impl MachineEvent for ViewerControlEvent {
    type Kind = ViewerControlKind;

    fn kind(&self) -> ViewerControlKind {
        match self {
            ViewerControlEvent::Request => ViewerControlKind::Request,
            ViewerControlEvent::Accepted { .. } => ViewerControlKind::Accepted,
            ViewerControlEvent::StopControl => ViewerControlKind::StopControl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerControlAction {
    Request,
    Accepted,
    StopControl,
}

/// Mirror listener installed while controlling, plus its forwarder task.
pub struct ControlForwarding {
    listener: Mutex<Option<ListenerHandle>>,
    forwarder: JoinHandle<()>,
}

impl ControlForwarding {
    fn teardown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.remove();
        }
        self.forwarder.abort();
    }
}

impl Drop for ControlForwarding {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[derive(Clone)]
pub struct ViewerControlContext {
    pub transport: Arc<PeerTransport>,
    pub replayer: Option<Arc<dyn Replayer>>,
    pub forwarding: Option<Arc<ControlForwarding>>,
}

impl ViewerControlContext {
    pub fn new(transport: Arc<PeerTransport>) -> Self {
        Self {
            transport,
            replayer: None,
            forwarding: None,
        }
    }
}

pub struct ViewerControlMachine;

static TABLE: &[TransitionOf<ViewerControlMachine>] = &[
    Transition {
        from: ViewerControlState::NotControl,
        on: ViewerControlKind::Request,
        to: ViewerControlState::Requested,
        actions: &[ViewerControlAction::Request],
    },
    Transition {
        from: ViewerControlState::Requested,
        on: ViewerControlKind::Accepted,
        to: ViewerControlState::Controlling,
        actions: &[ViewerControlAction::Accepted],
    },
    Transition {
        from: ViewerControlState::Controlling,
        on: ViewerControlKind::StopControl,
        to: ViewerControlState::NotControl,
        actions: &[ViewerControlAction::StopControl],
    },
];

impl ViewerControlMachine {
    pub fn machine(transport: Arc<PeerTransport>) -> Machine<Self> {
        Machine::new(Self, ViewerControlContext::new(transport))
    }
}

#[async_trait]
impl Definition for ViewerControlMachine {
    type State = ViewerControlState;
    type Event = ViewerControlEvent;
    type Action = ViewerControlAction;
    type Context = ViewerControlContext;

    const NAME: &'static str = "viewer_control";

    fn initial() -> ViewerControlState {
        ViewerControlState::NotControl
    }

    fn table() -> &'static [TransitionOf<Self>] {
        TABLE
    }

    async fn execute(
        &self,
        action: ViewerControlAction,
        mut context: ViewerControlContext,
        event: &ViewerControlEvent,
    ) -> MachineResult<ViewerControlContext> {
        match action {
            ViewerControlAction::Request => {
                context
                    .transport
                    .send_remote_control(RemoteControl::Request)
                    .await?;
            }
            ViewerControlAction::Accepted => {
                let replayer = match event {
                    ViewerControlEvent::Accepted {
                        replayer: Some(replayer),
                    } => Arc::clone(replayer),
                    _ => {
                        return Err(MachineError::Configuration(
                            "replayer must be initialised before taking control".into(),
                        ));
                    }
                };
                replayer.enable_interact().await?;
                let forwarding = forward_interactions(&context.transport, replayer.as_ref());
                context.replayer = Some(replayer);
                context.forwarding = Some(Arc::new(forwarding));
                info!(
                    target = "mirror.viewer",
                    session = %context.transport.session(),
                    "remote control granted"
                );
            }
            ViewerControlAction::StopControl => {
                let replayer = context.replayer.clone().ok_or_else(|| {
                    MachineError::Configuration(
                        "replayer must be initialised before releasing control".into(),
                    )
                })?;
                context
                    .transport
                    .send_remote_control(RemoteControl::Stop)
                    .await?;
                replayer.disable_interact().await?;
                if let Some(forwarding) = context.forwarding.take() {
                    forwarding.teardown();
                }
                info!(
                    target = "mirror.viewer",
                    session = %context.transport.session(),
                    "remote control released"
                );
            }
        }
        Ok(context)
    }
}

fn forward_interactions(transport: &Arc<PeerTransport>, replayer: &dyn Replayer) -> ControlForwarding {
    let (tx, mut rx) = mpsc::unbounded_channel::<InteractiveAction>();
    let transport = Arc::clone(transport);
    let forwarder = tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            if let Err(err) = transport
                .send_remote_control(RemoteControl::Action(action))
                .await
            {
                warn!(target = "mirror.viewer", error = %err, "failed to forward interaction");
            }
        }
        debug!(target = "mirror.viewer", "interaction forwarder finished");
    });
    let listener = replayer.mirror().listen(Arc::new(move |action| {
        let _ = tx.send(action);
    }));
    ControlForwarding {
        listener: Mutex::new(Some(listener)),
        forwarder,
    }
}
