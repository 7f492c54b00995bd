use std::sync::Arc;

use async_trait::async_trait;
use mirror_proto::{CustomEventTag, RemoteControl};
use mirror_transport::PeerTransport;
use serde_json::Value;
use tracing::info;

use crate::engine::Recorder;
use crate::error::MachineResult;
use crate::machine::{Definition, Machine, MachineEvent, Transition, TransitionOf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceControlState {
    NotControl,
    Requesting,
    Controlled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceControlEvent {
    Request,
    Accept,
    Stop,
}

impl MachineEvent for SourceControlEvent {
    type Kind = SourceControlEvent;

    fn kind(&self) -> Self {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceControlAction {
    /// Marks the handoff in the recording stream.
    Accept,
    NotifyAccept,
}

#[derive(Clone)]
pub struct SourceControlContext {
    pub transport: Arc<PeerTransport>,
    pub recorder: Arc<dyn Recorder>,
}

pub struct SourceControlMachine;

static TABLE: &[TransitionOf<SourceControlMachine>] = &[
    Transition {
        from: SourceControlState::NotControl,
        on: SourceControlEvent::Request,
        to: SourceControlState::Requesting,
        actions: &[],
    },
    Transition {
        from: SourceControlState::Requesting,
        on: SourceControlEvent::Accept,
        to: SourceControlState::Controlled,
        actions: &[SourceControlAction::Accept, SourceControlAction::NotifyAccept],
    },
    Transition {
        from: SourceControlState::Controlled,
        on: SourceControlEvent::Stop,
        to: SourceControlState::NotControl,
        actions: &[],
    },
];

impl SourceControlMachine {
    pub fn machine(transport: Arc<PeerTransport>, recorder: Arc<dyn Recorder>) -> Machine<Self> {
        Machine::new(
            Self,
            SourceControlContext {
                transport,
                recorder,
            },
        )
    }
}

#[async_trait]
impl Definition for SourceControlMachine {
    type State = SourceControlState;
    type Event = SourceControlEvent;
    type Action = SourceControlAction;
    type Context = SourceControlContext;

    const NAME: &'static str = "source_control";

    fn initial() -> SourceControlState {
        SourceControlState::NotControl
    }

    fn table() -> &'static [TransitionOf<Self>] {
        TABLE
    }

    async fn execute(
        &self,
        action: SourceControlAction,
        context: SourceControlContext,
        _event: &SourceControlEvent,
    ) -> MachineResult<SourceControlContext> {
        match action {
            SourceControlAction::Accept => {
                context
                    .recorder
                    .add_custom_event(CustomEventTag::AcceptRemoteControl, Value::Null)
                    .await?;
            }
            SourceControlAction::NotifyAccept => {
                context
                    .transport
                    .send_remote_control(RemoteControl::Accept)
                    .await?;
                info!(
                    target = "mirror.source",
                    session = %context.transport.session(),
                    "remote control accepted"
                );
            }
        }
        Ok(context)
    }
}
