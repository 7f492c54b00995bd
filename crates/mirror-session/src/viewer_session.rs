use std::sync::Arc;

use async_trait::async_trait;
use mirror_transport::PeerTransport;
use tracing::info;

use crate::error::MachineResult;
use crate::machine::{Definition, Machine, MachineEvent, Transition, TransitionOf};

/// Teardown run when the source stops streaming.
pub type StopCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerSessionState {
    Idle,
    WaitingFirstRecord,
    Connected,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerSessionEvent {
    SourceReady,
    FirstRecord,
    Stop,
    Reset,
}

impl MachineEvent for ViewerSessionEvent {
    type Kind = ViewerSessionEvent;

    fn kind(&self) -> Self {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerSessionAction {
    RequestStream,
    OnStop,
}

#[derive(Clone)]
pub struct ViewerSessionContext {
    pub transport: Arc<PeerTransport>,
    pub on_stop: StopCallback,
}

pub struct ViewerSessionMachine;

static TABLE: &[TransitionOf<ViewerSessionMachine>] = &[
    Transition {
        from: ViewerSessionState::Idle,
        on: ViewerSessionEvent::SourceReady,
        to: ViewerSessionState::WaitingFirstRecord,
        actions: &[ViewerSessionAction::RequestStream],
    },
    Transition {
        from: ViewerSessionState::WaitingFirstRecord,
        on: ViewerSessionEvent::FirstRecord,
        to: ViewerSessionState::Connected,
        actions: &[],
    },
    Transition {
        from: ViewerSessionState::Connected,
        on: ViewerSessionEvent::Stop,
        to: ViewerSessionState::Stopped,
        actions: &[ViewerSessionAction::OnStop],
    },
    Transition {
        from: ViewerSessionState::Stopped,
        on: ViewerSessionEvent::Reset,
        to: ViewerSessionState::Idle,
        actions: &[],
    },
];

impl ViewerSessionMachine {
    pub fn machine(transport: Arc<PeerTransport>, on_stop: StopCallback) -> Machine<Self> {
        Machine::new(Self, ViewerSessionContext { transport, on_stop })
    }
}

#[async_trait]
impl Definition for ViewerSessionMachine {
    type State = ViewerSessionState;
    type Event = ViewerSessionEvent;
    type Action = ViewerSessionAction;
    type Context = ViewerSessionContext;

    const NAME: &'static str = "viewer_session";

    fn initial() -> ViewerSessionState {
        ViewerSessionState::Idle
    }

    fn table() -> &'static [TransitionOf<Self>] {
        TABLE
    }

    async fn execute(
        &self,
        action: ViewerSessionAction,
        context: ViewerSessionContext,
        _event: &ViewerSessionEvent,
    ) -> MachineResult<ViewerSessionContext> {
        match action {
            ViewerSessionAction::RequestStream => {
                context.transport.send_start().await?;
            }
            ViewerSessionAction::OnStop => {
                info!(
                    target = "mirror.viewer",
                    session = %context.transport.session(),
                    "source stopped streaming"
                );
                (context.on_stop)();
            }
        }
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{collect, recv, transport_pair};
    use mirror_proto::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_stop() -> (StopCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback: StopCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[tokio::test]
    async fn first_record_in_idle_is_ignored() {
        let (_source, viewer, _hub) = transport_pair("v1");
        let (on_stop, _) = counting_stop();
        let mut machine = ViewerSessionMachine::machine(viewer, on_stop);
        machine.dispatch(ViewerSessionEvent::FirstRecord).await.unwrap();
        assert_eq!(machine.state(), ViewerSessionState::Idle);
    }

    #[tokio::test]
    async fn full_cycle_requests_stream_and_runs_teardown_once() {
        let (source, viewer, _hub) = transport_pair("v2");
        let mut starts = collect(&source, EventKind::Start);
        let (on_stop, stops) = counting_stop();
        let mut machine = ViewerSessionMachine::machine(viewer, on_stop);

        machine.dispatch(ViewerSessionEvent::SourceReady).await.unwrap();
        assert_eq!(machine.state(), ViewerSessionState::WaitingFirstRecord);
        assert_eq!(recv(&mut starts).await.event, EventKind::Start);

        machine.dispatch(ViewerSessionEvent::FirstRecord).await.unwrap();
        assert_eq!(machine.state(), ViewerSessionState::Connected);

        machine.dispatch(ViewerSessionEvent::Stop).await.unwrap();
        machine.dispatch(ViewerSessionEvent::Stop).await.unwrap();
        assert_eq!(machine.state(), ViewerSessionState::Stopped);
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        machine.dispatch(ViewerSessionEvent::Reset).await.unwrap();
        assert_eq!(machine.state(), ViewerSessionState::Idle);
    }
}
