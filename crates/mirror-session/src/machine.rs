//! Table-driven state machines and the per-instance dispatcher that runs them.
//!
//! A [`Definition`] lists `(state, event kind) -> (next state, actions)` rows.
//! [`Machine::dispatch`] finds the row for the current state, runs its actions
//! in order over a copy of the context, and commits the new state and context
//! only when every action succeeded. Events with no row are ignored.
//!
//! [`Service`] wraps a machine in a task fed by a FIFO queue so transitions of
//! one instance never interleave.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::error::{MachineError, MachineResult};

pub trait MachineEvent: Send + Sync + 'static {
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug)]
pub struct Transition<S: 'static, K, A: 'static> {
    pub from: S,
    pub on: K,
    pub to: S,
    pub actions: &'static [A],
}

pub type TransitionOf<D> = Transition<
    <D as Definition>::State,
    <<D as Definition>::Event as MachineEvent>::Kind,
    <D as Definition>::Action,
>;

#[async_trait]
pub trait Definition: Send + Sync + 'static {
    type State: Copy + Eq + Debug + Send + Sync + 'static;
    type Event: MachineEvent;
    type Action: Copy + Debug + Send + Sync + 'static;
    type Context: Clone + Send + Sync + 'static;

    const NAME: &'static str;

    fn initial() -> Self::State;

    fn table() -> &'static [TransitionOf<Self>];

    /// Runs one action against `context`, returning the context the next
    /// action (or the commit) sees.
    async fn execute(
        &self,
        action: Self::Action,
        context: Self::Context,
        event: &Self::Event,
    ) -> MachineResult<Self::Context>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<S> {
    Transitioned { from: S, to: S },
    Ignored { state: S },
}

pub struct Machine<D: Definition> {
    definition: D,
    state: D::State,
    context: D::Context,
}

impl<D: Definition> Machine<D> {
    pub fn new(definition: D, context: D::Context) -> Self {
        Self {
            definition,
            state: D::initial(),
            context,
        }
    }

    pub fn state(&self) -> D::State {
        self.state
    }

    pub fn context(&self) -> &D::Context {
        &self.context
    }

    pub async fn dispatch(&mut self, event: D::Event) -> MachineResult<Outcome<D::State>> {
        let kind = event.kind();
        let from = self.state;
        let Some(transition) = D::table()
            .iter()
            .find(|row| row.from == from && row.on == kind)
        else {
            debug!(
                target = "mirror.machine",
                machine = D::NAME,
                state = ?from,
                event = ?kind,
                "event ignored in current state"
            );
            return Ok(Outcome::Ignored { state: from });
        };

        let mut context = self.context.clone();
        for action in transition.actions {
            trace!(
                target = "mirror.machine",
                machine = D::NAME,
                action = ?action,
                "running action"
            );
            context = match self.definition.execute(*action, context, &event).await {
                Ok(context) => context,
                Err(err) => {
                    warn!(
                        target = "mirror.machine",
                        machine = D::NAME,
                        state = ?from,
                        event = ?kind,
                        action = ?action,
                        error = %err,
                        "action failed; transition abandoned"
                    );
                    return Err(err);
                }
            };
        }

        self.state = transition.to;
        self.context = context;
        debug!(
            target = "mirror.machine",
            machine = D::NAME,
            from = ?from,
            to = ?transition.to,
            event = ?kind,
            "transition"
        );
        Ok(Outcome::Transitioned {
            from,
            to: transition.to,
        })
    }
}

type Reply<S> = oneshot::Sender<MachineResult<Outcome<S>>>;

struct Command<D: Definition> {
    event: D::Event,
    reply: Option<Reply<D::State>>,
}

/// Runs a [`Machine`] on its own task.
pub struct Service;

impl Service {
    /// Must be called inside a Tokio runtime. The task ends once every
    /// [`ServiceHandle`] is dropped.
    pub fn spawn<D: Definition>(machine: Machine<D>) -> ServiceHandle<D> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<D>>();
        let (state_tx, state_rx) = watch::channel(machine.state());
        let mut machine = machine;
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let result = machine.dispatch(command.event).await;
                state_tx.send_if_modified(|state| {
                    let changed = *state != machine.state();
                    *state = machine.state();
                    changed
                });
                match command.reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            warn!(
                                target = "mirror.machine",
                                machine = D::NAME,
                                error = %err,
                                "queued event failed"
                            );
                        }
                    }
                }
            }
            trace!(target = "mirror.machine", machine = D::NAME, "service stopped");
        });
        ServiceHandle { tx, state: state_rx }
    }
}

pub struct ServiceHandle<D: Definition> {
    tx: mpsc::UnboundedSender<Command<D>>,
    state: watch::Receiver<D::State>,
}

impl<D: Definition> Clone for ServiceHandle<D> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            state: self.state.clone(),
        }
    }
}

impl<D: Definition> ServiceHandle<D> {
    /// Queues `event` without waiting; failures are logged by the service.
    pub fn send(&self, event: D::Event) {
        if self
            .tx
            .send(Command {
                event,
                reply: None,
            })
            .is_err()
        {
            debug!(
                target = "mirror.machine",
                machine = D::NAME,
                "event dropped; service stopped"
            );
        }
    }

    /// Queues `event` and waits for its outcome.
    pub async fn dispatch(&self, event: D::Event) -> MachineResult<Outcome<D::State>> {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(Command {
                event,
                reply: Some(reply),
            })
            .map_err(|_| MachineError::ServiceStopped)?;
        outcome.await.map_err(|_| MachineError::ServiceStopped)?
    }

    pub fn state(&self) -> D::State {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<D::State> {
        self.state.clone()
    }

    /// Resolves once the machine reaches `target`.
    pub async fn wait_for(&self, target: D::State) -> MachineResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| MachineError::ServiceStopped)
    }
}
