use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mirror_proto::{Envelope, EventKind};
use parking_lot::RwLock;

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Envelope handlers keyed by event kind. Kinds with no handlers are no-ops.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut guard = self.handlers.write();
        for handlers in guard.values_mut() {
            if let Some(index) = handlers.iter().position(|(existing, _)| *existing == id) {
                handlers.remove(index);
                return true;
            }
        }
        false
    }

    /// Invokes every handler registered for the envelope's kind and returns how
    /// many ran. Handlers run outside the lock so they may register others.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&envelope.event)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(envelope);
        }
        handlers.len()
    }
}
