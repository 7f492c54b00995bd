//! In-process peer network for tests and single-process embeddings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::LinkError;
use crate::link::{
    self, ConnectionDriver, LinkState, PeerConnection, PeerLink, close_state, open_state,
};

/// When dialled connections become open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenPolicy {
    #[default]
    Immediate,
    After(Duration),
    /// Connections stay connecting until [`MemoryHub::open_pending`].
    Manual,
}

type StatePair = (Arc<watch::Sender<LinkState>>, Arc<watch::Sender<LinkState>>);

#[derive(Default)]
struct HubInner {
    peers: RwLock<HashMap<String, mpsc::UnboundedSender<Arc<PeerConnection>>>>,
    pending: Mutex<Vec<StatePair>>,
    policy: OpenPolicy,
}

/// Registry of bound addresses; at most one link per address.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_policy(policy: OpenPolicy) -> Self {
        Self {
            inner: Arc::new(HubInner {
                policy,
                ..HubInner::default()
            }),
        }
    }

    pub fn bind(&self, address: impl Into<String>) -> Result<MemoryLink, LinkError> {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut peers = self.inner.peers.write();
            if peers.contains_key(&address) {
                return Err(LinkError::AddressInUse(address));
            }
            peers.insert(address.clone(), tx);
        }
        debug!(target = "mirror.transport", %address, "memory link bound");
        Ok(MemoryLink {
            address,
            hub: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.inner.peers.read().contains_key(address)
    }

    /// Opens every connection held back by [`OpenPolicy::Manual`].
    pub fn open_pending(&self) -> usize {
        let pending: Vec<StatePair> = std::mem::take(&mut *self.inner.pending.lock());
        let mut opened = 0;
        for (local, remote) in pending {
            if open_state(&local) | open_state(&remote) {
                opened += 1;
            }
        }
        opened
    }

    fn unbind(&self, address: &str) {
        self.inner.peers.write().remove(address);
    }
}

pub struct MemoryLink {
    address: String,
    hub: MemoryHub,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<PeerConnection>>>,
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn local_address(&self) -> &str {
        &self.address
    }

    async fn dial(&self, remote: &str) -> Result<Arc<PeerConnection>, LinkError> {
        let listener = self
            .hub
            .inner
            .peers
            .read()
            .get(remote)
            .cloned()
            .ok_or_else(|| LinkError::PeerUnavailable(remote.to_string()))?;

        let (local_conn, local_driver) = link::connection(remote);
        let (remote_conn, remote_driver) = link::connection(self.address.clone());
        listener
            .send(remote_conn)
            .map_err(|_| LinkError::PeerUnavailable(remote.to_string()))?;

        let states = (
            Arc::clone(&local_driver.state),
            Arc::clone(&remote_driver.state),
        );
        splice(local_driver, remote_driver);
        match self.hub.inner.policy {
            OpenPolicy::Immediate => {
                open_state(&states.0);
                open_state(&states.1);
            }
            OpenPolicy::After(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    open_state(&states.0);
                    open_state(&states.1);
                });
            }
            OpenPolicy::Manual => self.hub.inner.pending.lock().push(states),
        }
        debug!(
            target = "mirror.transport",
            local = %self.address,
            %remote,
            "memory connection dialled"
        );
        Ok(local_conn)
    }

    async fn accept(&self) -> Option<Arc<PeerConnection>> {
        self.incoming.lock().await.recv().await
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.hub.unbind(&self.address);
    }
}

fn splice(a: ConnectionDriver, b: ConnectionDriver) {
    let ConnectionDriver {
        state: a_state,
        inbound: a_inbound,
        outbound: a_outbound,
        ..
    } = a;
    let ConnectionDriver {
        state: b_state,
        inbound: b_inbound,
        outbound: b_outbound,
        ..
    } = b;
    tokio::spawn(forward(
        a_outbound,
        b_inbound,
        Arc::clone(&a_state),
        Arc::clone(&b_state),
    ));
    tokio::spawn(forward(b_outbound, a_inbound, b_state, a_state));
}

async fn forward(
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    inbound: mpsc::UnboundedSender<Bytes>,
    from: Arc<watch::Sender<LinkState>>,
    to: Arc<watch::Sender<LinkState>>,
) {
    let mut watch = from.subscribe();
    if link::opened(&from).await && watch.borrow_and_update().is_open() {
        loop {
            tokio::select! {
                biased;
                message = outbound.recv() => match message {
                    Some(bytes) => {
                        if inbound.send(bytes).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                changed = watch.changed() => {
                    if changed.is_err() || !watch.borrow().is_open() {
                        break;
                    }
                }
            }
        }
    }
    close_state(&from);
    close_state(&to);
}
