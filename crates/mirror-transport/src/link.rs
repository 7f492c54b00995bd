//! The external peer-channel primitive the transport is built on.
//!
//! A [`PeerLink`] is bound to one address and can dial other addresses or accept
//! connections dialled to it. Each side of a connection is a [`PeerConnection`];
//! the link implementation owns the matching [`ConnectionDriver`] and moves bytes
//! and state between the two.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
    Failed(String),
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed(_))
    }
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Address this link is bound to.
    fn local_address(&self) -> &str;

    /// Starts a connection to `remote`. The returned connection may still be
    /// [`LinkState::Connecting`].
    async fn dial(&self, remote: &str) -> Result<Arc<PeerConnection>, LinkError>;

    /// Next connection dialled to this address; `None` once the link is gone.
    async fn accept(&self) -> Option<Arc<PeerConnection>>;
}

/// One end of an ordered, bidirectional byte channel to a remote address.
#[derive(Debug)]
pub struct PeerConnection {
    remote: String,
    state: Arc<watch::Sender<LinkState>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

/// Link-side handle for a [`PeerConnection`].
#[derive(Debug)]
pub struct ConnectionDriver {
    pub remote: String,
    pub state: Arc<watch::Sender<LinkState>>,
    /// Bytes pushed here surface on the connection's inbound stream.
    pub inbound: mpsc::UnboundedSender<Bytes>,
    /// Bytes the connection owner sent.
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
}

/// Creates a connection in the `Connecting` state plus its driver.
pub fn connection(remote: impl Into<String>) -> (Arc<PeerConnection>, ConnectionDriver) {
    let remote = remote.into();
    let (state, _) = watch::channel(LinkState::Connecting);
    let state = Arc::new(state);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let connection = Arc::new(PeerConnection {
        remote: remote.clone(),
        state: Arc::clone(&state),
        outbound: outbound_tx,
        inbound: Mutex::new(Some(inbound_rx)),
    });
    let driver = ConnectionDriver {
        remote,
        state,
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (connection, driver)
}

impl PeerConnection {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Queues `payload` in send order. Bytes queued while connecting are
    /// flushed by the link once the connection opens.
    pub fn send(&self, payload: Bytes) -> Result<(), LinkError> {
        match &*self.state.borrow() {
            LinkState::Closed => return Err(LinkError::Closed),
            LinkState::Failed(reason) => return Err(LinkError::Failed(reason.clone())),
            _ => {}
        }
        self.outbound.send(payload).map_err(|_| LinkError::Closed)
    }

    /// The inbound byte stream; can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.lock().take()
    }

    pub fn close(&self) {
        close_state(&self.state);
    }

    /// Resolves when the connection is open; fails on close, failure or timeout.
    pub async fn wait_open(&self, timeout: Duration) -> Result<(), LinkError> {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|state| !matches!(state, LinkState::Connecting));
        let waited = tokio::time::timeout(timeout, settled)
            .await
            .map_err(|_| LinkError::OpenTimeout(timeout))?
            .map_err(|_| LinkError::Closed)?
            .clone();
        match waited {
            LinkState::Open => Ok(()),
            LinkState::Failed(reason) => Err(LinkError::Failed(reason)),
            _ => Err(LinkError::Closed),
        }
    }
}

impl ConnectionDriver {
    pub fn open(&self) -> bool {
        open_state(&self.state)
    }

    pub fn close(&self) -> bool {
        close_state(&self.state)
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = LinkState::Failed(reason);
            true
        })
    }
}

pub(crate) fn open_state(state: &watch::Sender<LinkState>) -> bool {
    state.send_if_modified(|current| {
        if *current != LinkState::Connecting {
            return false;
        }
        *current = LinkState::Open;
        true
    })
}

pub(crate) fn close_state(state: &watch::Sender<LinkState>) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            return false;
        }
        *current = LinkState::Closed;
        true
    })
}

/// Waits until `state` leaves `Connecting`; true when it became open.
pub(crate) async fn opened(state: &watch::Sender<LinkState>) -> bool {
    let mut rx = state.subscribe();
    match rx
        .wait_for(|current| !matches!(current, LinkState::Connecting))
        .await
    {
        Ok(current) => current.is_open(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn driver_controls_connection_state() {
        let (conn, driver) = connection("room-viewer");
        assert_eq!(conn.state(), LinkState::Connecting);
        assert!(driver.open());
        assert!(!driver.open(), "open only transitions from connecting");
        assert!(conn.is_open());
        conn.wait_open(Duration::from_millis(10))
            .await
            .expect("already open");

        conn.close();
        assert_eq!(conn.state(), LinkState::Closed);
        assert!(!driver.fail("late"), "terminal states are sticky");
        assert_eq!(conn.send(Bytes::from_static(b"x")), Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn bytes_flow_through_driver() {
        let (conn, mut driver) = connection("room-source");
        driver.open();
        conn.send(Bytes::from_static(b"out")).expect("send");
        assert_eq!(driver.outbound.recv().await.unwrap(), Bytes::from_static(b"out"));

        let mut inbound = conn.take_inbound().expect("inbound once");
        assert!(conn.take_inbound().is_none());
        driver.inbound.send(Bytes::from_static(b"in")).unwrap();
        assert_eq!(inbound.recv().await.unwrap(), Bytes::from_static(b"in"));
    }

    #[tokio::test]
    async fn wait_open_times_out() {
        let (conn, _driver) = connection("room-viewer");
        let err = conn
            .wait_open(Duration::from_millis(20))
            .await
            .expect_err("never opened");
        assert_eq!(err, LinkError::OpenTimeout(Duration::from_millis(20)));
    }
}
