//! In-process loopback transport.
//!
//! A [`LoopbackHub`] stands in for a LAN segment.  Each call to
//! [`LoopbackHub::endpoint`] creates a [`LoopbackTransport`] with its own
//! synthetic `127.0.0.1:<port>` address.  A datagram sent by any endpoint is
//! queued for every live endpoint on the hub, the sender included, exactly as
//! a broadcast socket hears its own traffic.
//!
//! Endpoints that have been dropped are pruned on the next send.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{DatagramTransport, TransportError};

/// First synthetic port handed out by a hub.
const FIRST_PORT: u16 = 40_000;

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

#[derive(Debug)]
struct HubState {
    next_port: u16,
    endpoints: Vec<(SocketAddr, Inbox)>,
}

/// A shared in-memory broadcast domain.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                next_port: FIRST_PORT,
                endpoints: Vec::new(),
            })),
        }
    }

    /// Attaches a new endpoint to the hub.
    pub fn endpoint(&self) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), state.next_port);
        state.next_port = state.next_port.wrapping_add(1);
        state.endpoints.push((addr, tx));
        LoopbackTransport {
            hub: self.clone(),
            addr,
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Number of endpoints still attached.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.endpoints.retain(|(_, tx)| !tx.is_closed());
        state.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deliver(&self, datagram: &[u8], from: SocketAddr) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .endpoints
            .retain(|(_, tx)| tx.send((datagram.to_vec(), from)).is_ok());
        trace!("loopback {from}: {} bytes to {} endpoints", datagram.len(), state.endpoints.len());
    }
}

/// One endpoint on a [`LoopbackHub`].
#[derive(Debug)]
pub struct LoopbackTransport {
    hub: LoopbackHub,
    addr: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

#[async_trait]
impl DatagramTransport for LoopbackTransport {
    async fn send(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        self.hub.deliver(&datagram, self.addr);
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.addr)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
