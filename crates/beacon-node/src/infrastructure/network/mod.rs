//! Network infrastructure: the datagram transport seam and its adapters.
//!
//! # Sub-modules
//!
//! - **`udp`** – A tokio UDP socket in broadcast or multicast mode.  This is
//!   what a real deployment uses.
//!
//! - **`loopback`** – An in-process hub that delivers every datagram to every
//!   endpoint, the sender included.  Lets several discovery instances share
//!   one process (and one paused test clock) without touching the network.
//!
//! # Why a trait? (for beginners)
//!
//! The discovery runtime only needs three things from the network: send one
//! datagram to "everyone", receive the next datagram together with its
//! sender, and report the local address.  Expressing that as
//! [`DatagramTransport`] lets the runtime be tested with a mock or with the
//! loopback hub, and keeps socket options out of the election code.

pub mod loopback;
pub mod udp;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

/// Error type for datagram transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket could not be bound.
    #[error("failed to bind datagram socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A socket option (broadcast flag, multicast membership, TTL) could not be set.
    #[error("failed to configure socket: {0}")]
    Configure(#[source] io::Error),

    /// An outbound datagram could not be sent.
    #[error("send to {dest} failed: {source}")]
    Send {
        dest: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// An I/O error occurred while receiving a datagram.
    #[error("recv error: {0}")]
    Recv(#[source] io::Error),

    /// The local address could not be determined.
    #[error("local address unavailable: {0}")]
    LocalAddr(#[source] io::Error),

    /// The transport has been shut down; no further datagrams will arrive.
    #[error("transport closed")]
    Closed,
}

/// A best-effort, one-to-many datagram channel.
///
/// `send` delivers to every listener on the segment (broadcast address or
/// multicast group).  `recv` yields the next datagram along with the address
/// it actually came from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Sends one datagram.  No acknowledgment, no retry.
    async fn send(&self, datagram: Vec<u8>) -> Result<(), TransportError>;

    /// Waits for the next inbound datagram.
    ///
    /// Returns [`TransportError::Closed`] once the transport can never yield
    /// another datagram; the caller should stop receiving.
    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), TransportError>;

    /// The local address datagrams are sent from.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}
