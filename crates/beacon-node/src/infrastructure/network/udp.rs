//! UDP broadcast / multicast transport.
//!
//! One tokio [`UdpSocket`] is bound on the configured address and port, and
//! every outbound datagram goes to a single destination:
//!
//! - **Broadcast** mode sets `SO_BROADCAST` and sends to the configured
//!   broadcast address (default `255.255.255.255`, the limited broadcast).
//! - **Multicast** mode joins the group, sets the outbound TTL, enables
//!   loopback so other instances on this host hear us, and sends to the
//!   group address.
//!
//! In both modes the destination port is the bound port: every peer listens
//! on the same port.
//!
//! # How UDP broadcast works (for beginners)
//!
//! A datagram sent to a broadcast address is delivered by the network to
//! every host on the local segment that has a socket bound to the destination
//! port.  Multicast is the opt-in variant: only hosts that joined the group
//! receive it, and the TTL limits how many routers it may cross (1 keeps it
//! on the LAN).  Neither mode acknowledges or retries, so the protocol above
//! this layer re-broadcasts state periodically instead.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::{DatagramTransport, TransportError};

/// Largest datagram a UDP socket can return.
const MAX_DATAGRAM: usize = 65_535;

/// Where outbound datagrams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    Broadcast { destination: Ipv4Addr },
    Multicast { group: Ipv4Addr, ttl: u32 },
}

impl Default for UdpMode {
    fn default() -> Self {
        UdpMode::Broadcast {
            destination: Ipv4Addr::BROADCAST,
        }
    }
}

/// A bound UDP socket plus its fixed destination.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpTransport {
    /// Binds `address:port` and configures the socket for `mode`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Bind`] if the socket cannot be bound, or
    /// [`TransportError::Configure`] if a socket option is rejected.
    pub async fn bind(address: IpAddr, port: u16, mode: UdpMode) -> Result<Self, TransportError> {
        let addr = SocketAddr::new(address, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;

        let destination = match mode {
            UdpMode::Broadcast { destination } => {
                socket
                    .set_broadcast(true)
                    .map_err(TransportError::Configure)?;
                SocketAddr::new(destination.into(), port)
            }
            UdpMode::Multicast { group, ttl } => {
                let interface = match address {
                    IpAddr::V4(v4) => v4,
                    IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                socket
                    .join_multicast_v4(group, interface)
                    .map_err(TransportError::Configure)?;
                socket
                    .set_multicast_ttl_v4(ttl)
                    .map_err(TransportError::Configure)?;
                socket
                    .set_multicast_loop_v4(true)
                    .map_err(TransportError::Configure)?;
                SocketAddr::new(group.into(), port)
            }
        };

        info!("datagram socket bound on UDP {addr}, sending to {destination}");
        Ok(Self {
            socket,
            destination,
        })
    }

    /// Where every outbound datagram is addressed.
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        self.socket
            .send_to(&datagram, self.destination)
            .await
            .map_err(|source| TransportError::Send {
                dest: self.destination,
                source,
            })?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, source) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(TransportError::Recv)?;
        buf.truncate(len);
        debug!("received {len} bytes from {source}");
        Ok((buf, source))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::LocalAddr)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
