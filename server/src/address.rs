//! Peer addressing and outbound routing
//!
//! A player is reachable through a TCP control connection and, once the
//! handshake announced it, a UDP endpoint. [`Address`] carries whichever of
//! the two is known and decides which queue an outbound packet goes to.

use crate::error::{Result, ServerError};
use crate::session_manager::Session;
use arena_protocol::{Packet, TransportKind};
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// A packet waiting for the shared UDP send loop.
#[derive(Debug)]
pub struct UdpOutbound {
    pub addr: SocketAddr,
    pub packet: Packet,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Address {
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
}

impl Address {
    pub fn from_tcp(addr: SocketAddr) -> Self {
        Self {
            tcp: Some(addr),
            udp: None,
        }
    }

    pub fn from_udp(addr: SocketAddr) -> Self {
        Self {
            tcp: None,
            udp: Some(addr),
        }
    }

    /// Resolves the UDP endpoint for this address, falling back to the one
    /// the player announced during the handshake.
    pub fn udp_endpoint(&self, player: Option<&Session>) -> Option<SocketAddr> {
        self.udp.or_else(|| player.and_then(|p| p.address.udp))
    }

    /// Routes `packet` to the right transport.
    ///
    /// UDP packets go to the shared UDP queue; TCP packets go to the
    /// player's own connection queue.
    pub async fn send(
        &self,
        packet: Packet,
        player: Option<&Session>,
        udp_queue: &mpsc::Sender<UdpOutbound>,
    ) -> Result<()> {
        let id = packet.id;
        match packet.kind {
            TransportKind::Udp => {
                let addr = self
                    .udp_endpoint(player)
                    .ok_or(ServerError::UnresolvedPeer { id })?;
                udp_queue
                    .send(UdpOutbound { addr, packet })
                    .await
                    .map_err(|_| ServerError::ChannelClosed("udp outbound"))
            }
            TransportKind::Tcp => {
                let player = player.ok_or(ServerError::UnresolvedPeer { id })?;
                player
                    .tcp_tx
                    .send(packet)
                    .await
                    .map_err(|_| ServerError::ChannelClosed("tcp outbound"))
            }
        }
    }
}

/// Two addresses are the same peer when either endpoint matches.
impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        let tcp_match = matches!((self.tcp, other.tcp), (Some(a), Some(b)) if a == b);
        let udp_match = matches!((self.udp, other.udp), (Some(a), Some(b)) if a == b);
        tcp_match || udp_match
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tcp, self.udp) {
            (Some(tcp), Some(udp)) => write!(f, "tcp://{} udp://{}", tcp, udp),
            (Some(tcp), None) => write!(f, "tcp://{}", tcp),
            (None, Some(udp)) => write!(f, "udp://{}", udp),
            (None, None) => write!(f, "<unbound>"),
        }
    }
}
