//! The per-connection state machine for a single TCP peer.

use std::net::{Ipv4Addr, SocketAddr};

use ahash::HashMap;
use bytes::BytesMut;

use crate::send_queue::SendQueue;
use crate::PlayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Accepted,
    ConnectingHost,
    RequestingHost,
    ConnectingPeer,
    RequestingPeer,
    Indicating,
    Connected,
    Closing,
}

/// One TCP connection to another participant in the session.
///
/// Owned exclusively by the [`crate::Instance`] that created it; I/O
/// callbacks only ever see a weak index into the instance's peer table; see
/// `DESIGN.md` for the cyclic-ownership note this resolves.
pub struct PeerConnection {
    pub state: PeerState,
    pub remote_ip: Ipv4Addr,
    pub remote_tcp_port: u16,
    pub remote_udp_port: u16,
    /// Valid only once `state == Connected`.
    pub player_id: Option<PlayerId>,
    pub player_context: u64,
    pub player_name: String,
    pub player_data: Vec<u8>,
    /// Accumulates bytes for the packet currently being read off the
    /// socket; a packet's outer length tells us when to hand it off and
    /// reset this buffer, which is also how extra trailing bytes on a
    /// stream transport become implicit framing.
    pub recv_buf: BytesMut,
    pub send_queue: SendQueue,
    pub send_channel_open: bool,
    next_ack_id: u32,
    pub pending_acks: HashMap<u32, PendingAck>,
}

pub enum PendingAck {
    PlayerInfo,
    GroupJoin { group: crate::GroupId },
    GroupLeave { group: crate::GroupId },
}

impl PeerConnection {
    pub fn new(state: PeerState, remote: SocketAddr, remote_udp_port: u16) -> Self {
        let remote_ip = match remote.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };

        Self {
            state,
            remote_ip,
            remote_tcp_port: remote.port(),
            remote_udp_port,
            player_id: None,
            player_context: 0,
            player_name: String::new(),
            player_data: Vec::new(),
            recv_buf: BytesMut::with_capacity(4096),
            send_queue: SendQueue::new(),
            send_channel_open: true,
            next_ack_id: 1,
            pending_acks: HashMap::default(),
        }
    }

    pub fn next_ack_id(&mut self) -> u32 {
        let id = self.next_ack_id;
        self.next_ack_id = self.next_ack_id.wrapping_add(1).max(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_ids_increment_and_never_reuse_zero() {
        let mut peer = PeerConnection::new(
            PeerState::Accepted,
            "127.0.0.1:6072".parse().unwrap(),
            6072,
        );

        let first = peer.next_ack_id();
        let second = peer.next_ack_id();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
