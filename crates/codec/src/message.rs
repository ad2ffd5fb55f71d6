//! Typed wrappers around the TLV [`crate::packet`] layer for every message
//! exchanged between instances. Message ids are the outer packet `type`.

use std::net::Ipv4Addr;

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    packet::{PacketReader, PacketWriter},
    Error,
};

pub mod id {
    pub const HOST_ENUM_REQUEST: u32 = 1;
    pub const HOST_ENUM_RESPONSE: u32 = 2;
    pub const CONNECT_HOST: u32 = 3;
    pub const CONNECT_HOST_OK: u32 = 4;
    pub const CONNECT_HOST_FAIL: u32 = 5;
    pub const MESSAGE: u32 = 6;
    pub const PLAYERINFO: u32 = 7;
    pub const ACK: u32 = 8;
    pub const APPDESC: u32 = 9;
    pub const CONNECT_PEER: u32 = 10;
    pub const CONNECT_PEER_OK: u32 = 11;
    pub const CONNECT_PEER_FAIL: u32 = 12;
    pub const DESTROY_PEER: u32 = 13;
    pub const TERMINATE_SESSION: u32 = 14;
    pub const GROUP_ALLOCATE: u32 = 15;
    pub const GROUP_CREATE: u32 = 16;
    pub const GROUP_DESTROY: u32 = 17;
    pub const GROUP_JOIN: u32 = 18;
    pub const GROUP_JOINED: u32 = 19;
    pub const GROUP_LEAVE: u32 = 20;
    pub const GROUP_LEFT: u32 = 21;
    pub const PEER_JOINED: u32 = 22;
}

/// One entry of the peer list carried in [`Message::ConnectHostOk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub player: u32,
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HostEnumRequest {
        application: Option<Uuid>,
        user_data: Option<Vec<u8>>,
        tick: u32,
    },
    HostEnumResponse {
        flags: u32,
        instance: Uuid,
        application: Uuid,
        max_players: u32,
        current_players: u32,
        session_name: String,
        app_data: Option<Vec<u8>>,
        response_data: Option<Vec<u8>>,
        echoed_tick: u32,
    },
    ConnectHost {
        instance: Option<Uuid>,
        application: Uuid,
        password: Option<String>,
        request_data: Option<Vec<u8>>,
        player_name: String,
        player_data: Vec<u8>,
    },
    ConnectHostOk {
        instance: Uuid,
        host_player: u32,
        assigned_player: u32,
        peers: Vec<PeerDescriptor>,
        response_data: Option<Vec<u8>>,
        host_name: String,
        host_data: Vec<u8>,
        max_players: u32,
        session_name: String,
        password: String,
        app_data: Vec<u8>,
        group_ids: Vec<u32>,
    },
    ConnectHostFail {
        error_code: u32,
        response_data: Option<Vec<u8>>,
    },
    Data {
        sender: u32,
        payload: Vec<u8>,
        flags: u32,
    },
    PlayerInfo {
        player: u32,
        name: String,
        data: Vec<u8>,
        ack_id: u32,
    },
    Ack {
        ack_id: u32,
        result: u32,
        response: Vec<u8>,
    },
    AppDesc {
        max_players: u32,
        session_name: String,
        password: String,
        app_data: Vec<u8>,
    },
    ConnectPeer {
        instance: Uuid,
        application: Uuid,
        password: String,
        player: u32,
        player_name: String,
        player_data: Vec<u8>,
    },
    ConnectPeerOk {
        player_name: String,
        player_data: Vec<u8>,
        group_ids: Vec<u32>,
    },
    ConnectPeerFail {
        error_code: u32,
    },
    DestroyPeer {
        player: u32,
        terminate_data: Vec<u8>,
    },
    TerminateSession {
        terminate_data: Vec<u8>,
    },
    GroupAllocate {
        ack_id: u32,
    },
    GroupCreate {
        group: u32,
        name: String,
        data: Vec<u8>,
    },
    GroupDestroy {
        group: u32,
    },
    GroupJoin {
        group: u32,
        ack_id: u32,
        name: String,
        data: Vec<u8>,
    },
    GroupJoined {
        group: u32,
        name: String,
        data: Vec<u8>,
    },
    GroupLeave {
        group: u32,
        ack_id: u32,
    },
    GroupLeft {
        group: u32,
    },
    /// Sent by the host to every already-connected peer once a new peer
    /// is accepted, so each of them can dial the newcomer directly
    /// (`CONNECT_PEER_OK` carries the newcomer's name/data back).
    PeerJoined {
        player: u32,
        ipv4: Ipv4Addr,
        port: u16,
    },
}

impl Message {
    pub fn message_id(&self) -> u32 {
        match self {
            Self::HostEnumRequest { .. } => id::HOST_ENUM_REQUEST,
            Self::HostEnumResponse { .. } => id::HOST_ENUM_RESPONSE,
            Self::ConnectHost { .. } => id::CONNECT_HOST,
            Self::ConnectHostOk { .. } => id::CONNECT_HOST_OK,
            Self::ConnectHostFail { .. } => id::CONNECT_HOST_FAIL,
            Self::Data { .. } => id::MESSAGE,
            Self::PlayerInfo { .. } => id::PLAYERINFO,
            Self::Ack { .. } => id::ACK,
            Self::AppDesc { .. } => id::APPDESC,
            Self::ConnectPeer { .. } => id::CONNECT_PEER,
            Self::ConnectPeerOk { .. } => id::CONNECT_PEER_OK,
            Self::ConnectPeerFail { .. } => id::CONNECT_PEER_FAIL,
            Self::DestroyPeer { .. } => id::DESTROY_PEER,
            Self::TerminateSession { .. } => id::TERMINATE_SESSION,
            Self::GroupAllocate { .. } => id::GROUP_ALLOCATE,
            Self::GroupCreate { .. } => id::GROUP_CREATE,
            Self::GroupDestroy { .. } => id::GROUP_DESTROY,
            Self::GroupJoin { .. } => id::GROUP_JOIN,
            Self::GroupJoined { .. } => id::GROUP_JOINED,
            Self::GroupLeave { .. } => id::GROUP_LEAVE,
            Self::GroupLeft { .. } => id::GROUP_LEFT,
            Self::PeerJoined { .. } => id::PEER_JOINED,
        }
    }

    /// # Test
    ///
    /// ```
    /// use peer8_codec::Message;
    ///
    /// let msg = Message::Data { sender: 3, payload: vec![1, 2, 3], flags: 0 };
    /// let bytes = msg.encode();
    /// assert_eq!(Message::decode(&bytes).unwrap(), msg);
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut w = PacketWriter::new(self.message_id());

        match self {
            Self::HostEnumRequest {
                application,
                user_data,
                tick,
            } => {
                w.append_guid_opt(application.as_ref())
                    .append_data_opt(user_data.as_deref())
                    .append_dword(*tick);
            }
            Self::HostEnumResponse {
                flags,
                instance,
                application,
                max_players,
                current_players,
                session_name,
                app_data,
                response_data,
                echoed_tick,
            } => {
                w.append_dword(*flags)
                    .append_guid(instance)
                    .append_guid(application)
                    .append_dword(*max_players)
                    .append_dword(*current_players)
                    .append_wstring(session_name)
                    .append_data_opt(app_data.as_deref())
                    .append_data_opt(response_data.as_deref())
                    .append_dword(*echoed_tick);
            }
            Self::ConnectHost {
                instance,
                application,
                password,
                request_data,
                player_name,
                player_data,
            } => {
                w.append_guid_opt(instance.as_ref())
                    .append_guid(application)
                    .append_wstring_opt(password.as_deref())
                    .append_data_opt(request_data.as_deref())
                    .append_wstring(player_name)
                    .append_data(player_data);
            }
            Self::ConnectHostOk {
                instance,
                host_player,
                assigned_player,
                peers,
                response_data,
                host_name,
                host_data,
                max_players,
                session_name,
                password,
                app_data,
                group_ids,
            } => {
                w.append_guid(instance)
                    .append_dword(*host_player)
                    .append_dword(*assigned_player)
                    .append_dword(peers.len() as u32);

                for peer in peers {
                    w.append_dword(peer.player)
                        .append_dword(u32::from_be_bytes(peer.ipv4.octets()))
                        .append_dword(peer.port as u32);
                }

                w.append_data_opt(response_data.as_deref())
                    .append_wstring(host_name)
                    .append_data(host_data)
                    .append_dword(*max_players)
                    .append_wstring(session_name)
                    .append_wstring(password)
                    .append_data(app_data)
                    .append_dword(group_ids.len() as u32);

                for group in group_ids {
                    w.append_dword(*group);
                }
            }
            Self::ConnectHostFail {
                error_code,
                response_data,
            } => {
                w.append_dword(*error_code)
                    .append_data_opt(response_data.as_deref());
            }
            Self::Data {
                sender,
                payload,
                flags,
            } => {
                w.append_dword(*sender).append_data(payload).append_dword(*flags);
            }
            Self::PlayerInfo {
                player,
                name,
                data,
                ack_id,
            } => {
                w.append_dword(*player)
                    .append_wstring(name)
                    .append_data(data)
                    .append_dword(*ack_id);
            }
            Self::Ack {
                ack_id,
                result,
                response,
            } => {
                w.append_dword(*ack_id)
                    .append_dword(*result)
                    .append_data(response);
            }
            Self::AppDesc {
                max_players,
                session_name,
                password,
                app_data,
            } => {
                w.append_dword(*max_players)
                    .append_wstring(session_name)
                    .append_wstring(password)
                    .append_data(app_data);
            }
            Self::ConnectPeer {
                instance,
                application,
                password,
                player,
                player_name,
                player_data,
            } => {
                w.append_guid(instance)
                    .append_guid(application)
                    .append_wstring(password)
                    .append_dword(*player)
                    .append_wstring(player_name)
                    .append_data(player_data);
            }
            Self::ConnectPeerOk {
                player_name,
                player_data,
                group_ids,
            } => {
                w.append_wstring(player_name)
                    .append_data(player_data)
                    .append_dword(group_ids.len() as u32);

                for group in group_ids {
                    w.append_dword(*group);
                }
            }
            Self::ConnectPeerFail { error_code } => {
                w.append_dword(*error_code);
            }
            Self::DestroyPeer {
                player,
                terminate_data,
            } => {
                w.append_dword(*player).append_data(terminate_data);
            }
            Self::TerminateSession { terminate_data } => {
                w.append_data(terminate_data);
            }
            Self::GroupAllocate { ack_id } => {
                w.append_dword(*ack_id);
            }
            Self::GroupCreate { group, name, data } => {
                w.append_dword(*group).append_wstring(name).append_data(data);
            }
            Self::GroupDestroy { group } => {
                w.append_dword(*group);
            }
            Self::GroupJoin {
                group,
                ack_id,
                name,
                data,
            } => {
                w.append_dword(*group)
                    .append_dword(*ack_id)
                    .append_wstring(name)
                    .append_data(data);
            }
            Self::GroupJoined { group, name, data } => {
                w.append_dword(*group).append_wstring(name).append_data(data);
            }
            Self::GroupLeave { group, ack_id } => {
                w.append_dword(*group).append_dword(*ack_id);
            }
            Self::GroupLeft { group } => {
                w.append_dword(*group);
            }
            Self::PeerJoined { player, ipv4, port } => {
                w.append_dword(*player)
                    .append_dword(u32::from_be_bytes(ipv4.octets()))
                    .append_dword(*port as u32);
            }
        }

        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let r = PacketReader::new(bytes)?;

        Ok(match r.packet_type() {
            id::HOST_ENUM_REQUEST => Self::HostEnumRequest {
                application: r.get_guid_opt(0)?,
                user_data: r.get_data_opt(1)?.map(<[u8]>::to_vec),
                tick: r.get_dword(2)?,
            },
            id::HOST_ENUM_RESPONSE => Self::HostEnumResponse {
                flags: r.get_dword(0)?,
                instance: r.get_guid(1)?,
                application: r.get_guid(2)?,
                max_players: r.get_dword(3)?,
                current_players: r.get_dword(4)?,
                session_name: r.get_wstring(5)?,
                app_data: r.get_data_opt(6)?.map(<[u8]>::to_vec),
                response_data: r.get_data_opt(7)?.map(<[u8]>::to_vec),
                echoed_tick: r.get_dword(8)?,
            },
            id::CONNECT_HOST => Self::ConnectHost {
                instance: r.get_guid_opt(0)?,
                application: r.get_guid(1)?,
                password: r.get_wstring_opt(2)?,
                request_data: r.get_data_opt(3)?.map(<[u8]>::to_vec),
                player_name: r.get_wstring(4)?,
                player_data: r.get_data(5)?.to_vec(),
            },
            id::CONNECT_HOST_OK => {
                let instance = r.get_guid(0)?;
                let host_player = r.get_dword(1)?;
                let assigned_player = r.get_dword(2)?;
                let num_peers = r.get_dword(3)? as usize;

                let mut index = 4;
                let mut peers = Vec::with_capacity(num_peers);
                for _ in 0..num_peers {
                    let player = r.get_dword(index)?;
                    let ipv4 = Ipv4Addr::from(r.get_dword(index + 1)?.to_be_bytes());
                    let port = r.get_dword(index + 2)? as u16;
                    peers.push(PeerDescriptor { player, ipv4, port });
                    index += 3;
                }

                let response_data = r.get_data_opt(index)?.map(<[u8]>::to_vec);
                let host_name = r.get_wstring(index + 1)?;
                let host_data = r.get_data(index + 2)?.to_vec();
                let max_players = r.get_dword(index + 3)?;
                let session_name = r.get_wstring(index + 4)?;
                let password = r.get_wstring(index + 5)?;
                let app_data = r.get_data(index + 6)?.to_vec();
                let num_groups = r.get_dword(index + 7)? as usize;

                let mut group_ids = Vec::with_capacity(num_groups);
                for offset in 0..num_groups {
                    group_ids.push(r.get_dword(index + 8 + offset)?);
                }

                Self::ConnectHostOk {
                    instance,
                    host_player,
                    assigned_player,
                    peers,
                    response_data,
                    host_name,
                    host_data,
                    max_players,
                    session_name,
                    password,
                    app_data,
                    group_ids,
                }
            }
            id::CONNECT_HOST_FAIL => Self::ConnectHostFail {
                error_code: r.get_dword(0)?,
                response_data: r.get_data_opt(1)?.map(<[u8]>::to_vec),
            },
            id::MESSAGE => Self::Data {
                sender: r.get_dword(0)?,
                payload: r.get_data(1)?.to_vec(),
                flags: r.get_dword(2)?,
            },
            id::PLAYERINFO => Self::PlayerInfo {
                player: r.get_dword(0)?,
                name: r.get_wstring(1)?,
                data: r.get_data(2)?.to_vec(),
                ack_id: r.get_dword(3)?,
            },
            id::ACK => Self::Ack {
                ack_id: r.get_dword(0)?,
                result: r.get_dword(1)?,
                response: r.get_data(2)?.to_vec(),
            },
            id::APPDESC => Self::AppDesc {
                max_players: r.get_dword(0)?,
                session_name: r.get_wstring(1)?,
                password: r.get_wstring(2)?,
                app_data: r.get_data(3)?.to_vec(),
            },
            id::CONNECT_PEER => Self::ConnectPeer {
                instance: r.get_guid(0)?,
                application: r.get_guid(1)?,
                password: r.get_wstring(2)?,
                player: r.get_dword(3)?,
                player_name: r.get_wstring(4)?,
                player_data: r.get_data(5)?.to_vec(),
            },
            id::CONNECT_PEER_OK => {
                let player_name = r.get_wstring(0)?;
                let player_data = r.get_data(1)?.to_vec();
                let num_groups = r.get_dword(2)? as usize;

                let mut group_ids = Vec::with_capacity(num_groups);
                for offset in 0..num_groups {
                    group_ids.push(r.get_dword(3 + offset)?);
                }

                Self::ConnectPeerOk {
                    player_name,
                    player_data,
                    group_ids,
                }
            }
            id::CONNECT_PEER_FAIL => Self::ConnectPeerFail {
                error_code: r.get_dword(0)?,
            },
            id::DESTROY_PEER => Self::DestroyPeer {
                player: r.get_dword(0)?,
                terminate_data: r.get_data(1)?.to_vec(),
            },
            id::TERMINATE_SESSION => Self::TerminateSession {
                terminate_data: r.get_data(0)?.to_vec(),
            },
            id::GROUP_ALLOCATE => Self::GroupAllocate {
                ack_id: r.get_dword(0)?,
            },
            id::GROUP_CREATE => Self::GroupCreate {
                group: r.get_dword(0)?,
                name: r.get_wstring(1)?,
                data: r.get_data(2)?.to_vec(),
            },
            id::GROUP_DESTROY => Self::GroupDestroy {
                group: r.get_dword(0)?,
            },
            id::GROUP_JOIN => Self::GroupJoin {
                group: r.get_dword(0)?,
                ack_id: r.get_dword(1)?,
                name: r.get_wstring(2)?,
                data: r.get_data(3)?.to_vec(),
            },
            id::GROUP_JOINED => Self::GroupJoined {
                group: r.get_dword(0)?,
                name: r.get_wstring(1)?,
                data: r.get_data(2)?.to_vec(),
            },
            id::GROUP_LEAVE => Self::GroupLeave {
                group: r.get_dword(0)?,
                ack_id: r.get_dword(1)?,
            },
            id::GROUP_LEFT => Self::GroupLeft {
                group: r.get_dword(0)?,
            },
            id::PEER_JOINED => Self::PeerJoined {
                player: r.get_dword(0)?,
                ipv4: Ipv4Addr::from(r.get_dword(1)?.to_be_bytes()),
                port: r.get_dword(2)? as u16,
            },
            _ => return Err(Error::TypeMismatch),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn host_enum_request_with_null_fields() {
        round_trip(Message::HostEnumRequest {
            application: None,
            user_data: None,
            tick: 123,
        });
    }

    #[test]
    fn host_enum_request_with_filter() {
        round_trip(Message::HostEnumRequest {
            application: Some(Uuid::new_v4()),
            user_data: Some(vec![1, 2, 3]),
            tick: 999,
        });
    }

    #[test]
    fn connect_host_ok_with_peer_list_and_groups() {
        round_trip(Message::ConnectHostOk {
            instance: Uuid::new_v4(),
            host_player: 1,
            assigned_player: 2,
            peers: vec![
                PeerDescriptor {
                    player: 3,
                    ipv4: Ipv4Addr::new(192, 168, 1, 5),
                    port: 6072,
                },
                PeerDescriptor {
                    player: 4,
                    ipv4: Ipv4Addr::new(10, 0, 0, 1),
                    port: 6073,
                },
            ],
            response_data: None,
            host_name: "host".into(),
            host_data: vec![],
            max_players: 8,
            session_name: "my session".into(),
            password: String::new(),
            app_data: vec![9, 9],
            group_ids: vec![0x4000_0001, 0x4000_0002],
        });
    }

    #[test]
    fn peer_joined_round_trips() {
        round_trip(Message::PeerJoined {
            player: 5,
            ipv4: Ipv4Addr::new(192, 168, 1, 9),
            port: 6072,
        });
    }

    #[test]
    fn unknown_message_id_is_type_mismatch() {
        let mut w = PacketWriter::new(0xFFFF);
        w.append_dword(1);
        let bytes = w.finish();

        assert!(matches!(Message::decode(&bytes), Err(Error::TypeMismatch)));
    }
}
