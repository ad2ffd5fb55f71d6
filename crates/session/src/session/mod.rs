//! The instance state machine: hosting, connecting, the host/peer mesh,
//! groups, and application-message delivery.

pub mod group;
pub mod peer;

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Token};
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use codec::{Message, PeerDescriptor};

use crate::handle::{HandleAllocator, HandleClass};
use crate::host_enum::{self, EnumParams, Enumeration};
use crate::network;
use crate::send_queue::{Buffer, Priority, SendQueue, SendResult};
use crate::worker_pool::WorkerPool;
use crate::{
    Address, ApplicationCallback, CancelScope, EnumFilter, Error, Event, FoundHost, GroupId, PlayerId, Result,
    SendQueueInfo,
};

pub use group::Group;
pub use peer::{PeerConnection, PeerState, PendingAck};

/// How often the background timeout sweeper checks every peer's send
/// queue for expired deadlines.
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Mirrors the instance's own lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    New,
    Initialised,
    Hosting,
    Connecting,
    ConnectFailed,
    Connected,
    Closing,
}

/// The session-wide properties every participant agrees on: player cap,
/// name, password, and opaque application data. Broadcast on every
/// `APPDESC` and carried in `HOST_ENUM_RESPONSE`/`CONNECT_HOST_OK`.
#[derive(Debug, Clone)]
pub struct ApplicationDesc {
    pub flags: u32,
    pub instance: Uuid,
    pub application: Uuid,
    pub max_players: u32,
    pub current_players: u32,
    pub session_name: String,
    pub password: String,
    pub app_data: Vec<u8>,
}

/// Parameters for [`Instance::host`].
#[derive(Debug, Clone)]
pub struct HostParams {
    pub bind: SocketAddrV4,
    pub max_players: u32,
    pub session_name: String,
    pub password: String,
    pub app_data: Vec<u8>,
    pub player_name: String,
    pub player_data: Vec<u8>,
    /// Whether this host answers `HOST_ENUM_REQUEST` broadcasts. Disable
    /// for a host reachable only by an out-of-band address, to skip the
    /// extra bound socket.
    pub respond_to_enum: bool,
    /// UDP port the discovery responder binds when `respond_to_enum` is
    /// set. Defaults to [`network::DISCOVERY_PORT`].
    pub discovery_port: u16,
}

/// Parameters for [`Instance::connect`].
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: SocketAddrV4,
    pub application: Uuid,
    pub password: String,
    pub request_data: Vec<u8>,
    pub player_name: String,
    pub player_data: Vec<u8>,
}

/// Provisional ids are drawn from a range no real assigned player id ever
/// occupies (those start at 2 and climb one at a time), so a peer that
/// hasn't finished its handshake can't collide with one that has.
const PROVISIONAL_ID_BASE: u32 = 0x7000_0000;

struct Locked {
    state: InstanceState,
    desc: ApplicationDesc,
    local_player: Option<PlayerId>,
    local_player_name: String,
    local_player_data: Vec<u8>,
    local_player_context: u64,
    host_player: Option<PlayerId>,
    is_host: bool,
    peers: HashMap<PlayerId, (PeerConnection, Token)>,
    groups: HashMap<GroupId, Group>,
    next_id: u32,
    handles: HandleAllocator,
    listener_token: Option<Token>,
    discovery_token: Option<Token>,
}

/// One participant in a peer-to-peer session.
///
/// Every public method takes `&self` (or `&Arc<Self>` where a background
/// thread or worker-pool callback needs to outlive the call); the
/// instance is meant to be shared as `Arc<Instance>` between the caller
/// and the I/O callbacks that drive it. The one lock (`Locked`, behind
/// `self.lock`) guards all mutable session state; callbacks never hold it
/// while invoking [`ApplicationCallback::on_event`].
pub struct Instance {
    pub instance_id: Uuid,
    pub application_id: Uuid,
    lock: Mutex<Locked>,
    state_changed: Condvar,
    peer_destroyed: Condvar,
    worker_pool: WorkerPool,
    callback: Arc<dyn ApplicationCallback>,
    listener: Mutex<Option<TcpListener>>,
    streams: Mutex<HashMap<Token, TcpStream>>,
    token_to_player: Mutex<HashMap<Token, PlayerId>>,
    provisional_counter: AtomicU32,
    discovery: Mutex<Option<UdpSocket>>,
    /// Cancel flags for outstanding `EnumHosts` operations, keyed by the
    /// handle allocated when each was started. Never pruned on natural
    /// completion (see `DESIGN.md`); bounded in practice by how often an
    /// application starts enumerations.
    enum_cancel_flags: Mutex<HashMap<u32, Arc<AtomicBool>>>,
    /// At most one `Connect` can be in flight at a time (`connect` itself
    /// enforces this via `state`), so a single slot is enough.
    connect_cancel: Mutex<Option<(u32, Arc<AtomicBool>)>>,
    timeout_sweeper_shutdown: Arc<AtomicBool>,
}

impl Instance {
    pub fn new(application_id: Uuid, callback: Arc<dyn ApplicationCallback>) -> Result<Arc<Self>> {
        Self::with_handles_per_block(application_id, callback, 64)
    }

    /// Like [`Instance::new`], but overrides the worker pool's default
    /// registrations-per-thread cap (see [`WorkerPool::new`]).
    pub fn with_handles_per_block(
        application_id: Uuid,
        callback: Arc<dyn ApplicationCallback>,
        handles_per_block: usize,
    ) -> Result<Arc<Self>> {
        let instance_id = Uuid::new_v4();

        let desc = ApplicationDesc {
            flags: 0,
            instance: instance_id,
            application: application_id,
            max_players: 0,
            current_players: 0,
            session_name: String::new(),
            password: String::new(),
            app_data: Vec::new(),
        };

        let timeout_sweeper_shutdown = Arc::new(AtomicBool::new(false));

        let instance = Arc::new(Self {
            instance_id,
            application_id,
            lock: Mutex::new(Locked {
                state: InstanceState::New,
                desc,
                local_player: None,
                local_player_name: String::new(),
                local_player_data: Vec::new(),
                local_player_context: 0,
                host_player: None,
                is_host: false,
                peers: HashMap::new(),
                groups: HashMap::new(),
                next_id: 2,
                handles: HandleAllocator::new(),
                listener_token: None,
                discovery_token: None,
            }),
            state_changed: Condvar::new(),
            peer_destroyed: Condvar::new(),
            worker_pool: WorkerPool::new(handles_per_block)?,
            callback,
            listener: Mutex::new(None),
            streams: Mutex::new(HashMap::new()),
            token_to_player: Mutex::new(HashMap::new()),
            provisional_counter: AtomicU32::new(0),
            discovery: Mutex::new(None),
            enum_cancel_flags: Mutex::new(HashMap::new()),
            connect_cancel: Mutex::new(None),
            timeout_sweeper_shutdown: timeout_sweeper_shutdown.clone(),
        });

        let weak = Arc::downgrade(&instance);
        std::thread::spawn(move || loop {
            std::thread::sleep(TIMEOUT_SWEEP_INTERVAL);
            if timeout_sweeper_shutdown.load(Ordering::Acquire) {
                return;
            }
            let Some(instance) = weak.upgrade() else { return };
            instance.sweep_timeouts();
        });

        Ok(instance)
    }

    pub fn state(&self) -> InstanceState {
        self.lock.lock().state
    }

    /// Blocks until the instance reaches `target` or any state for which
    /// `done` returns true, whichever comes first.
    pub fn wait_for_state(&self, target: InstanceState, timeout: Duration) -> bool {
        let mut locked = self.lock.lock();
        if locked.state == target {
            return true;
        }
        let result = self
            .state_changed
            .wait_for(&mut locked, timeout, |l| l.state == target);
        !result.timed_out()
    }

    fn set_state(&self, state: InstanceState) {
        let mut locked = self.lock.lock();
        locked.state = state;
        self.state_changed.notify_all();
    }

    fn emit(&self, event: Event) {
        self.callback.on_event(event);
    }

    fn next_async_handle(&self, class: HandleClass) -> u32 {
        self.lock.lock().handles.allocate(class)
    }

    fn next_provisional(&self) -> PlayerId {
        let n = self.provisional_counter.fetch_add(1, Ordering::Relaxed);
        PlayerId(PROVISIONAL_ID_BASE | n)
    }

    /// Walks every connected peer's send queue and times out anything past
    /// its deadline. Runs on a dedicated background thread started in
    /// [`Instance::with_handles_per_block`].
    fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<u32> = {
            let mut locked = self.lock.lock();
            locked
                .peers
                .values_mut()
                .flat_map(|(conn, _)| conn.send_queue.expire_timeouts(now))
                .collect()
        };

        for handle in expired {
            self.emit(Event::SendComplete {
                async_handle: handle,
                result: Err(Error::TimedOut),
            });
        }
    }

    // ---- hosting -----------------------------------------------------

    /// Opens the instance as a host: binds the TCP listener and starts
    /// accepting connections.
    pub fn host(self: &Arc<Self>, params: HostParams) -> Result<()> {
        {
            let locked = self.lock.lock();
            if locked.state != InstanceState::New && locked.state != InstanceState::Initialised {
                return Err(Error::AlreadyConnected);
            }
        }

        let std_listener = network::bind_host_listener(SocketAddr::V4(params.bind))?;
        let mut listener = TcpListener::from_std(std_listener);

        let instance = self.clone();
        let token = self.worker_pool.add_handle(
            &mut listener,
            Interest::READABLE,
            Arc::new(move |_token| instance.clone().on_listener_readable()),
        )?;

        let discovery_token = if params.respond_to_enum {
            let discovery_addr = SocketAddrV4::new(*params.bind.ip(), params.discovery_port);
            match network::bind_udp_socket(SocketAddr::V4(discovery_addr)) {
                Ok(std_socket) => {
                    let mut socket = UdpSocket::from_std(std_socket);
                    let instance = self.clone();
                    let result = self.worker_pool.add_handle(
                        &mut socket,
                        Interest::READABLE,
                        Arc::new(move |_token| instance.clone().on_discovery_readable()),
                    );
                    match result {
                        Ok(t) => {
                            self.discovery.lock().replace(socket);
                            Some(t)
                        }
                        Err(err) => {
                            log::warn!("failed to register discovery socket: {err}");
                            None
                        }
                    }
                }
                Err(err) => {
                    log::warn!("failed to bind discovery socket on {discovery_addr}: {err}");
                    None
                }
            }
        } else {
            None
        };

        {
            let mut locked = self.lock.lock();
            locked.desc.max_players = params.max_players;
            locked.desc.session_name = params.session_name;
            locked.desc.password = params.password;
            locked.desc.app_data = params.app_data;
            locked.local_player = Some(PlayerId::HOST);
            locked.local_player_name = params.player_name;
            locked.local_player_data = params.player_data;
            locked.host_player = Some(PlayerId::HOST);
            locked.is_host = true;
            locked.listener_token = Some(token);
            locked.discovery_token = discovery_token;
            locked.desc.current_players = 1;
        }

        self.listener.lock().replace(listener);
        self.set_state(InstanceState::Hosting);

        let (name, data) = {
            let locked = self.lock.lock();
            (locked.local_player_name.clone(), locked.local_player_data.clone())
        };
        self.emit(Event::CreatePlayer {
            player_id: PlayerId::HOST,
            name,
            data,
        });

        Ok(())
    }

    fn on_discovery_readable(self: Arc<Self>) {
        let mut buf = [0u8; network::MAX_PACKET_SIZE];

        loop {
            let received = {
                let mut guard = self.discovery.lock();
                match guard.as_mut() {
                    Some(socket) => socket.recv_from(&mut buf),
                    None => return,
                }
            };

            let (len, from) = match received {
                Ok(pair) => pair,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("discovery socket recv failed: {err}");
                    return;
                }
            };

            let SocketAddr::V4(from_v4) = from else {
                continue;
            };

            let (application, user_data, tick) = match Message::decode(&buf[..len]) {
                Ok(Message::HostEnumRequest { application, user_data, tick }) => (application, user_data, tick),
                Ok(_) => continue,
                Err(err) => {
                    log::debug!("dropping malformed host-enum request: {err}");
                    continue;
                }
            };

            if let Some(filter) = application {
                if filter != self.application_id {
                    continue;
                }
            }

            self.emit(Event::EnumHostsQuery {
                from: Address::Ipv4 { socket: from_v4 },
                receive_data: user_data.unwrap_or_default(),
            });

            let desc = self.lock.lock().desc.clone();
            let response = Message::HostEnumResponse {
                flags: desc.flags,
                instance: desc.instance,
                application: desc.application,
                max_players: desc.max_players,
                current_players: desc.current_players,
                session_name: desc.session_name,
                app_data: Some(desc.app_data),
                response_data: None,
                echoed_tick: tick,
            }
            .encode();

            let sent = self
                .discovery
                .lock()
                .as_ref()
                .map(|socket| socket.send_to(&response, SocketAddr::V4(from_v4)));
            if let Some(Err(err)) = sent {
                log::warn!("discovery response send failed: {err}");
            }
        }
    }

    fn on_listener_readable(self: Arc<Self>) {
        loop {
            let accepted = {
                let mut guard = self.listener.lock();
                match guard.as_mut() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };

            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    return;
                }
            };

            self.clone().accept_peer(stream, remote);
        }
    }

    fn accept_peer(self: Arc<Self>, stream: std::net::TcpStream, remote: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut mio_stream = TcpStream::from_std(stream);

        let provisional = self.next_provisional();
        let conn = PeerConnection::new(PeerState::Accepted, remote, 0);

        let instance = self.clone();
        let result = self.worker_pool.add_handle(
            &mut mio_stream,
            Interest::READABLE,
            Arc::new(move |token| instance.clone().on_socket_readable(token)),
        );

        let token = match result {
            Ok(t) => t,
            Err(err) => {
                log::warn!("failed to register accepted peer: {err}");
                return;
            }
        };

        self.lock.lock().peers.insert(provisional, (conn, token));
        self.token_to_player.lock().insert(token, provisional);
        self.streams.lock().insert(token, mio_stream);
    }

    fn on_socket_readable(self: Arc<Self>, token: Token) {
        let player_id = match self.token_to_player.lock().get(&token).copied() {
            Some(id) => id,
            None => return,
        };
        self.pump_peer(player_id, token);
    }

    fn pump_peer(self: Arc<Self>, player_id: PlayerId, token: Token) {
        let mut buf = [0u8; 8192];

        loop {
            let read = {
                let mut streams = self.streams.lock();
                let Some(stream) = streams.get_mut(&token) else {
                    return;
                };
                stream.read(&mut buf)
            };

            match read {
                Ok(0) => {
                    self.handle_peer_disconnected(player_id, token);
                    return;
                }
                Ok(n) => {
                    let packets = {
                        let mut locked = self.lock.lock();
                        let Some((conn, _)) = locked.peers.get_mut(&player_id) else {
                            return;
                        };
                        conn.recv_buf.extend_from_slice(&buf[..n]);
                        drain_complete_packets(&mut conn.recv_buf)
                    };

                    for packet in packets {
                        self.handle_wire_message(player_id, token, &packet);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.handle_peer_disconnected(player_id, token);
                    return;
                }
            }
        }
    }

    fn handle_peer_disconnected(&self, player_id: PlayerId, token: Token) {
        let removed = self.lock.lock().peers.remove(&player_id);
        self.token_to_player.lock().remove(&token);

        if let Some(mut stream) = self.streams.lock().remove(&token) {
            let _ = self.worker_pool.remove_handle(&mut stream, token);
        }

        if let Some((mut conn, _)) = removed {
            let mut cancelled_handles = conn.send_queue.drain_handles(SendResult::ConnectionLost);
            if let Some(current) = conn.send_queue.get_pending() {
                let handle = current.async_handle;
                let current = conn.send_queue.pop_pending();
                if handle != 0 {
                    cancelled_handles.push(handle);
                }
                current.complete(SendResult::ConnectionLost);
            }

            // Only a peer that actually reached `Connected` ever got a
            // `CreatePlayer`; one rejected during `Indicating` (or still
            // mid-handshake) has no player to destroy.
            if conn.state == PeerState::Connected {
                self.emit(Event::DestroyPlayer {
                    player_id,
                    player_context: conn.player_context,
                });
            }
            for handle in cancelled_handles {
                self.emit(Event::SendComplete {
                    async_handle: handle,
                    result: Err(Error::ConnectionLost),
                });
            }
        }

        self.peer_destroyed.notify_all();
    }

    /// Removes a provisional (not yet `Connected`) peer that the
    /// application rejected, or that failed validation before a player was
    /// ever assigned. Skips the `DestroyPlayer`/send-queue bookkeeping
    /// `handle_peer_disconnected` does, since no player was created.
    fn drop_provisional_peer(&self, player_id: PlayerId, token: Token) {
        self.lock.lock().peers.remove(&player_id);
        self.token_to_player.lock().remove(&token);
        if let Some(mut stream) = self.streams.lock().remove(&token) {
            let _ = self.worker_pool.remove_handle(&mut stream, token);
        }
        self.peer_destroyed.notify_all();
    }

    // ---- host-side connection acceptance -------------------------------

    fn handle_wire_message(self: &Arc<Self>, player_id: PlayerId, token: Token, packet: &[u8]) {
        let message = match Message::decode(packet) {
            Ok(m) => m,
            Err(err) => {
                log::warn!("dropping malformed packet: {err}");
                return;
            }
        };

        match message {
            Message::ConnectHost {
                application,
                password,
                request_data,
                player_name,
                player_data,
                ..
            } => self.handle_connect_host(
                player_id,
                token,
                application,
                password,
                request_data.unwrap_or_default(),
                player_name,
                player_data,
            ),
            Message::ConnectPeer {
                instance,
                application,
                password,
                player,
                player_name,
                player_data,
            } => self.handle_connect_peer(
                player_id, token, instance, application, password, player, player_name, player_data,
            ),
            Message::Data { sender, payload, .. } => {
                self.emit(Event::Receive {
                    sender: PlayerId(sender),
                    data: payload,
                });
            }
            Message::PlayerInfo {
                player,
                name,
                data,
                ack_id,
            } => {
                let pid = PlayerId(player);
                {
                    let mut locked = self.lock.lock();
                    if let Some((conn, _)) = locked.peers.get_mut(&pid) {
                        conn.player_name = name.clone();
                        conn.player_data = data.clone();
                    }
                }
                self.emit(Event::PeerInfo { player_id: pid, name, data });
                self.send_ack(player_id, ack_id);
            }
            Message::GroupJoin { group, ack_id, name, data } => {
                let gid = GroupId(group);
                {
                    let mut locked = self.lock.lock();
                    locked
                        .groups
                        .entry(gid)
                        .or_insert_with(|| Group::new(gid, name, data, 0))
                        .members
                        .insert(player_id);
                }
                self.emit(Event::AddPlayerToGroup { group_id: gid, player_id });
                self.send_ack(player_id, ack_id);
            }
            Message::GroupLeave { group, ack_id } => {
                let gid = GroupId(group);
                {
                    let mut locked = self.lock.lock();
                    if let Some(g) = locked.groups.get_mut(&gid) {
                        g.members.remove(&player_id);
                    }
                }
                self.emit(Event::RemovePlayerFromGroup { group_id: gid, player_id });
                self.send_ack(player_id, ack_id);
            }
            Message::PeerJoined { player, ipv4, port } => {
                self.clone().on_peer_joined(player, ipv4, port);
            }
            Message::DestroyPeer { .. } => {
                self.handle_peer_disconnected(player_id, token);
            }
            Message::TerminateSession { terminate_data } => {
                self.emit(Event::TerminateSession { data: terminate_data });
            }
            Message::Ack { ack_id, .. } => {
                let pending = {
                    let mut locked = self.lock.lock();
                    locked
                        .peers
                        .get_mut(&player_id)
                        .and_then(|(conn, _)| conn.pending_acks.remove(&ack_id))
                };

                match pending {
                    Some(PendingAck::PlayerInfo) | None => {}
                    Some(PendingAck::GroupJoin { group }) => {
                        self.emit(Event::AddPlayerToGroup { group_id: group, player_id });
                    }
                    Some(PendingAck::GroupLeave { group }) => {
                        self.emit(Event::RemovePlayerFromGroup { group_id: group, player_id });
                    }
                }
            }
            other => {
                log::debug!("unhandled message id {} from {player_id:?}", other.message_id());
            }
        }
    }

    fn send_ack(&self, target: PlayerId, ack_id: u32) {
        let bytes = Message::Ack {
            ack_id,
            result: 0,
            response: Vec::new(),
        }
        .encode()
        .to_vec();
        let _ = self.queue_to_peer(target, bytes, Priority::High, None, None);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_connect_host(
        self: &Arc<Self>,
        provisional: PlayerId,
        token: Token,
        application: Uuid,
        password: Option<String>,
        request_data: Vec<u8>,
        player_name: String,
        player_data: Vec<u8>,
    ) {
        let mut locked = self.lock.lock();

        if !locked.is_host {
            drop(locked);
            self.send_connect_host_fail(token, 3, None);
            return;
        }
        if application != self.application_id {
            drop(locked);
            self.send_connect_host_fail(token, 1, None);
            return;
        }
        if !locked.desc.password.is_empty() && password.as_deref() != Some(locked.desc.password.as_str()) {
            drop(locked);
            self.send_connect_host_fail(token, 2, None);
            return;
        }
        if locked.desc.max_players != 0 && locked.desc.current_players >= locked.desc.max_players {
            drop(locked);
            self.send_connect_host_fail(token, 3, None);
            return;
        }

        // `ACCEPTED -> INDICATING`: validation passed, but the application
        // still gets to veto the join before a player id is ever handed out.
        let from = locked.peers.get(&provisional).map(|(conn, _)| Address::Ipv4 {
            socket: SocketAddrV4::new(conn.remote_ip, conn.remote_tcp_port),
        });
        if let Some((conn, _)) = locked.peers.get_mut(&provisional) {
            conn.state = PeerState::Indicating;
        }
        drop(locked);

        let Some(from) = from else {
            // The provisional entry vanished (peer already disconnected).
            return;
        };

        self.emit(Event::IndicateConnect {
            from,
            request_data: request_data.clone(),
        });

        let reply_data = match self.callback.indicate_connect(from, request_data) {
            Ok(reply_data) => reply_data,
            Err(reply_data) => {
                self.send_connect_host_fail(token, 3, Some(reply_data));
                self.drop_provisional_peer(provisional, token);
                return;
            }
        };

        let mut locked = self.lock.lock();

        let assigned = PlayerId(locked.next_id);
        locked.next_id = locked.next_id.wrapping_add(1).max(2);

        // Snapshot taken before the newcomer is inserted: this is exactly
        // the set of peers who don't yet know about `assigned` and need the
        // `PEER_JOINED` broadcast below.
        let existing_peers: Vec<PeerDescriptor> = locked
            .peers
            .iter()
            .filter(|(id, (conn, _))| **id != provisional && conn.state == PeerState::Connected)
            .map(|(id, (conn, _))| PeerDescriptor {
                player: id.0,
                ipv4: conn.remote_ip,
                port: conn.remote_tcp_port,
            })
            .collect();

        let group_ids: Vec<u32> = locked.groups.keys().map(|g| g.0).collect();

        let Some((mut conn, _)) = locked.peers.remove(&provisional) else {
            drop(locked);
            return;
        };
        conn.state = PeerState::Connected;
        conn.player_id = Some(assigned);
        conn.player_name = player_name.clone();
        conn.player_data = player_data.clone();
        let (new_ipv4, new_port) = (conn.remote_ip, conn.remote_tcp_port);
        locked.peers.insert(assigned, (conn, token));
        locked.desc.current_players += 1;

        let response = Message::ConnectHostOk {
            instance: locked.desc.instance,
            host_player: locked.host_player.unwrap_or(PlayerId::HOST).0,
            assigned_player: assigned.0,
            peers: existing_peers.clone(),
            response_data: (!reply_data.is_empty()).then_some(reply_data),
            host_name: locked.local_player_name.clone(),
            host_data: locked.local_player_data.clone(),
            max_players: locked.desc.max_players,
            session_name: locked.desc.session_name.clone(),
            password: locked.desc.password.clone(),
            app_data: locked.desc.app_data.clone(),
            group_ids,
        };

        drop(locked);
        self.token_to_player.lock().insert(token, assigned);

        let _ = self.queue_to_peer(assigned, response.encode().to_vec(), Priority::High, None, None);
        self.emit(Event::CreatePlayer {
            player_id: assigned,
            name: player_name,
            data: player_data,
        });

        // Every peer that joined before `assigned` still needs to learn
        // about it, so it can open its own `CONNECT_PEER` dial.
        let broadcast = Message::PeerJoined {
            player: assigned.0,
            ipv4: new_ipv4,
            port: new_port,
        }
        .encode()
        .to_vec();
        for peer in &existing_peers {
            let _ = self.queue_to_peer(PlayerId(peer.player), broadcast.clone(), Priority::High, None, None);
        }
    }

    fn send_connect_host_fail(&self, token: Token, error_code: u32, response_data: Option<Vec<u8>>) {
        let response = Message::ConnectHostFail { error_code, response_data }.encode();
        self.write_raw(token, &response);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_connect_peer(
        self: &Arc<Self>,
        provisional: PlayerId,
        token: Token,
        instance: Uuid,
        application: Uuid,
        password: String,
        player: u32,
        player_name: String,
        player_data: Vec<u8>,
    ) {
        let mut locked = self.lock.lock();

        if application != self.application_id || instance != locked.desc.instance {
            drop(locked);
            self.send_connect_peer_fail(token, 1);
            return;
        }
        if !locked.desc.password.is_empty() && password != locked.desc.password {
            drop(locked);
            self.send_connect_peer_fail(token, 2);
            return;
        }

        let assigned = PlayerId(player);
        let group_ids: Vec<u32> = locked.groups.keys().map(|g| g.0).collect();

        if let Some((mut conn, _)) = locked.peers.remove(&provisional) {
            conn.state = PeerState::Connected;
            conn.player_id = Some(assigned);
            conn.player_name = player_name.clone();
            conn.player_data = player_data.clone();
            locked.peers.insert(assigned, (conn, token));
        }

        let my_name = locked.local_player_name.clone();
        let my_data = locked.local_player_data.clone();
        drop(locked);

        self.token_to_player.lock().insert(token, assigned);

        let response = Message::ConnectPeerOk {
            player_name: my_name,
            player_data: my_data,
            group_ids,
        };
        let _ = self.queue_to_peer(assigned, response.encode().to_vec(), Priority::High, None, None);

        self.emit(Event::CreatePlayer {
            player_id: assigned,
            name: player_name,
            data: player_data,
        });
    }

    fn send_connect_peer_fail(&self, token: Token, error_code: u32) {
        let response = Message::ConnectPeerFail { error_code }.encode();
        self.write_raw(token, &response);
    }

    fn write_raw(&self, token: Token, bytes: &[u8]) {
        if let Some(stream) = self.streams.lock().get_mut(&token) {
            let _ = stream.write_all(bytes);
        }
    }

    /// A host broadcast `PEER_JOINED` for a peer we don't yet hold a
    /// connection to; dial it directly and promote it into the mesh, off
    /// the worker-pool thread that delivered the broadcast.
    fn on_peer_joined(self: Arc<Self>, player: u32, ipv4: Ipv4Addr, port: u16) {
        let already_known = self.lock.lock().peers.contains_key(&PlayerId(player));
        if already_known {
            return;
        }

        std::thread::spawn(move || {
            let addr = SocketAddrV4::new(ipv4, port);
            match self.dial_peer(addr) {
                Ok((stream, name, data)) => {
                    if self.register_established_stream(stream, PlayerId(player)).is_ok() {
                        self.emit(Event::CreatePlayer {
                            player_id: PlayerId(player),
                            name,
                            data,
                        });
                    }
                }
                Err(err) => {
                    log::warn!("failed to dial newly joined peer {player}: {err}");
                }
            }
        });
    }

    // ---- connecting ------------------------------------------------------

    /// Begins connecting to a host. Runs the TCP connect and the
    /// `CONNECT_HOST`/`CONNECT_HOST_OK` handshake, including subsequent
    /// peer-to-peer promotion connects, on a background thread, then
    /// raises [`Event::ConnectComplete`].
    pub fn connect(self: &Arc<Self>, params: ConnectParams) -> Result<u32> {
        {
            let locked = self.lock.lock();
            if locked.state == InstanceState::Connected || locked.state == InstanceState::Hosting {
                return Err(Error::AlreadyConnected);
            }
        }

        self.set_state(InstanceState::Connecting);
        let handle = self.next_async_handle(HandleClass::Connect);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        *self.connect_cancel.lock() = Some((handle, cancel_flag.clone()));

        let instance = self.clone();
        std::thread::spawn(move || {
            let result = instance.run_connect(&params, &cancel_flag);
            instance.connect_cancel.lock().take();

            match &result {
                Ok(()) => instance.set_state(InstanceState::Connected),
                Err(_) => instance.set_state(InstanceState::ConnectFailed),
            }
            instance.emit(Event::ConnectComplete {
                async_handle: handle,
                result,
            });
        });

        Ok(handle)
    }

    fn run_connect(self: &Arc<Self>, params: &ConnectParams, cancel_flag: &AtomicBool) -> Result<()> {
        if cancel_flag.load(Ordering::Acquire) {
            return Err(Error::UserCancel);
        }

        let stream = network::dial(SocketAddr::V4(params.host), Duration::from_secs(10))?;
        stream.set_nodelay(true)?;

        let request = Message::ConnectHost {
            instance: None,
            application: params.application,
            password: (!params.password.is_empty()).then(|| params.password.clone()),
            request_data: (!params.request_data.is_empty()).then(|| params.request_data.clone()),
            player_name: params.player_name.clone(),
            player_data: params.player_data.clone(),
        };

        write_all_blocking(&stream, &request.encode())?;
        let reply = read_framed_blocking(&stream, Duration::from_secs(10))?;

        match Message::decode(&reply)? {
            Message::ConnectHostOk {
                instance,
                host_player,
                assigned_player,
                peers,
                host_name,
                host_data,
                max_players,
                session_name,
                password,
                app_data,
                group_ids,
                ..
            } => {
                let assigned = PlayerId(assigned_player);
                let host_id = PlayerId(host_player);

                {
                    let mut locked = self.lock.lock();
                    locked.desc.instance = instance;
                    locked.desc.max_players = max_players;
                    locked.desc.session_name = session_name;
                    locked.desc.password = password;
                    locked.desc.app_data = app_data;
                    locked.local_player = Some(assigned);
                    locked.local_player_name = params.player_name.clone();
                    locked.local_player_data = params.player_data.clone();
                    locked.host_player = Some(host_id);
                    locked.desc.current_players = peers.len() as u32 + 2;

                    for group in &group_ids {
                        let gid = GroupId(*group);
                        locked
                            .groups
                            .entry(gid)
                            .or_insert_with(|| Group::new(gid, String::new(), Vec::new(), 0));
                    }
                }

                // The local player's own `CreatePlayer` comes first: an
                // application building its player list from these events
                // should always see itself before any remote player.
                self.emit(Event::CreatePlayer {
                    player_id: assigned,
                    name: params.player_name.clone(),
                    data: params.player_data.clone(),
                });
                self.emit(Event::CreatePlayer {
                    player_id: host_id,
                    name: host_name,
                    data: host_data,
                });

                self.register_established_stream(stream, host_id)?;

                if cancel_flag.load(Ordering::Acquire) {
                    return Err(Error::UserCancel);
                }
                self.connect_to_peers(&peers)?;
                Ok(())
            }
            Message::ConnectHostFail { error_code, .. } => Err(decode_error_code(error_code)),
            _ => Err(Error::Generic),
        }
    }

    fn connect_to_peers(self: &Arc<Self>, peers: &[PeerDescriptor]) -> Result<()> {
        for peer in peers {
            let addr = SocketAddrV4::new(peer.ipv4, peer.port);
            let (stream, name, data) = self.dial_peer(addr)?;
            self.register_established_stream(stream, PlayerId(peer.player))?;
            self.emit(Event::CreatePlayer {
                player_id: PlayerId(peer.player),
                name,
                data,
            });
        }

        Ok(())
    }

    /// Dials `addr` and runs the `CONNECT_PEER`/`CONNECT_PEER_OK`
    /// handshake, returning the established stream and the remote's
    /// current name/data. Shared by the initial mesh connect
    /// ([`Instance::connect_to_peers`]) and later dynamic joins
    /// ([`Instance::on_peer_joined`]).
    fn dial_peer(&self, addr: SocketAddrV4) -> Result<(std::net::TcpStream, String, Vec<u8>)> {
        let stream = network::dial(SocketAddr::V4(addr), Duration::from_secs(10))?;
        stream.set_nodelay(true)?;

        let (instance_id, password, local_id, local_name, local_data) = {
            let locked = self.lock.lock();
            (
                locked.desc.instance,
                locked.desc.password.clone(),
                locked.local_player.ok_or(Error::NotInitialised)?,
                locked.local_player_name.clone(),
                locked.local_player_data.clone(),
            )
        };

        let hello = Message::ConnectPeer {
            instance: instance_id,
            application: self.application_id,
            password,
            player: local_id.0,
            player_name: local_name,
            player_data: local_data,
        };
        write_all_blocking(&stream, &hello.encode())?;

        let reply = read_framed_blocking(&stream, Duration::from_secs(10))?;
        match Message::decode(&reply)? {
            Message::ConnectPeerOk { player_name, player_data, .. } => Ok((stream, player_name, player_data)),
            Message::ConnectPeerFail { error_code } => Err(decode_error_code(error_code)),
            _ => Err(Error::Generic),
        }
    }

    /// Registers a successfully dialed-out stream as `player_id`'s
    /// connection.
    ///
    /// Guards against the case where `player_id` also dialed us in the
    /// same window (both sides learned of each other and raced to
    /// connect): the peer whose own local player id is numerically lower
    /// keeps its outbound dial and tears down the other side's inbound
    /// connection once it loses the race; the higher-numbered peer simply
    /// drops its own outbound attempt and keeps the inbound one.
    fn register_established_stream(self: &Arc<Self>, stream: std::net::TcpStream, player_id: PlayerId) -> Result<()> {
        let remote = stream.peer_addr()?;
        let local_id = self.lock.lock().local_player.ok_or(Error::NotInitialised)?;

        if local_id.0 > player_id.0 {
            let already_connected = self
                .lock
                .lock()
                .peers
                .get(&player_id)
                .is_some_and(|(conn, _)| conn.state == PeerState::Connected);
            if already_connected {
                // `player_id`'s own dial into us already won; drop ours.
                return Ok(());
            }
        }

        stream.set_nonblocking(true)?;
        let mut mio_stream = TcpStream::from_std(stream);

        let conn = PeerConnection::new(PeerState::Connected, remote, 0);

        let instance = self.clone();
        let token = self.worker_pool.add_handle(
            &mut mio_stream,
            Interest::READABLE,
            Arc::new(move |token| instance.clone().on_socket_readable(token)),
        )?;

        let previous = self.lock.lock().peers.insert(player_id, (conn, token));

        if let Some((mut old_conn, old_token)) = previous {
            self.token_to_player.lock().remove(&old_token);
            if let Some(mut old_stream) = self.streams.lock().remove(&old_token) {
                let _ = self.worker_pool.remove_handle(&mut old_stream, old_token);
            }
            for handle in old_conn.send_queue.drain_handles(SendResult::ConnectionLost) {
                self.emit(Event::SendComplete {
                    async_handle: handle,
                    result: Err(Error::ConnectionLost),
                });
            }
        }

        self.token_to_player.lock().insert(token, player_id);
        self.streams.lock().insert(token, mio_stream);
        Ok(())
    }

    // ---- host enumeration --------------------------------------------------

    pub fn enum_hosts_sync(&self, params: EnumParams) -> Result<Vec<FoundHost>> {
        host_enum::enum_hosts_sync(params)
    }

    pub fn enum_hosts_async(&self, params: EnumParams) -> Result<Enumeration> {
        let handle = self.next_async_handle(HandleClass::Enum);
        let enumeration = Enumeration::start(params)?;
        self.enum_cancel_flags.lock().insert(handle, enumeration.cancel_flag());
        Ok(enumeration)
    }

    // ---- application data --------------------------------------------------

    /// Queues `data` for delivery to `target`, returning an async handle
    /// that completes via [`Event::SendComplete`] once the write finishes
    /// or fails. `timeout` schedules a deadline: a send still waiting
    /// behind others of its priority when it elapses completes with
    /// [`Error::TimedOut`] instead of ever reaching the socket.
    pub fn send_to(&self, target: PlayerId, data: Vec<u8>, priority: Priority, timeout: Option<Duration>) -> Result<u32> {
        let handle = self.next_async_handle(HandleClass::Send);

        let sender = self.lock.lock().local_player.ok_or(Error::NotInitialised)?;
        let message = Message::Data {
            sender: sender.0,
            payload: data,
            flags: 0,
        };

        let deadline = timeout.map(|d| Instant::now() + d);
        self.queue_to_peer(target, message.encode().to_vec(), priority, Some(handle), deadline)?;
        Ok(handle)
    }

    fn queue_to_peer(
        &self,
        target: PlayerId,
        bytes: Vec<u8>,
        priority: Priority,
        async_handle: Option<u32>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let token = {
            let mut locked = self.lock.lock();
            let (conn, token) = locked.peers.get_mut(&target).ok_or(Error::DoesNotExist)?;
            let buffer = Buffer::new(Bytes::from(bytes), None, async_handle.unwrap_or(0), deadline, |_| {});
            conn.send_queue.send(priority, buffer);
            *token
        };

        self.flush_peer(target, token);
        Ok(())
    }

    fn flush_peer(&self, player_id: PlayerId, token: Token) {
        loop {
            let mut streams = self.streams.lock();
            let Some(stream) = streams.get_mut(&token) else {
                return;
            };

            let mut locked = self.lock.lock();
            let Some((conn, _)) = locked.peers.get_mut(&player_id) else {
                return;
            };
            let Some(buf) = conn.send_queue.get_pending() else {
                return;
            };

            match stream.write(buf.remaining()) {
                Ok(0) => return,
                Ok(n) => {
                    buf.advance(n);
                    if !buf.is_exhausted() {
                        continue;
                    }

                    let handle = buf.async_handle;
                    let finished = conn.send_queue.pop_pending();
                    drop(locked);
                    drop(streams);

                    finished.complete(SendResult::Ok);
                    if handle != 0 {
                        self.emit(Event::SendComplete {
                            async_handle: handle,
                            result: Ok(()),
                        });
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    /// Outstanding, not-yet-in-flight send volume queued for `target`.
    /// `priority` restricts the count to one class; `None` sums all three.
    pub fn get_send_queue_info(&self, target: PlayerId, priority: Option<Priority>) -> Result<SendQueueInfo> {
        let locked = self.lock.lock();
        let (conn, _) = locked.peers.get(&target).ok_or(Error::DoesNotExist)?;

        Ok(match priority {
            None => conn.send_queue.queued_stats(),
            Some(p) => conn.send_queue.queued_in(p),
        })
    }

    // ---- peer/player introspection ------------------------------------------

    /// The name and opaque data currently on file for `target` — the local
    /// player included.
    pub fn get_peer_info(&self, target: PlayerId) -> Result<(String, Vec<u8>)> {
        let locked = self.lock.lock();
        if locked.local_player == Some(target) {
            return Ok((locked.local_player_name.clone(), locked.local_player_data.clone()));
        }
        let (conn, _) = locked.peers.get(&target).ok_or(Error::DoesNotExist)?;
        Ok((conn.player_name.clone(), conn.player_data.clone()))
    }

    /// The remote transport address of `target`'s connection. Has no
    /// answer for the local player, who isn't reached through `peers`.
    pub fn get_peer_address(&self, target: PlayerId) -> Result<Address> {
        let locked = self.lock.lock();
        let (conn, _) = locked.peers.get(&target).ok_or(Error::DoesNotExist)?;
        Ok(Address::Ipv4 {
            socket: SocketAddrV4::new(conn.remote_ip, conn.remote_tcp_port),
        })
    }

    /// The address this instance is reachable at while hosting; empty
    /// otherwise, since a non-hosting instance has no bound listener to
    /// report.
    pub fn get_local_host_addresses(&self) -> Result<Vec<Address>> {
        if !self.lock.lock().is_host {
            return Err(Error::NotHost);
        }

        let addr = self
            .listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok());

        Ok(match addr {
            Some(SocketAddr::V4(v4)) => vec![Address::Ipv4 { socket: v4 }],
            _ => Vec::new(),
        })
    }

    /// The opaque application context last associated with `target`. Reads
    /// back only what the application itself set elsewhere; the core never
    /// interprets it.
    pub fn get_player_context(&self, target: PlayerId) -> Result<u64> {
        let locked = self.lock.lock();
        if locked.local_player == Some(target) {
            return Ok(locked.local_player_context);
        }
        let (conn, _) = locked.peers.get(&target).ok_or(Error::DoesNotExist)?;
        Ok(conn.player_context)
    }

    pub fn get_group_context(&self, group_id: GroupId) -> Result<u64> {
        let locked = self.lock.lock();
        let group = locked.groups.get(&group_id).ok_or(Error::DoesNotExist)?;
        Ok(group.context)
    }

    /// Every currently known player and/or group id, per `filter`. Group
    /// ids are folded into the same `PlayerId` space via
    /// [`GroupId::as_player_id`], matching the flat id array
    /// `DPN_ENUMPLAYERSGROUPS` returns.
    pub fn enum_players_and_groups(&self, filter: EnumFilter) -> Vec<PlayerId> {
        let locked = self.lock.lock();
        let mut ids = Vec::new();

        if filter.players {
            ids.extend(locked.local_player);
            ids.extend(locked.peers.keys().copied());
        }
        if filter.groups {
            ids.extend(
                locked
                    .groups
                    .values()
                    .filter(|g| !g.destroyed)
                    .map(|g| g.id.as_player_id()),
            );
        }

        ids
    }

    pub fn enum_group_members(&self, group_id: GroupId) -> Result<Vec<PlayerId>> {
        let locked = self.lock.lock();
        let group = locked.groups.get(&group_id).ok_or(Error::DoesNotExist)?;
        Ok(group.members.iter().copied().collect())
    }

    // ---- groups -------------------------------------------------------------

    pub fn create_group(&self, name: String, data: Vec<u8>) -> Result<GroupId> {
        let mut locked = self.lock.lock();
        if !locked.is_host {
            return Err(Error::NotHost);
        }

        // `HandleClass::CreateGroup`'s tag bit is the same bit as
        // `GROUP_ID_BIT`, so the allocated handle is already usable
        // directly as a group id distinguishable from a `PlayerId`.
        let id = GroupId(locked.handles.allocate(HandleClass::CreateGroup));
        locked.groups.insert(id, Group::new(id, name.clone(), data.clone(), 0));
        drop(locked);

        self.emit(Event::CreateGroup { group_id: id, name, data });
        Ok(id)
    }

    pub fn destroy_group(&self, group_id: GroupId) -> Result<u32> {
        let mut locked = self.lock.lock();
        if !locked.is_host {
            return Err(Error::NotHost);
        }

        let group = locked.groups.get_mut(&group_id).ok_or(Error::DoesNotExist)?;
        group.destroyed = true;
        let context = group.context;
        drop(locked);

        let handle = self.next_async_handle(HandleClass::DestroyGroup);
        self.emit(Event::DestroyGroup { group_id, group_context: context });
        self.emit(Event::AsyncOpComplete { async_handle: handle, result: Ok(()) });
        Ok(handle)
    }

    pub fn add_player_to_group(&self, group_id: GroupId, player_id: PlayerId) -> Result<u32> {
        let mut locked = self.lock.lock();
        let group = locked.groups.get_mut(&group_id).ok_or(Error::DoesNotExist)?;
        if group.destroyed {
            return Err(Error::DoesNotExist);
        }
        group.members.insert(player_id);
        drop(locked);

        let handle = self.next_async_handle(HandleClass::AddToGroup);
        self.emit(Event::AddPlayerToGroup { group_id, player_id });
        self.emit(Event::AsyncOpComplete { async_handle: handle, result: Ok(()) });
        Ok(handle)
    }

    pub fn remove_player_from_group(&self, group_id: GroupId, player_id: PlayerId) -> Result<u32> {
        let mut locked = self.lock.lock();
        let group = locked.groups.get_mut(&group_id).ok_or(Error::DoesNotExist)?;
        group.members.remove(&player_id);
        drop(locked);

        let handle = self.next_async_handle(HandleClass::RemoveFromGroup);
        self.emit(Event::RemovePlayerFromGroup { group_id, player_id });
        self.emit(Event::AsyncOpComplete { async_handle: handle, result: Ok(()) });
        Ok(handle)
    }

    /// Updates a group's name/data/flags in place. Unlike
    /// [`Instance::create_group`]/[`Instance::destroy_group`] this has no
    /// async handle in the original interface; it completes synchronously.
    pub fn set_group_info(&self, group_id: GroupId, name: String, data: Vec<u8>, flags: u32) -> Result<()> {
        let mut locked = self.lock.lock();
        if !locked.is_host {
            return Err(Error::NotHost);
        }
        let group = locked.groups.get_mut(&group_id).ok_or(Error::DoesNotExist)?;
        group.name = name;
        group.data = data;
        group.flags = flags;
        drop(locked);

        self.emit(Event::GroupInfoUpdated { group_id });
        Ok(())
    }

    pub fn get_group_info(&self, group_id: GroupId) -> Result<(String, Vec<u8>, u32)> {
        let locked = self.lock.lock();
        let group = locked.groups.get(&group_id).ok_or(Error::DoesNotExist)?;
        Ok((group.name.clone(), group.data.clone(), group.flags))
    }

    /// Asks the host to add the local player to `group_id`; the group
    /// membership event fires once the host's `ACK` arrives, not here.
    pub fn join_group(&self, group_id: GroupId) -> Result<()> {
        let host = self.lock.lock().host_player.ok_or(Error::NotInitialised)?;

        let ack_id = {
            let mut locked = self.lock.lock();
            let (conn, _) = locked.peers.get_mut(&host).ok_or(Error::NoConnection)?;
            let id = conn.next_ack_id();
            conn.pending_acks.insert(id, PendingAck::GroupJoin { group: group_id });
            id
        };

        let message = Message::GroupJoin {
            group: group_id.0,
            ack_id,
            name: String::new(),
            data: Vec::new(),
        };
        self.queue_to_peer(host, message.encode().to_vec(), Priority::Medium, None, None)
    }

    pub fn leave_group(&self, group_id: GroupId) -> Result<()> {
        let host = self.lock.lock().host_player.ok_or(Error::NotInitialised)?;

        let ack_id = {
            let mut locked = self.lock.lock();
            let (conn, _) = locked.peers.get_mut(&host).ok_or(Error::NoConnection)?;
            let id = conn.next_ack_id();
            conn.pending_acks.insert(id, PendingAck::GroupLeave { group: group_id });
            id
        };

        let message = Message::GroupLeave {
            group: group_id.0,
            ack_id,
        };
        self.queue_to_peer(host, message.encode().to_vec(), Priority::Medium, None, None)
    }

    /// Pushes updated name/data for the local player to every connected
    /// peer (`DPN_SETPEERINFO`'s broadcast side).
    pub fn set_peer_info(&self, name: String, data: Vec<u8>) -> Result<u32> {
        {
            let mut locked = self.lock.lock();
            locked.local_player_name = name.clone();
            locked.local_player_data = data.clone();
        }

        let handle = self.next_async_handle(HandleClass::PlayerInfo);
        let local_id = self.lock.lock().local_player.ok_or(Error::NotInitialised)?;
        let targets: Vec<PlayerId> = self.lock.lock().peers.keys().copied().collect();

        for target in targets {
            let ack_id = {
                let mut locked = self.lock.lock();
                let Some((conn, _)) = locked.peers.get_mut(&target) else {
                    continue;
                };
                let id = conn.next_ack_id();
                conn.pending_acks.insert(id, PendingAck::PlayerInfo);
                id
            };

            let message = Message::PlayerInfo {
                player: local_id.0,
                name: name.clone(),
                data: data.clone(),
                ack_id,
            };
            let _ = self.queue_to_peer(target, message.encode().to_vec(), Priority::Medium, None, None);
        }

        self.emit(Event::AsyncOpComplete { async_handle: handle, result: Ok(()) });
        Ok(handle)
    }

    /// Sends to every current member of `group_id` except the local
    /// player, matching the "no loopback" contract of a group send.
    pub fn send_to_group(&self, group_id: GroupId, data: Vec<u8>, priority: Priority) -> Result<u32> {
        let handle = self.next_async_handle(HandleClass::Send);

        let (members, sender, local) = {
            let locked = self.lock.lock();
            let group = locked.groups.get(&group_id).ok_or(Error::DoesNotExist)?;
            (
                group.members.iter().copied().collect::<Vec<_>>(),
                locked.local_player.ok_or(Error::NotInitialised)?,
                locked.local_player,
            )
        };

        let message = Message::Data {
            sender: sender.0,
            payload: data,
            flags: 0,
        }
        .encode()
        .to_vec();

        for member in members {
            if Some(member) == local {
                continue;
            }
            let _ = self.queue_to_peer(member, message.clone(), priority, None, None);
        }

        self.emit(Event::SendComplete {
            async_handle: handle,
            result: Ok(()),
        });
        Ok(handle)
    }

    /// Cancels a single operation by `handle`, or (when `handle == 0`)
    /// every non-internal operation matching `scope`.
    pub fn cancel_async_operation(&self, handle: u32, scope: Option<CancelScope>) -> Result<()> {
        if handle != 0 {
            return self.cancel_single_handle(handle);
        }

        match scope.ok_or(Error::InvalidParam)? {
            CancelScope::Enum => {
                self.cancel_all_enums();
                Ok(())
            }
            CancelScope::Connect => {
                self.cancel_connect();
                Ok(())
            }
            CancelScope::PlayerSends => self.cancel_all_sends(None),
            CancelScope::PlayerSendsPriority(priority) => self.cancel_all_sends(Some(priority)),
            CancelScope::AllOperations => {
                self.cancel_all_enums();
                self.cancel_connect();
                self.cancel_all_sends(None)
            }
        }
    }

    /// Cancels a queued (not yet in-flight) send by its own handle. A send
    /// already handed to the socket completes on its own; this only
    /// reaches sends still waiting behind others in their priority class.
    fn cancel_single_handle(&self, handle: u32) -> Result<()> {
        let cancelled = {
            let mut locked = self.lock.lock();
            let mut found = None;
            for (conn, _) in locked.peers.values_mut() {
                if let Some(buf) = conn.send_queue.remove_queued_by_handle(handle) {
                    found = Some(buf);
                    break;
                }
            }
            found
        };

        if let Some(buf) = cancelled {
            let async_handle = buf.async_handle;
            buf.complete(SendResult::Cancelled);
            self.emit(Event::SendComplete {
                async_handle,
                result: Err(Error::UserCancel),
            });
            return Ok(());
        }

        if HandleClass::of(handle) == Some(HandleClass::Connect) {
            let mut guard = self.connect_cancel.lock();
            if guard.as_ref().is_some_and(|(h, _)| *h == handle) {
                if let Some((_, flag)) = guard.take() {
                    flag.store(true, Ordering::Release);
                }
                return Ok(());
            }
        }

        Err(Error::DoesNotExist)
    }

    fn cancel_all_enums(&self) {
        let flags: Vec<Arc<AtomicBool>> = self.enum_cancel_flags.lock().drain().map(|(_, f)| f).collect();
        for flag in flags {
            flag.store(true, Ordering::Release);
        }
    }

    fn cancel_connect(&self) {
        if let Some((_, flag)) = self.connect_cancel.lock().take() {
            flag.store(true, Ordering::Release);
        }
    }

    fn cancel_all_sends(&self, priority: Option<Priority>) -> Result<()> {
        let handles: Vec<u32> = {
            let mut locked = self.lock.lock();
            locked
                .peers
                .values_mut()
                .flat_map(|(conn, _)| conn.send_queue.drain_queued_by_priority(priority, SendResult::Cancelled))
                .collect()
        };

        for handle in handles {
            self.emit(Event::SendComplete {
                async_handle: handle,
                result: Err(Error::UserCancel),
            });
        }
        Ok(())
    }

    // ---- application description ----------------------------------------

    pub fn application_desc(&self) -> ApplicationDesc {
        self.lock.lock().desc.clone()
    }

    pub fn set_application_desc(&self, session_name: String, password: String, app_data: Vec<u8>) -> Result<()> {
        let mut locked = self.lock.lock();
        if !locked.is_host {
            return Err(Error::NotHost);
        }
        locked.desc.session_name = session_name;
        locked.desc.password = password;
        locked.desc.app_data = app_data;
        drop(locked);

        self.emit(Event::ApplicationDescUpdated);
        Ok(())
    }

    // ---- termination --------------------------------------------------------

    /// Host-only: severs one peer. The victim receives `DESTROY_PEER` with
    /// `destroy_data`; everyone else receives the same message with no
    /// data, so their own `PEER_JOINED`-built view drops the victim too.
    pub fn destroy_peer(&self, victim: PlayerId, destroy_data: Vec<u8>) -> Result<()> {
        let (victim_token, other_targets) = {
            let locked = self.lock.lock();
            if !locked.is_host {
                return Err(Error::NotHost);
            }
            let (_, token) = locked.peers.get(&victim).ok_or(Error::DoesNotExist)?;
            let others: Vec<PlayerId> = locked.peers.keys().copied().filter(|id| *id != victim).collect();
            (*token, others)
        };

        let to_victim = Message::DestroyPeer {
            player: victim.0,
            terminate_data: destroy_data,
        }
        .encode()
        .to_vec();
        let _ = self.queue_to_peer(victim, to_victim, Priority::High, None, None);

        let to_others = Message::DestroyPeer {
            player: victim.0,
            terminate_data: Vec::new(),
        }
        .encode()
        .to_vec();
        for target in other_targets {
            let _ = self.queue_to_peer(target, to_others.clone(), Priority::High, None, None);
        }

        self.handle_peer_disconnected(victim, victim_token);
        Ok(())
    }

    /// Host-only: broadcasts `TERMINATE_SESSION` without tearing down this
    /// instance's own sockets or state, unlike [`Instance::close`].
    pub fn terminate_session(&self, terminate_data: Vec<u8>) -> Result<()> {
        if !self.lock.lock().is_host {
            return Err(Error::NotHost);
        }

        let bytes = Message::TerminateSession {
            terminate_data: terminate_data.clone(),
        }
        .encode()
        .to_vec();
        self.broadcast_raw(bytes);

        self.emit(Event::TerminateSession { data: terminate_data });
        Ok(())
    }

    /// Releases a buffer previously handed to the application. A no-op:
    /// buffers here are owned `Vec<u8>`s that free themselves on drop,
    /// there is no pool to return them to.
    pub fn return_buffer(&self, _buffer: Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// Tears the instance down: every peer is told via `TERMINATE_SESSION`
    /// (if hosting), then every socket is deregistered.
    pub fn close(&self, terminate_data: Vec<u8>) -> Result<()> {
        self.set_state(InstanceState::Closing);
        self.timeout_sweeper_shutdown.store(true, Ordering::Release);

        let is_host = self.lock.lock().is_host;
        if is_host {
            let bytes = Message::TerminateSession {
                terminate_data: terminate_data.clone(),
            }
            .encode()
            .to_vec();
            self.broadcast_raw(bytes);
        }

        let entries: Vec<(PlayerId, PeerConnection, Token)> = {
            let mut locked = self.lock.lock();
            locked.peers.drain().map(|(id, (conn, token))| (id, conn, token)).collect()
        };

        for (_player_id, mut conn, token) in entries {
            self.token_to_player.lock().remove(&token);
            if let Some(mut stream) = self.streams.lock().remove(&token) {
                let _ = self.worker_pool.remove_handle(&mut stream, token);
            }

            let mut cancelled_handles = conn.send_queue.drain_handles(SendResult::Cancelled);
            if let Some(current) = conn.send_queue.get_pending() {
                let handle = current.async_handle;
                let current = conn.send_queue.pop_pending();
                if handle != 0 {
                    cancelled_handles.push(handle);
                }
                current.complete(SendResult::Cancelled);
            }
            for handle in cancelled_handles {
                self.emit(Event::SendComplete {
                    async_handle: handle,
                    result: Err(Error::UserCancel),
                });
            }
        }

        let listener_token = self.lock.lock().listener_token.take();
        if let Some(token) = listener_token {
            if let Some(mut listener) = self.listener.lock().take() {
                let _ = self.worker_pool.remove_handle(&mut listener, token);
            }
        }

        let discovery_token = self.lock.lock().discovery_token.take();
        if let Some(token) = discovery_token {
            if let Some(mut socket) = self.discovery.lock().take() {
                let _ = self.worker_pool.remove_handle(&mut socket, token);
            }
        }

        self.emit(Event::TerminateSession { data: terminate_data });
        Ok(())
    }

    fn broadcast_raw(&self, bytes: Vec<u8>) {
        let targets: Vec<PlayerId> = self.lock.lock().peers.keys().copied().collect();
        for target in targets {
            let _ = self.queue_to_peer(target, bytes.clone(), Priority::High, None, None);
        }
    }
}

fn decode_error_code(code: u32) -> Error {
    match code {
        1 => Error::InvalidApplication,
        2 => Error::InvalidPassword,
        3 => Error::HostRejectedConnection,
        _ => Error::Generic,
    }
}

fn write_all_blocking(mut stream: &std::net::TcpStream, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes)?;
    Ok(())
}

fn read_framed_blocking(stream: &std::net::TcpStream, timeout: Duration) -> Result<Vec<u8>> {
    let mut stream = stream.try_clone()?;
    stream.set_read_timeout(Some(timeout))?;

    let mut header = [0u8; 8];
    stream.read_exact(&mut header)?;
    let value_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;

    if value_len > network::MAX_PACKET_SIZE {
        return Err(Error::BufferTooSmall);
    }

    let mut body = vec![0u8; value_len];
    stream.read_exact(&mut body)?;

    let mut packet = Vec::with_capacity(8 + value_len);
    packet.extend_from_slice(&header);
    packet.extend_from_slice(&body);
    Ok(packet)
}

/// Splits zero or more complete outer packets (per the codec's own
/// `{type, value_length}` header) off the front of a connection's receive
/// buffer, leaving any trailing partial packet in place for the next read.
fn drain_complete_packets(buf: &mut BytesMut) -> Vec<Bytes> {
    let mut out = Vec::new();

    loop {
        if buf.len() < 8 {
            break;
        }

        let value_len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let total = 8 + value_len;

        if buf.len() < total {
            break;
        }

        out.push(buf.split_to(total).freeze());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_complete_packets_leaves_partial_trailing_packet() {
        let mut w = codec::PacketWriter::new(1);
        w.append_dword(7);
        let full = w.finish();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full);
        buf.extend_from_slice(&full[..full.len() - 1]);

        let packets = drain_complete_packets(&mut buf);
        assert_eq!(packets.len(), 1);
        assert_eq!(buf.len(), full.len() - 1);
    }
}
