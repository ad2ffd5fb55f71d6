//! Peer-to-peer session runtime: connection establishment, groups, and
//! application-message delivery over a host/peer mesh of TCP connections,
//! plus UDP broadcast discovery of open hosts.

pub mod address;
pub mod handle;
pub mod host_enum;
pub mod network;
pub mod send_queue;
pub mod session;
pub mod worker_pool;

pub use address::Address;
pub use session::{ApplicationDesc, Instance, InstanceState};

/// Identifies one connected application instance within a session.
///
/// Group identifiers are drawn from the same numeric space with
/// [`GROUP_ID_BIT`] set, so the two can never collide even though they're
/// exchanged over the wire as plain `u32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

/// Distinguishes a [`GroupId`] from a [`PlayerId`] drawn from the same
/// allocator; set on every id handed out as a group.
pub const GROUP_ID_BIT: u32 = 0x8000_0000;

impl PlayerId {
    pub const HOST: PlayerId = PlayerId(1);

    pub fn is_group(self) -> bool {
        self.0 & GROUP_ID_BIT != 0
    }
}

impl GroupId {
    pub fn as_player_id(self) -> PlayerId {
        PlayerId(self.0 | GROUP_ID_BIT)
    }
}

impl From<GroupId> for u32 {
    fn from(id: GroupId) -> u32 {
        id.0
    }
}

impl From<PlayerId> for u32 {
    fn from(id: PlayerId) -> u32 {
        id.0
    }
}

/// Errors returned from the public instance API.
///
/// Distinct from [`codec::Error`], which only ever describes a malformed
/// wire packet; a decode failure folds into [`Error::Generic`] with the
/// underlying cause logged, since by the time a caller sees it there is no
/// longer a specific parameter to blame.
#[derive(Debug)]
pub enum Error {
    InvalidParam,
    NotInitialised,
    AlreadyConnected,
    NotHost,
    NoConnection,
    BufferTooSmall,
    DoesNotExist,
    HostRejectedConnection,
    InvalidApplication,
    InvalidPassword,
    ConnectionLost,
    TimedOut,
    UserCancel,
    Generic,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(err: codec::Error) -> Self {
        log::warn!("packet decode failed: {err}");
        Error::Generic
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        log::warn!("socket operation failed: {err}");
        Error::ConnectionLost
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A host found via [`Instance::enum_hosts`], one per `ENUM_HOSTS_RESPONSE`
/// received before the enumeration's timeout elapsed.
#[derive(Debug, Clone)]
pub struct FoundHost {
    pub address: Address,
    pub application_desc: ApplicationDesc,
    pub response_data: Vec<u8>,
}

/// Snapshot of one peer's outbound queue depth, as reported by
/// `GetSendQueueInfo`. Counts only queued (not yet in-flight) sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendQueueInfo {
    pub messages: u32,
    pub bytes: u64,
}

/// Selects which players and/or groups `EnumPlayersAndGroups` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumFilter {
    pub players: bool,
    pub groups: bool,
}

/// Scope for a `handle == 0` [`Instance::cancel_async_operation`] call:
/// cancels every matching non-internal operation instead of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    Enum,
    Connect,
    PlayerSends,
    PlayerSendsPriority(crate::send_queue::Priority),
    AllOperations,
}

/// One event delivered to an [`ApplicationCallback`]. Each variant
/// corresponds to exactly one `DPN_MSGID_*` callback the original
/// interface dispatches; the instance lock is never held while a callback
/// runs (see `session::Instance::dispatch`).
#[derive(Debug, Clone)]
pub enum Event {
    EnumHostsQuery {
        from: Address,
        receive_data: Vec<u8>,
    },
    IndicateConnect {
        from: Address,
        request_data: Vec<u8>,
    },
    CreatePlayer {
        player_id: PlayerId,
        name: String,
        data: Vec<u8>,
    },
    DestroyPlayer {
        player_id: PlayerId,
        player_context: u64,
    },
    ConnectComplete {
        async_handle: u32,
        result: Result<()>,
    },
    Receive {
        sender: PlayerId,
        data: Vec<u8>,
    },
    SendComplete {
        async_handle: u32,
        result: Result<()>,
    },
    PeerInfo {
        player_id: PlayerId,
        name: String,
        data: Vec<u8>,
    },
    ApplicationDescUpdated,
    CreateGroup {
        group_id: GroupId,
        name: String,
        data: Vec<u8>,
    },
    DestroyGroup {
        group_id: GroupId,
        group_context: u64,
    },
    AddPlayerToGroup {
        group_id: GroupId,
        player_id: PlayerId,
    },
    RemovePlayerFromGroup {
        group_id: GroupId,
        player_id: PlayerId,
    },
    TerminateSession {
        data: Vec<u8>,
    },
    GroupInfoUpdated {
        group_id: GroupId,
    },
    AsyncOpComplete {
        async_handle: u32,
        result: Result<()>,
    },
}

/// The application's half of the instance: receives every [`Event`] the
/// instance raises. Object-safe so an instance can hold `Arc<dyn
/// ApplicationCallback>` without a generic parameter leaking into every
/// public type.
///
/// Every method has a default no-op body; implementors override only the
/// events they care about. Invoked from worker-pool threads with the
/// instance lock released, so a handler may freely call back into the
/// [`Instance`] that raised the event.
pub trait ApplicationCallback: Send + Sync {
    fn on_event(&self, event: Event) {
        let _ = event;
    }

    /// The host's admission decision for a peer that just passed
    /// `CONNECT_HOST` validation, raised synchronously after
    /// [`Event::IndicateConnect`]. `Ok(reply_data)` accepts the join and
    /// folds `reply_data` into `CONNECT_HOST_OK`'s response data;
    /// `Err(reply_data)` rejects it and folds `reply_data` into
    /// `CONNECT_HOST_FAIL`'s response data instead. The default accepts
    /// every join with no reply data, matching a host that never
    /// overrides this decision.
    fn indicate_connect(&self, from: Address, request_data: Vec<u8>) -> std::result::Result<Vec<u8>, Vec<u8>> {
        let _ = (from, request_data);
        Ok(Vec::new())
    }
}

/// An [`ApplicationCallback`] that drops every event; useful for tests and
/// for hosts that only care about the connection count.
pub struct NullCallback;

impl ApplicationCallback for NullCallback {}
