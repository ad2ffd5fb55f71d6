//! End-to-end tests that drive two or more real `Instance`s over loopback
//! sockets, the way `tests/turn.rs` exercises the teacher's router over
//! real STUN wire samples.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use session::host_enum::EnumParams;
use session::send_queue::Priority;
use session::session::{ConnectParams, HostParams};
use session::{ApplicationCallback, Event, Instance, InstanceState, NullCallback};

/// Collects every event an instance raises, for assertions after the
/// fact. Real application code would act on each event as it arrives;
/// tests only need to know one eventually showed up.
#[derive(Default)]
struct RecordingCallback {
    events: Mutex<Vec<Event>>,
}

impl ApplicationCallback for RecordingCallback {
    fn on_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingCallback {
    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn host_params(bind_port: u16) -> HostParams {
    HostParams {
        bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, bind_port),
        max_players: 0,
        session_name: "test session".to_string(),
        password: String::new(),
        app_data: Vec::new(),
        player_name: "host".to_string(),
        player_data: Vec::new(),
        respond_to_enum: false,
        discovery_port: 0,
    }
}

#[test]
fn connect_sync_assigns_player_and_exchanges_data() {
    let application = Uuid::new_v4();

    let host_cb = Arc::new(RecordingCallback::default());
    let host = Instance::new(application, host_cb.clone()).unwrap();
    host.host(host_params(17101)).unwrap();

    let client_cb = Arc::new(RecordingCallback::default());
    let client = Instance::new(application, client_cb.clone()).unwrap();
    client
        .connect(ConnectParams {
            host: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 17101),
            application,
            password: String::new(),
            request_data: Vec::new(),
            player_name: "alice".to_string(),
            player_data: Vec::new(),
        })
        .unwrap();

    assert!(client.wait_for_state(InstanceState::Connected, Duration::from_secs(5)));

    assert!(wait_until(Duration::from_secs(2), || {
        host_cb
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::CreatePlayer { name, .. } if name == "alice"))
    }));

    let local_player = client.application_desc().instance;
    assert_eq!(local_player, host.application_desc().instance);

    let everyone = session::PlayerId::HOST;
    client
        .send_to(everyone, b"hello host".to_vec(), Priority::Medium, None)
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        host_cb.snapshot().iter().any(|e| matches!(
            e,
            Event::Receive { data, .. } if data == b"hello host"
        ))
    }));

    host.close(Vec::new()).unwrap();
}

#[test]
fn host_close_terminates_connected_peers() {
    let application = Uuid::new_v4();

    let host_cb = Arc::new(RecordingCallback::default());
    let host = Instance::new(application, host_cb.clone()).unwrap();
    host.host(host_params(17102)).unwrap();

    let client_cb = Arc::new(RecordingCallback::default());
    let client = Instance::new(application, client_cb.clone()).unwrap();
    client
        .connect(ConnectParams {
            host: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 17102),
            application,
            password: String::new(),
            request_data: Vec::new(),
            player_name: "bob".to_string(),
            player_data: Vec::new(),
        })
        .unwrap();
    assert!(client.wait_for_state(InstanceState::Connected, Duration::from_secs(5)));

    let terminate_reason = b"shutting down".to_vec();
    host.close(terminate_reason.clone()).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        client_cb.snapshot().iter().any(|e| matches!(
            e,
            Event::TerminateSession { data } if *data == terminate_reason
        ))
    }));
}

#[test]
fn create_then_destroy_group_round_trips_through_host() {
    let application = Uuid::new_v4();
    let host = Instance::new(application, Arc::new(NullCallback)).unwrap();
    host.host(host_params(17103)).unwrap();

    let group = host.create_group("party".to_string(), b"meta".to_vec()).unwrap();
    assert!(group.as_player_id().is_group());

    host.add_player_to_group(group, session::PlayerId::HOST).unwrap();
    host.destroy_group(group).unwrap();

    // A destroyed group rejects further membership changes.
    assert!(host.add_player_to_group(group, session::PlayerId::HOST).is_err());

    host.close(Vec::new()).unwrap();
}

#[test]
fn send_to_group_reaches_members_but_not_the_sender() {
    let application = Uuid::new_v4();

    let host_cb = Arc::new(RecordingCallback::default());
    let host = Instance::new(application, host_cb.clone()).unwrap();
    host.host(host_params(17104)).unwrap();

    let client_cb = Arc::new(RecordingCallback::default());
    let client = Instance::new(application, client_cb.clone()).unwrap();
    client
        .connect(ConnectParams {
            host: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 17104),
            application,
            password: String::new(),
            request_data: Vec::new(),
            player_name: "carol".to_string(),
            player_data: Vec::new(),
        })
        .unwrap();
    assert!(client.wait_for_state(InstanceState::Connected, Duration::from_secs(5)));

    let member_id = wait_until(Duration::from_secs(2), || {
        host_cb.snapshot().iter().any(|e| matches!(e, Event::CreatePlayer { name, .. } if name == "carol"))
    });
    assert!(member_id);

    let carol = host_cb
        .snapshot()
        .into_iter()
        .find_map(|e| match e {
            Event::CreatePlayer { player_id, name, .. } if name == "carol" => Some(player_id),
            _ => None,
        })
        .unwrap();

    let group = host.create_group("lobby".to_string(), Vec::new()).unwrap();
    host.add_player_to_group(group, session::PlayerId::HOST).unwrap();
    host.add_player_to_group(group, carol).unwrap();

    host.send_to_group(group, b"group payload".to_vec(), Priority::Medium).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        client_cb.snapshot().iter().any(|e| matches!(
            e,
            Event::Receive { data, .. } if data == b"group payload"
        ))
    }));

    assert!(!host_cb
        .snapshot()
        .iter()
        .any(|e| matches!(e, Event::Receive { data, .. } if data == b"group payload")));

    host.close(Vec::new()).unwrap();
}

#[test]
fn enum_hosts_sync_finds_a_running_host() {
    let application = Uuid::new_v4();

    let host = Instance::new(application, Arc::new(NullCallback)).unwrap();
    let mut params = host_params(17105);
    params.respond_to_enum = true;
    params.discovery_port = 17205;
    params.session_name = "discoverable".to_string();
    host.host(params).unwrap();

    let found = session::host_enum::enum_hosts_sync(EnumParams {
        application: Some(application),
        broadcast: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 17205),
        user_data: Some(b"ping".to_vec()),
        count: 3,
        interval: Duration::from_millis(100),
        timeout: Duration::from_millis(800),
    })
    .unwrap();

    assert!(found.iter().any(|h| h.application_desc.session_name == "discoverable"));

    host.close(Vec::new()).unwrap();
}

#[test]
fn enum_hosts_async_can_be_cancelled_before_timeout() {
    let application = Uuid::new_v4();

    let host = Instance::new(application, Arc::new(NullCallback)).unwrap();
    let mut params = host_params(17106);
    params.respond_to_enum = true;
    params.discovery_port = 17206;
    host.host(params).unwrap();

    let enumeration = host
        .enum_hosts_async(EnumParams {
            application: Some(application),
            broadcast: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 17206),
            user_data: None,
            count: 100,
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(30),
        })
        .unwrap();

    assert!(!enumeration.is_done());
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    enumeration.cancel();
    let found = enumeration.wait();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!found.is_empty());

    host.close(Vec::new()).unwrap();
}
