//! Discovers open hosts on the local broadcast domain by sending repeated
//! `HOST_ENUM_REQUEST` datagrams and collecting `HOST_ENUM_RESPONSE`s
//! until a timeout or an explicit cancel.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use codec::Message;

use crate::address::Address;
use crate::network::{self, DISCOVERY_PORT};
use crate::session::ApplicationDesc;
use crate::{FoundHost, Result};

/// Parameters for one enumeration pass. Mirrors the `DPN_ENUMHOSTS_INFO` a
/// caller fills in before `DPN_ENUM_HOSTS_*`.
#[derive(Debug, Clone)]
pub struct EnumParams {
    /// Restricts responses to hosts running this application; `None`
    /// matches any application, mirroring a nulled `dwFlags` filter.
    pub application: Option<uuid::Uuid>,
    pub broadcast: SocketAddrV4,
    pub user_data: Option<Vec<u8>>,
    pub count: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for EnumParams {
    fn default() -> Self {
        Self {
            application: None,
            broadcast: SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT),
            user_data: None,
            count: network::DEFAULT_ENUM_COUNT,
            interval: Duration::from_millis(network::DEFAULT_ENUM_INTERVAL_MS),
            timeout: Duration::from_millis(network::DEFAULT_ENUM_TIMEOUT_MS),
        }
    }
}

/// A running enumeration. Dropping it joins the background thread, same
/// as an explicit [`Enumeration::cancel`] followed by [`Enumeration::wait`].
pub struct Enumeration {
    cancelled: Arc<AtomicBool>,
    found: Arc<Mutex<Vec<FoundHost>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Enumeration {
    pub fn start(params: EnumParams) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let found = Arc::new(Mutex::new(Vec::new()));

        let thread_cancelled = cancelled.clone();
        let thread_found = found.clone();

        let thread = std::thread::spawn(move || {
            run(socket, params, thread_cancelled, thread_found);
        });

        Ok(Self {
            cancelled,
            found,
            thread: Some(thread),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// The shared cancel flag this enumeration polls. Lets a caller holding
    /// only a handle (not this `Enumeration`) still request a cancel, e.g.
    /// `Instance::cancel_async_operation`'s `handle == 0` class-mask path.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Blocks until the enumeration's timeout elapses or it is cancelled,
    /// then returns every host discovered.
    pub fn wait(mut self) -> Vec<FoundHost> {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        std::mem::take(&mut *self.found.lock().unwrap())
    }

    pub fn is_done(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for Enumeration {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(
    socket: UdpSocket,
    params: EnumParams,
    cancelled: Arc<AtomicBool>,
    found: Arc<Mutex<Vec<FoundHost>>>,
) {
    let request = Message::HostEnumRequest {
        application: params.application,
        user_data: params.user_data.clone(),
        tick: 0,
    };
    let payload = request.encode();

    // Extended by `timeout` on every transmit, so the last probe still
    // gets a full response window rather than sharing one fixed deadline
    // with the first.
    let mut deadline = Instant::now() + params.timeout;
    let mut sent = 0u32;
    let mut next_send = Instant::now();
    let mut recv_buf = [0u8; network::MAX_PACKET_SIZE];

    while Instant::now() < deadline {
        if cancelled.load(Ordering::Acquire) {
            return;
        }

        if sent < params.count && Instant::now() >= next_send {
            if socket
                .send_to(&payload, SocketAddr::V4(params.broadcast))
                .is_err()
            {
                log::warn!("host enumeration broadcast send failed");
            }
            sent += 1;
            next_send += params.interval;
            deadline = Instant::now() + params.timeout;
        }

        match socket.recv_from(&mut recv_buf) {
            Ok((len, from)) => {
                if let Ok(Message::HostEnumResponse {
                    flags,
                    instance,
                    application,
                    max_players,
                    current_players,
                    session_name,
                    app_data,
                    response_data,
                    ..
                }) = Message::decode(&recv_buf[..len])
                {
                    let SocketAddr::V4(from_v4) = from else {
                        continue;
                    };

                    found.lock().unwrap().push(FoundHost {
                        address: Address::Ipv4 { socket: from_v4 },
                        application_desc: ApplicationDesc {
                            flags,
                            instance,
                            application,
                            max_players,
                            current_players,
                            session_name,
                            password: String::new(),
                            app_data: app_data.unwrap_or_default(),
                        },
                        response_data: response_data.unwrap_or_default(),
                    });
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                log::warn!("host enumeration receive failed: {err}");
                return;
            }
        }
    }
}

/// Blocking, synchronous host enumeration (`DPN_ENUM_HOSTS_SYNC`).
///
/// `count == 0` selects [`network::DEFAULT_ENUM_COUNT`] rather than
/// being rejected.
pub fn enum_hosts_sync(mut params: EnumParams) -> Result<Vec<FoundHost>> {
    if params.count == 0 {
        params.count = network::DEFAULT_ENUM_COUNT;
    }
    Ok(Enumeration::start(params)?.wait())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_count_selects_the_default_count() {
        let params = EnumParams {
            count: 0,
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(10),
            broadcast: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            ..Default::default()
        };
        // Nothing is listening on the chosen port; this only checks that
        // a zero count doesn't short-circuit with `InvalidParam`.
        assert!(enum_hosts_sync(params).is_ok());
    }
}
