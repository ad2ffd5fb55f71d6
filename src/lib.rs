pub mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use session::session::{ConnectParams, HostParams};
use session::{ApplicationCallback, Event, Instance};

use self::config::Config;

/// Logs every event at the level [`SOFTWARE`]'s operators care about:
/// connection and session lifecycle at `info`, message/ack traffic at
/// `debug`, failures the application should know about at `warn`.
struct LoggingCallback;

impl ApplicationCallback for LoggingCallback {
    fn on_event(&self, event: Event) {
        match event {
            Event::EnumHostsQuery { from, .. } => {
                log::debug!("answered host enumeration query from {from}");
            }
            Event::IndicateConnect { from, .. } => {
                log::info!("inbound connection from {from}");
            }
            Event::CreatePlayer { player_id, ref name, .. } => {
                log::info!("player {player_id:?} joined as {name:?}");
            }
            Event::DestroyPlayer { player_id, .. } => {
                log::info!("player {player_id:?} left");
            }
            Event::ConnectComplete { result: Err(ref err), .. } => {
                log::warn!("connect failed: {err}");
            }
            Event::ConnectComplete { .. } => {
                log::info!("connected");
            }
            Event::Receive { sender, ref data } => {
                log::debug!("{} bytes received from {sender:?}", data.len());
            }
            Event::SendComplete { result: Err(ref err), .. } => {
                log::warn!("send failed: {err}");
            }
            Event::SendComplete { .. } => {}
            Event::PeerInfo { player_id, .. } => {
                log::debug!("player {player_id:?} updated its info");
            }
            Event::ApplicationDescUpdated => {
                log::debug!("application description updated");
            }
            Event::CreateGroup { group_id, .. } => {
                log::info!("group {group_id:?} created");
            }
            Event::DestroyGroup { group_id, .. } => {
                log::info!("group {group_id:?} destroyed");
            }
            Event::AddPlayerToGroup { group_id, player_id } => {
                log::debug!("player {player_id:?} joined group {group_id:?}");
            }
            Event::RemovePlayerFromGroup { group_id, player_id } => {
                log::debug!("player {player_id:?} left group {group_id:?}");
            }
            Event::TerminateSession { .. } => {
                log::info!("session terminated");
            }
            Event::GroupInfoUpdated { group_id } => {
                log::debug!("group {group_id:?} info updated");
            }
            Event::AsyncOpComplete { result: Err(ref err), .. } => {
                log::warn!("async operation failed: {err}");
            }
            Event::AsyncOpComplete { .. } => {}
        }
    }
}

/// Replaces `main` so integration tests can start an instance directly
/// from a loaded [`Config`] without shelling out to the binary.
pub fn startup(config: Config) -> Result<()> {
    let instance = Instance::with_handles_per_block(
        config.instance.application,
        Arc::new(LoggingCallback),
        config.network.handles_per_block,
    )?;

    match (&config.instance.host, &config.instance.connect) {
        (Some(host), None) => {
            instance.host(HostParams {
                bind: host.bind,
                max_players: config.instance.max_players,
                session_name: config.instance.session_name.clone(),
                password: config.instance.password.clone(),
                app_data: config.instance.app_data.clone().into_bytes(),
                player_name: config.instance.player_name.clone(),
                player_data: config.instance.player_data.clone().into_bytes(),
                respond_to_enum: host.respond_to_enum,
                discovery_port: config.network.discovery_port,
            })?;

            log::info!(
                "hosting \"{}\" on {} (discovery {})",
                config.instance.session_name,
                host.bind,
                if host.respond_to_enum { "enabled" } else { "disabled" },
            );
        }
        (None, Some(connect)) => {
            let handle = instance.connect(ConnectParams {
                host: connect.host,
                application: config.instance.application,
                password: config.instance.password.clone(),
                request_data: connect.request_data.clone().into_bytes(),
                player_name: config.instance.player_name.clone(),
                player_data: config.instance.player_data.clone().into_bytes(),
            })?;

            log::info!("connecting to {} (async handle {handle})", connect.host);

            if !instance.wait_for_state(session::InstanceState::Connected, Duration::from_secs(30)) {
                bail!("timed out waiting to connect to {}", connect.host);
            }
        }
        (Some(_), Some(_)) => bail!("an instance cannot both host and connect"),
        (None, None) => bail!("config must set either [instance.host] or [instance.connect]"),
    }

    // Keeps the process alive so the worker pool's threads keep servicing
    // the session; nothing else here is asynchronous, so there's nothing
    // further for the main thread to drive.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
