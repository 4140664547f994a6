mod cli;
mod coordinator;
mod errors;
mod ice;
mod media;
mod registry;
mod session;
mod signaling;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use coordinator::{AppCommand, Coordinator, Event, RoomEvent, RunOutcome};
use huddle_protocol::HuddleConfig;
use media::{Facing, MediaManager, SyntheticCapture};
use signaling::SignalingCtx;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn load_config(path: Option<&str>) -> anyhow::Result<HuddleConfig> {
    let explicit = path.is_some();
    let path = path.unwrap_or("huddle.toml");
    match std::fs::read_to_string(path) {
        Ok(text) => {
            info!(path, "Loaded configuration");
            toml::from_str(&text).with_context(|| format!("Failed to parse {path}"))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            Ok(HuddleConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {path}")),
    }
}

/// Read single-letter control commands from stdin.
fn spawn_command_reader(events_tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let cmd = match line.trim() {
                "m" => AppCommand::ToggleAudio,
                "v" => AppCommand::ToggleVideo,
                "f" => AppCommand::SwitchCamera,
                "q" => AppCommand::Leave,
                "" => continue,
                other => {
                    warn!(input = other, "Unknown command (m/v/f/q)");
                    continue;
                }
            };
            if events_tx.send(Event::Command(cmd)).await.is_err() {
                return;
            }
        }
    });
}

fn spawn_room_event_logger(mut room_rx: mpsc::Receiver<RoomEvent>) {
    tokio::spawn(async move {
        while let Some(event) = room_rx.recv().await {
            match event {
                RoomEvent::RosterUpdated(roster) => {
                    let names: Vec<String> = roster
                        .iter()
                        .map(|e| match &e.name {
                            Some(name) => format!("{} ({name})", e.id),
                            None => e.id.to_string(),
                        })
                        .collect();
                    info!(participants = ?names, "Roster updated");
                }
                RoomEvent::PeerRemoved(peer) => info!(%peer, "Peer session ended"),
                RoomEvent::RemoteTrack { peer, kind } => {
                    info!(%peer, kind, "Receiving remote media");
                }
                RoomEvent::ConnectivityChanged { peer, connected } => {
                    info!(%peer, connected, "Peer connectivity changed");
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (needed for TLS WebSocket to the relay)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let config = load_config(args.config_path.as_deref())?;

    let server_url = args.server_url.unwrap_or(config.signaling.server_url);
    let tls_cert_path = args.tls_cert_path.or(config.signaling.tls_cert);
    let facing_name = args.facing.unwrap_or(config.media.facing);
    let facing = Facing::parse(&facing_name)
        .with_context(|| format!("Invalid facing {facing_name:?} (use user or environment)"))?;

    info!(
        room = %args.room_id,
        user = %args.user_id,
        server_url = %server_url,
        "Starting huddle-client"
    );

    // Capture failure is fatal: a participant without media cannot join
    let mut media = MediaManager::new(Arc::new(SyntheticCapture), config.media.framerate);
    media
        .acquire(facing)
        .context("Local capture failed, cannot join the room")?;

    let ice_servers = ice::gather_ice_servers(&config.ice, args.user_id).await;
    if ice_servers.is_empty() {
        warn!("No ICE servers configured; only host candidates will be gathered");
    }
    let restart_window = Duration::from_secs(config.recovery.restart_window_secs);

    // One event queue for the whole run: session callbacks, signaling,
    // stdin commands, and recovery timers all feed it
    let (events_tx, mut events_rx) = mpsc::channel::<Event>(256);
    let (room_tx, room_rx) = mpsc::channel::<RoomEvent>(64);
    spawn_room_event_logger(room_rx);
    spawn_command_reader(events_tx.clone());
    info!("Controls: m = toggle mic, v = toggle camera, f = flip camera, q = leave");

    {
        let tx = events_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, leaving room");
                let _ = tx.send(Event::Command(AppCommand::Leave)).await;
            }
        });
    }

    // Connect to the relay with exponential backoff retry. Each attempt gets
    // a fresh coordinator; sessions never survive a transport loss.
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(60);
    loop {
        // Discard events queued by the previous connection's sessions
        while events_rx.try_recv().is_ok() {}

        let (out_tx, mut out_rx) = mpsc::channel(64);
        let bridge = {
            let server_url = server_url.clone();
            let room_id = args.room_id.clone();
            let tls_cert_path = tls_cert_path.clone();
            let events_tx = events_tx.clone();
            let user_id = args.user_id;
            tokio::spawn(async move {
                let ctx = SignalingCtx {
                    server_url: &server_url,
                    room_id: &room_id,
                    user_id,
                    tls_cert_path: tls_cert_path.as_deref(),
                };
                signaling::run_bridge(&ctx, &mut out_rx, &events_tx).await
            })
        };

        let mut coordinator = Coordinator::new(
            args.user_id,
            args.room_id.clone(),
            ice_servers.clone(),
            &mut media,
            events_tx.clone(),
            out_tx,
            room_tx.clone(),
            restart_window,
        );
        let outcome = coordinator.run(&mut events_rx).await;
        drop(coordinator);

        match outcome {
            RunOutcome::Left => {
                let _ = bridge.await;
                info!("Left the room");
                break;
            }
            RunOutcome::TransportLost => {
                if let Ok(Err(e)) = bridge.await {
                    warn!("Relay connection error: {e}");
                }
                info!("Reconnecting in {} seconds...", backoff.as_secs());
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    media.stop();
    info!("Client shutdown complete");
    Ok(())
}
