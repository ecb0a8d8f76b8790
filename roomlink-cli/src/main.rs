//! Roomlink CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use roomlink_core::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Fixed peer id (random when absent)
    #[arg(short, long, env = "ROOMLINK_IDENTITY")]
    identity: Option<String>,

    /// Coordinator configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room and print room events
    Join {
        /// Relay WebSocket URL
        #[arg(long, env = "ROOMLINK_RELAY")]
        relay: String,

        /// Room code
        #[arg(long)]
        room: String,

        /// Display name (random when absent)
        #[arg(long)]
        name: Option<String>,

        /// Join as host
        #[arg(long)]
        host: bool,
    },

    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roomlink=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Join {
            relay,
            room,
            name,
            host,
        } => {
            let name = name.unwrap_or_else(generate_display_name);
            let mut local = LocalParticipant::new(room, name);
            if let Some(identity) = cli.identity {
                local = local.with_peer_id(PeerId::new(identity));
            }
            if host {
                local = local.as_host();
            }
            handle_join(&relay, local, config).await?;
        }
        Commands::Status => {
            handle_status(&config)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(CoordinatorConfig::default()),
    }
}

async fn handle_join(relay: &str, local: LocalParticipant, config: CoordinatorConfig) -> Result<()> {
    println!(
        "🔗 Joining room {} as {} ({})",
        local.room_code, local.display_name, local.peer_id
    );

    let transport = WsRelayTransport::connect(relay)
        .await
        .with_context(|| format!("connecting to relay {relay}"))?;
    let signaling = Arc::new(SignalingHandler::new(Arc::new(transport)));
    let factory = WebRtcTransportFactory::new(&config)?;
    let coordinator = NegotiationCoordinator::new(local, config, factory, signaling)?;
    let mut events = coordinator.subscribe_events();

    let runner = coordinator.clone();
    let mut relay_task = tokio::spawn(async move { runner.run().await });

    println!("✅ Connected. Commands: mute, unmute, camera-on, camera-off, share, unshare, react <emoji>, peers, quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            finished = &mut relay_task => {
                match finished {
                    Ok(Ok(())) => println!("📴 Relay closed"),
                    Ok(Err(e)) => println!("❌ Relay error: {e}"),
                    Err(e) => println!("❌ Relay task failed: {e}"),
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_command(&coordinator, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::error!("Stdin error: {}", e);
                    break;
                }
            },
        }
    }

    coordinator.leave().await;
    println!("👋 Left room");
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_command<F, S>(coordinator: &NegotiationCoordinator<F, S>, line: &str) -> bool
where
    F: MediaTransportFactory,
    S: SignalingTransport,
{
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let status = coordinator.local_status();
    let result = match command {
        "" => Ok(()),
        "quit" | "exit" => return false,
        "mute" => coordinator.update_participant_status(true, status.is_camera_off).await,
        "unmute" => coordinator.update_participant_status(false, status.is_camera_off).await,
        "camera-off" => coordinator.update_participant_status(status.is_muted, true).await,
        "camera-on" => coordinator.update_participant_status(status.is_muted, false).await,
        "share" => coordinator.broadcast_screen_share_state(true).await,
        "unshare" => coordinator.broadcast_screen_share_state(false).await,
        "react" => {
            coordinator
                .send_broadcast(roomlink_core::BroadcastPayload::Reaction(
                    serde_json::json!({ "emoji": rest.trim() }),
                ))
                .await
        }
        "peers" => {
            for peer in coordinator.peers() {
                println!(
                    "   {} {}{} | {} | {:?} | {:?}",
                    peer.peer_id,
                    peer.display_name,
                    if peer.is_host { " (host)" } else { "" },
                    peer.signaling_state,
                    peer.connection_state,
                    peer.signal_quality,
                );
            }
            Ok(())
        }
        other => {
            println!("   Unknown command: {other}");
            Ok(())
        }
    };
    if let Err(e) = result {
        println!("❌ {e}");
    }
    true
}

fn print_event(event: &RoomEvent) {
    match event {
        RoomEvent::PeerJoined {
            peer_id,
            display_name,
        } => println!("➕ {display_name} joined ({peer_id})"),
        RoomEvent::PeerLeft { peer_id } => println!("➖ {peer_id} left"),
        RoomEvent::ConnectionStateChanged { peer_id, state } => {
            println!("🔌 {peer_id}: {state:?}");
        }
        RoomEvent::ConnectionLost { peer_id, restarts } => {
            println!("⚠️  {peer_id}: connection lost after {restarts} ICE restarts");
        }
        RoomEvent::QualityChanged {
            peer_id,
            quality,
            rtt_ms,
            ..
        } => println!("📶 {peer_id}: {quality:?} ({rtt_ms:?} ms)"),
        RoomEvent::Reaction { from_peer, payload } => println!("🎉 {from_peer}: {payload}"),
        RoomEvent::HostControl {
            from_peer,
            action,
            value,
        } => println!("🛡️  Host {from_peer}: {action:?} = {value}"),
        RoomEvent::LocalStatusChanged { status } => println!(
            "🎙️  muted: {} | camera off: {} | mic locked: {} | camera locked: {}",
            status.is_muted, status.is_camera_off, status.is_mic_locked, status.is_camera_locked
        ),
        other => tracing::debug!("Received event: {:?}", other),
    }
}

fn handle_status(config: &CoordinatorConfig) -> Result<()> {
    println!("📊 Roomlink CLI Status");
    println!("=====================");
    println!("Stats interval: {} ms", config.stats_interval_ms);
    println!("ICE servers:");
    for server in &config.ice_servers {
        println!("  {}", server.urls.join(", "));
    }
    println!();
    println!("Configuration (JSON):");
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    println!("Available commands:");
    println!("  roomlink join --relay <url> --room <code> [options]  - Join a room");
    println!("  roomlink status                                      - Show this status");
    println!();
    println!("Use 'roomlink --help' for detailed options");

    Ok(())
}

fn generate_display_name() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "dune", "ember", "fjord", "grove", "heath", "iris", "juniper",
        "kestrel", "lark", "maple", "nova", "otter", "pine", "quill", "raven", "sage", "tide",
        "umber", "vale", "willow", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    let first = WORDS[rng.gen_range(0..WORDS.len())];
    let second = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{first}-{second}")
}
