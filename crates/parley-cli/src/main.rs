//! # parley
//!
//! - `parley vad --input speech.raw` replays 16-bit little-endian PCM through the
//!   speech segmenter on audio time and prints every outbound signal as a JSON line.
//! - `parley monitor --room r1` connects the signaling WebSocket, announces an
//!   identity and prints inbound events until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use clap::{Parser, Subcommand};
use parley_session::directory::{HttpRoomDirectory, JoinRequest, RoomDirectory};
use parley_session::events::EventBus;
use parley_session::signaling::{OutboundSignal, SignalingChannel, WsSignalingChannel};
use parley_session::vad::VadManager;
use parley_session::SessionResult;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(name = "parley", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay raw PCM through the voice activity detector.
    Vad {
        /// Mono s16le PCM at the configured sample rate
        #[arg(short, long)]
        input: PathBuf,

        /// Frame size fed to the detector
        #[arg(long, default_value_t = 20)]
        frame_ms: u64,

        #[arg(long, default_value = "offline")]
        room: String,

        #[arg(long, default_value = "speaker")]
        user: String,
    },

    /// Watch a room's signaling traffic.
    Monitor {
        #[arg(short, long)]
        room: String,

        /// Peer id to announce; a random one if omitted
        #[arg(short, long)]
        user: Option<String>,

        /// Call the room directory before connecting
        #[arg(long)]
        http_join: bool,

        #[arg(long, env = "PARLEY_ROOM_PASSWORD")]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = parley_common::config::init()?;
    parley_common::telemetry::init(&config.logging);

    match cli.command {
        Command::Vad {
            input,
            frame_ms,
            room,
            user,
        } => run_vad(config, input, frame_ms, &room, &user).await,
        Command::Monitor {
            room,
            user,
            http_join,
            password,
        } => {
            let user = user.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            run_monitor(config, &room, &user, http_join, password).await
        }
    }
}

/// Prints outbound signals instead of sending them.
struct StdoutSignaling;

#[async_trait]
impl SignalingChannel for StdoutSignaling {
    async fn connect(&self) -> SessionResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        true
    }

    async fn emit(&self, signal: OutboundSignal) -> SessionResult<()> {
        let line = match &signal {
            OutboundSignal::AudioBuffer(chunk) => json!({
                "event": signal.name(),
                "userId": chunk.user_id,
                "roomId": chunk.room_id,
                "bytes": chunk.buffer.len(),
                "duration": chunk.duration,
                "sampleRate": chunk.sample_rate,
                "isFinal": chunk.is_final,
            }),
            _ => serde_json::to_value(&signal)?,
        };
        println!("{line}");
        Ok(())
    }
}

fn print_events(events: &mut broadcast::Receiver<parley_session::SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{line}");
        }
    }
}

async fn run_vad(
    config: &parley_common::config::AppConfig,
    input: PathBuf,
    frame_ms: u64,
    room: &str,
    user: &str,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes[..samples.len() * 2], &mut samples);
    let samples: Vec<f32> = samples.iter().map(|s| f32::from(*s) / 32768.0).collect();

    let vad_config = config.vad.clone();
    let sample_rate = u64::from(vad_config.sample_rate);
    let frame_len = usize::try_from(sample_rate * frame_ms / 1000)?.max(1);
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let vad = VadManager::new(vad_config, Arc::new(StdoutSignaling), events);
    vad.set_identity(user, room);
    vad.start()?;

    tracing::info!(
        input = %input.display(),
        samples = samples.len(),
        frame_len,
        "Replaying PCM"
    );
    let frame = Duration::from_millis(frame_ms);
    let mut at = Duration::ZERO;
    for chunk in samples.chunks(frame_len) {
        vad.push_frame_at(chunk, at).await;
        at += frame;
        vad.poll_at(at).await;
        print_events(&mut rx);
    }

    // Let a trailing silence timer expire before stopping.
    vad.poll_at(at + vad.config().silence_duration()).await;
    vad.stop().await;
    print_events(&mut rx);
    Ok(())
}

async fn run_monitor(
    config: &parley_common::config::AppConfig,
    room: &str,
    user: &str,
    http_join: bool,
    password: Option<String>,
) -> anyhow::Result<()> {
    if http_join {
        let directory = HttpRoomDirectory::new(&config.signaling.api_base_url)?;
        let response = directory
            .join(JoinRequest {
                room_id: room.to_owned(),
                peer_id: user.to_owned(),
                password,
            })
            .await?;
        tracing::info!(
            codecs = response.router_rtp_capabilities.codecs.len(),
            is_creator = response.is_creator,
            locked = response.locked,
            "Room directory accepted join"
        );
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let channel = WsSignalingChannel::new(&config.signaling.url, tx)?;
    tokio::time::timeout(config.session.signaling_connect_timeout(), channel.connect())
        .await
        .context("signaling connect timed out")??;
    channel
        .emit(OutboundSignal::Join {
            room_id: room.to_owned(),
            peer_id: user.to_owned(),
        })
        .await?;
    tracing::info!(%room, %user, url = %config.signaling.url, "Monitoring signaling");

    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Some(signal) => println!("{}", serde_json::to_string(&signal)?),
                None => {
                    tracing::warn!("Signaling connection closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }
    channel.disconnect().await;
    Ok(())
}
