use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meet_client_core::{
    config::{parse_url_list, ClientConfig},
    media::{synthetic::SyntheticDevices, TrackKind},
    peer::{webrtc::WebRtcConnector, PeerEvent},
    presence::Participant,
    signaling::websocket_url,
    Meeting, MeetingEvent, MeetingOptions,
};

#[derive(Parser, Debug)]
#[command(name = "meet")]
#[command(about = "Join a meet room from the terminal")]
struct Cli {
    /// Signaling server address (ws://, wss://, http:// or https://)
    #[arg(long, env = "MEET_SERVER_URL")]
    server: Option<String>,

    /// Room to join; a fresh one is requested from the server when omitted
    #[arg(long, short = 'r', env = "MEET_ROOM")]
    room: Option<String>,

    /// Name shown to other participants
    #[arg(long, short = 'n', env = "MEET_NAME", default_value = "guest")]
    name: String,

    /// Comma separated STUN urls
    #[arg(long, env = "MEET_STUN_URLS")]
    stun: Option<String>,

    /// Negotiation watchdog in milliseconds
    #[arg(long)]
    negotiation_timeout_ms: Option<u64>,

    /// Join with the microphone off
    #[arg(long)]
    no_audio: bool,

    /// Join with the camera off
    #[arg(long)]
    no_video: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeetingIdResponse {
    meeting_id: String,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("meet error: {e:#}");
        eprintln!("❌ {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ClientConfig::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(stun) = cli.stun.as_deref() {
        config.stun_urls = parse_url_list(stun);
    }
    if let Some(ms) = cli.negotiation_timeout_ms.filter(|ms| *ms > 0) {
        config.negotiation_timeout = Duration::from_millis(ms);
    }

    let room = match cli.room {
        Some(room) if !room.trim().is_empty() => room.trim().to_string(),
        _ => request_meeting_id(&config.server_url).await?,
    };

    let connector = Arc::new(WebRtcConnector::new(config.stun_urls.clone())?);
    let devices = Arc::new(SyntheticDevices::new());
    let options = MeetingOptions {
        room: room.clone(),
        display_name: cli.name,
        audio: !cli.no_audio,
        video: !cli.no_video,
    };

    println!("Joining room {room}. Commands: /mute /camera /share /unshare /leave");
    let mut meeting = Meeting::join(&config, options, connector, devices)
        .await
        .context("failed to join meeting")?;
    info!(room = %room, id = %meeting.local_id(), "joined");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                // EOF leaves the room like /leave
                let Ok(Some(line)) = line else { break };
                match line.trim() {
                    "" => {}
                    "/leave" | "/quit" => break,
                    "/mute" => meeting.toggle(TrackKind::Audio).await,
                    "/camera" => meeting.toggle(TrackKind::Video).await,
                    "/share" => meeting.start_screen_share().await,
                    "/unshare" => meeting.stop_screen_share().await,
                    text => {
                        if let Err(e) = meeting.send_chat(text) {
                            eprintln!("⚠️  chat not sent: {e}");
                        }
                    }
                }
                for event in meeting.take_events() {
                    render(&meeting, &event);
                }
            }
            input = meeting.next_input() => {
                for event in meeting.process(input).await {
                    render(&meeting, &event);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    meeting.leave().await;
    println!("Left room {room}");
    Ok(())
}

async fn request_meeting_id(server: &str) -> Result<String> {
    let mut url = websocket_url(server)?;
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot derive http url from {server}"))?;
    url.set_path("/api/meeting-id");
    let response: MeetingIdResponse = reqwest::get(url.as_str())
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await
        .context("invalid meeting id response")?;
    Ok(response.meeting_id)
}

fn render(meeting: &Meeting, event: &MeetingEvent) {
    match event {
        MeetingEvent::RosterChanged => {
            let names: Vec<String> = meeting
                .presence()
                .participants()
                .iter()
                .map(describe)
                .collect();
            println!("👥 {}", names.join(", "));
        }
        MeetingEvent::MemberJoined { display_name } => println!("➕ {display_name} joined"),
        MeetingEvent::MemberLeft { display_name } => println!("➖ {display_name} left"),
        MeetingEvent::Chat(entry) => println!("💬 {}: {}", entry.display_name, entry.text),
        MeetingEvent::Notice(notice) => println!("⚠️  {}", notice.text),
        MeetingEvent::Transport(status) => println!("🔌 signaling {status:?}"),
        MeetingEvent::Peer(PeerEvent::Connected { remote_id }) => {
            println!("🔗 media connected with {remote_id}")
        }
        MeetingEvent::Peer(PeerEvent::RemoteTrack { remote_id, track }) => {
            println!("🎞️  {:?} track from {remote_id}", track.kind)
        }
        MeetingEvent::Peer(_) => {}
    }
}

fn describe(participant: &Participant) -> String {
    let mic = if participant.has_audio { "🎤" } else { "🔇" };
    let cam = if participant.has_video { "📷" } else { "⬛" };
    format!("{} {mic}{cam}", participant.display_name)
}
