use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use meet_proto::{ClientMessage, ServerMessage};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "meet-road")]
#[command(about = "Meet Road signaling server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to listen on (overrides MEET_ROAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room and print every server frame as JSON
    Probe {
        /// Signaling WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Room token to join
        #[arg(short, long)]
        room: String,

        /// Display name to join with
        #[arg(short, long, default_value = "probe")]
        name: String,

        /// Seconds to stay in the room
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
}

pub async fn run_probe(url: String, room: String, name: String, duration: u64) -> Result<()> {
    debug!("Connecting to {} for room {}", url, room);

    let (ws_stream, _) = timeout(Duration::from_secs(5), connect_async(url.as_str()))
        .await
        .context("connection timeout - is the signaling server running?")?
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::JoinRoom {
        room_token: room.clone(),
        display_name: name,
    };
    write.send(Message::Text(join.to_json()?)).await?;

    let deadline = Instant::now() + Duration::from_secs(duration);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => break,
            Err(_) => break,
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => println!("{}", serde_json::to_string_pretty(&message)?),
                Err(err) => println!("unparsed frame ({err}): {text}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let leave = ClientMessage::LeaveRoom { room_token: room };
    let _ = write.send(Message::Text(leave.to_json()?)).await;
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
