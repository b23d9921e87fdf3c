//! Minimal reference client: connects, drives a trajectory, and prints
//! every binary frame's `(frameNumber, agentCount)` until `Finished` or
//! Ctrl-C. No JSON-model parsing — binary frames are decoded only far
//! enough to report their header fields.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use simularium_server::TrajectoryFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "simularium-cli", about = "Reference WebSocket client for a simularium-server instance")]
struct Args {
    /// ws:// or wss:// URL of the server.
    #[arg(long, default_value = "ws://127.0.0.1:9002")]
    url: String,

    /// File name to request playback for; omit to drive a live session.
    #[arg(long)]
    file_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let (ws_stream, _) = tokio_tungstenite::connect_async(&args.url).await?;
    let (mut sink, mut source) = ws_stream.split();

    let request = match &args.file_name {
        Some(name) => serde_json::json!({ "msgType": 2, "mode": "playback", "file-name": name }),
        None => serde_json::json!({ "msgType": 2, "mode": "live" }),
    };
    sink.send(Message::Text(request.to_string())).await?;
    sink.send(Message::Text(serde_json::json!({ "msgType": 5 }).to_string())).await?;

    while let Some(message) = source.next().await {
        match message? {
            Message::Binary(bytes) => {
                if let Some(frame) = TrajectoryFrame::from_bytes(&bytes) {
                    println!("frame {} agents={}", frame.frame_number, frame.agents.len());
                }
            }
            Message::Text(text) => {
                println!("{text}");
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
