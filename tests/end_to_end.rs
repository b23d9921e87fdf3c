//! End-to-end coverage: a real `WorkerOrchestrator` bound to an ephemeral
//! TCP port, driven by real WebSocket clients (and, for the CLI test, a
//! real compiled subprocess). Worker intervals are compressed via
//! `WorkerTiming` so these run in well under a second instead of waiting
//! on the production 15s heartbeat / 30s idle timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use simularium_server::orchestrator::WorkerTiming;
use simularium_server::{NullObjectStore, ServerConfig, Simulation, SyntheticSimPkg, TrajectoryCache, WorkerOrchestrator};
use tokio_tungstenite::tungstenite::Message;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> ServerConfig {
    let args = vec![
        "simularium-server".to_string(),
        "--port".to_string(),
        port.to_string(),
        "--no-timeout".to_string(),
    ];
    ServerConfig::parse_from(args)
}

async fn spawn_orchestrator(port: u16, timing: WorkerTiming) -> Arc<WorkerOrchestrator> {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(TrajectoryCache::new(dir.path(), Arc::new(NullObjectStore)));
    let pkg: Arc<dyn simularium_server::SimPkg> = Arc::new(SyntheticSimPkg::new(1.0));
    let simulation = Arc::new(Simulation::new(cache, vec![pkg]));
    let orchestrator = Arc::new(WorkerOrchestrator::new_with_timing(test_config(port), simulation, timing));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let running = orchestrator.clone();
    tokio::spawn(async move {
        let _ = running.run(addr).await;
    });

    // Give the Listen worker a moment to bind before clients connect.
    tokio::time::sleep(Duration::from_millis(30)).await;
    // Leak the tempdir for the test's lifetime; cleaned up by the OS tmp reaper.
    std::mem::forget(dir);
    orchestrator
}

/// §8 scenario 4: a client that stops answering `heartbeat-ping` gets
/// force-closed rather than left to linger until it disconnects itself.
#[tokio::test]
async fn unresponsive_client_is_force_closed() {
    let port = free_port();
    let timing = WorkerTiming {
        sim_tick: Duration::from_millis(20),
        heartbeat: Duration::from_millis(20),
        file_io: Duration::from_millis(20),
        no_client_timeout: Duration::from_secs(30),
    };
    let _orchestrator = spawn_orchestrator(port, timing).await;

    let url = format!("ws://127.0.0.1:{port}");
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (_sink, mut source) = ws_stream.split();

    // Never reply with heartbeat-pong. MAX_MISSED_HEARTBEATS is 4, so
    // 5 heartbeat ticks at 20ms guarantees eviction well inside the
    // timeout below.
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match source.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;

    assert!(closed.is_ok(), "connection was not force-closed within the timeout");
}

/// §8 scenario 6: a client that joins after a model-definition has
/// already been broadcast still receives it via the late-joiner cache.
#[tokio::test]
async fn late_joiner_receives_cached_model_definition() {
    let port = free_port();
    let timing = WorkerTiming {
        sim_tick: Duration::from_millis(20),
        heartbeat: Duration::from_secs(30),
        file_io: Duration::from_millis(20),
        no_client_timeout: Duration::from_secs(30),
    };
    let _orchestrator = spawn_orchestrator(port, timing).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (ws_a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut sink_a, _source_a) = ws_a.split();
    let model = serde_json::json!({ "msgType": 9, "name": "test-model" });
    sink_a.send(Message::Text(model.to_string())).await.unwrap();

    // Let SimTick pick up the model-definition and register client A.
    tokio::time::sleep(Duration::from_millis(80)).await;

    let (ws_b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (_sink_b, mut source_b) = ws_b.split();

    let received = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match source_b.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value.get("msgType").and_then(|v| v.as_u64()) == Some(9) {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                _ => panic!("connection closed before model-definition arrived"),
            }
        }
    })
    .await
    .expect("late joiner never received the cached model-definition");

    assert_eq!(received["model"]["name"], "test-model");
}

/// Drives the compiled reference client against a live-mode server and
/// checks it prints decoded frames on stdout.
#[tokio::test]
async fn control_cli_prints_live_frames() {
    let port = free_port();
    let timing = WorkerTiming {
        sim_tick: Duration::from_millis(20),
        heartbeat: Duration::from_secs(30),
        file_io: Duration::from_millis(20),
        no_client_timeout: Duration::from_secs(30),
    };
    let _orchestrator = spawn_orchestrator(port, timing).await;

    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_simularium-cli"))
        .arg("--url")
        .arg(format!("ws://127.0.0.1:{port}"))
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn simularium-cli");

    let stdout = child.stdout.take().unwrap();
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdout));

    let saw_frame = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.starts_with("frame ") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    let _ = child.kill().await;
    assert!(saw_frame, "simularium-cli never printed a decoded frame");
}
