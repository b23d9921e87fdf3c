//! Transport: WebSocket accept loop, optional TLS, and the per-connection
//! outbound channel each worker uses to push frames to a client.
//!
//! Grounded on this codebase's existing `accept_async` + `ws_stream.split()`
//! + forwarding-task pattern: each accepted connection gets its own
//! outbound `mpsc` channel and a dedicated task that drains it onto the
//! socket, so a slow client's backpressure never blocks the worker that
//! produced the frame.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::client_id::ClientId;
use crate::registry::ClientRegistry;
use crate::router::MessageRouter;

pub const DEFAULT_PORT: u16 = 9002;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("tls configuration error: {0}")]
    Tls(String),
}

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;

/// Per-connection outbound channels, keyed by client UID. Any worker can
/// push a frame to any connected client through this table without
/// touching the socket directly.
///
/// Also holds the `JoinHandle` of each connection's read/forward task, the
/// same way the teacher's `CallManager` keeps `audio_loops:
/// RwLock<HashMap<String, JoinHandle<()>>>` so a session can be torn down
/// from outside its own task. Without this, evicting an unresponsive
/// client from `ClientRegistry` would drop its outbound channel but leave
/// the socket's read loop blocked on the peer forever.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    senders: Arc<DashMap<ClientId, OutboundSender>>,
    tasks: Arc<DashMap<ClientId, JoinHandle<()>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uid: ClientId, sender: OutboundSender) {
        self.senders.insert(uid, sender);
    }

    pub fn insert_task(&self, uid: ClientId, task: JoinHandle<()>) {
        self.tasks.insert(uid, task);
    }

    /// Drop this connection's bookkeeping without touching its task —
    /// used by the connection's own task as it exits normally.
    pub fn remove(&self, uid: &ClientId) {
        self.senders.remove(uid);
        self.tasks.remove(uid);
    }

    /// Force-close a connection from outside its own task: aborts the
    /// read/forward task (which drops the socket) and drops its outbound
    /// channel. Used by heartbeat eviction.
    pub fn force_close(&self, uid: &ClientId) {
        self.senders.remove(uid);
        if let Some((_, task)) = self.tasks.remove(uid) {
            task.abort();
        }
    }

    pub fn send_text(&self, uid: &ClientId, text: String) {
        if let Some(sender) = self.senders.get(uid) {
            let _ = sender.send(OutboundFrame::Text(text));
        }
    }

    pub fn send_json(&self, uid: &ClientId, value: &serde_json::Value) {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(uid, text),
            Err(e) => tracing::warn!(client = %uid.short(), error = %e, "failed to encode outbound json"),
        }
    }

    pub fn send_binary(&self, uid: &ClientId, bytes: Vec<u8>) {
        if let Some(sender) = self.senders.get(uid) {
            let _ = sender.send(OutboundFrame::Binary(bytes));
        }
    }

    pub fn broadcast_json(&self, value: &serde_json::Value) {
        let text = match serde_json::to_string(value) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode broadcast json");
                return;
            }
        };
        for entry in self.senders.iter() {
            let _ = entry.value().send(OutboundFrame::Text(text.clone()));
        }
    }

    pub fn connected_uids(&self) -> Vec<ClientId> {
        self.senders.iter().map(|e| *e.key()).collect()
    }
}

/// Loaded once at startup from `TLS_CERT_PATH`/`TLS_KEY_PATH`. Absent when
/// no paths are configured, in which case the server falls back to plain
/// `ws://` for local development and tests.
pub fn load_tls_acceptor(
    cert_path: &Path,
    key_path: &Path,
) -> Result<tokio_rustls::TlsAcceptor, WireError> {
    let cert_file = std::fs::File::open(cert_path).map_err(|e| WireError::Tls(e.to_string()))?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| WireError::Tls(e.to_string()))?;

    let key_file = std::fs::File::open(key_path).map_err(|e| WireError::Tls(e.to_string()))?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| WireError::Tls(e.to_string()))?
        .ok_or_else(|| WireError::Tls("no private key found".to_string()))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| WireError::Tls(e.to_string()))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

/// Accepts connections until `running` flips false. Each accepted stream
/// is assigned a `ClientId`, registered, and handed its own
/// read/forward task pair.
pub async fn listen(
    addr: SocketAddr,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    registry: Arc<ClientRegistry>,
    router: Arc<MessageRouter>,
    connections: ConnectionTable,
    running: Arc<AtomicBool>,
) -> Result<(), WireError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| WireError::Bind(addr, e))?;
    tracing::info!(%addr, tls = tls_acceptor.is_some(), "listening for connections");

    while running.load(Ordering::Acquire) {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
        };

        let uid = registry.add();
        let registry = registry.clone();
        let router = router.clone();
        let connections = connections.clone();
        let connections_for_task = connections.clone();
        let tls_acceptor = tls_acceptor.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, uid, tls_acceptor, registry, router, connections).await {
                tracing::warn!(%peer, error = %e, "connection ended with error");
            }
        });
        connections_for_task.insert_task(uid, task);
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    uid: ClientId,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    registry: Arc<ClientRegistry>,
    router: Arc<MessageRouter>,
    connections: ConnectionTable,
) -> Result<(), WireError> {
    tracing::info!(client = %uid.short(), %peer, "connection accepted");

    let result = match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| WireError::Tls(e.to_string()))?;
            run_socket(tls_stream, uid, router, connections.clone()).await
        }
        None => run_socket(stream, uid, router, connections.clone()).await,
    };

    registry.remove(&uid);
    connections.remove(&uid);
    tracing::info!(client = %uid.short(), "connection closed");
    result
}

async fn run_socket<S>(
    stream: S,
    uid: ClientId,
    router: Arc<MessageRouter>,
    connections: ConnectionTable,
) -> Result<(), WireError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| WireError::Tls(e.to_string()))?;
    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    connections.insert(uid, out_tx);

    let forward_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text),
                OutboundFrame::Binary(bytes) => Message::Binary(bytes),
            };
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_source.next().await {
        match message {
            Ok(Message::Text(text)) => router.route(uid, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(client = %uid.short(), error = %e, "websocket read error");
                break;
            }
        }
    }

    forward_task.abort();
    Ok(())
}
