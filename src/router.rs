//! Inbound message parsing and classification.
//!
//! Every message carries a numeric `msgType`; the integer codes are part
//! of the wire contract and must stay stable, so the repr values below
//! are pinned rather than left to derive order.

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::client_id::ClientId;
use crate::registry::ClientRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Undefined = 0,
    VisDataArrive = 1,
    VisDataRequest = 2,
    VisDataFinish = 3,
    VisDataPause = 4,
    VisDataResume = 5,
    VisDataAbort = 6,
    UpdateTimeStep = 7,
    UpdateRateParam = 8,
    ModelDefinition = 9,
    HeartbeatPing = 10,
    HeartbeatPong = 11,
    PlayCache = 12,
    TrajectoryFileInfo = 13,
    GotoSimulationTime = 14,
    InitTrajectoryFile = 15,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Undefined,
            1 => Self::VisDataArrive,
            2 => Self::VisDataRequest,
            3 => Self::VisDataFinish,
            4 => Self::VisDataPause,
            5 => Self::VisDataResume,
            6 => Self::VisDataAbort,
            7 => Self::UpdateTimeStep,
            8 => Self::UpdateRateParam,
            9 => Self::ModelDefinition,
            10 => Self::HeartbeatPing,
            11 => Self::HeartbeatPong,
            12 => Self::PlayCache,
            13 => Self::TrajectoryFileInfo,
            14 => Self::GotoSimulationTime,
            15 => Self::InitTrajectoryFile,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(rename = "msgType")]
    msg_type: u8,
    #[serde(flatten)]
    rest: serde_json::Value,
}

/// A message handed to SimTick for processing, already classified.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: ClientId,
    pub msg_type: MsgType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("malformed message JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("unknown msgType {0}")]
    UnknownMsgType(u8),
    #[error("SimTick queue closed")]
    QueueClosed,
}

/// Parses inbound text frames, handles `heartbeat-pong` inline (it never
/// needs to wait behind a tick), and forwards everything else to
/// SimTick's FIFO for ordered, single-threaded dispatch.
pub struct MessageRouter {
    registry: std::sync::Arc<ClientRegistry>,
    sim_queue: mpsc::Sender<InboundMessage>,
}

impl MessageRouter {
    pub fn new(registry: std::sync::Arc<ClientRegistry>, sim_queue: mpsc::Sender<InboundMessage>) -> Self {
        Self { registry, sim_queue }
    }

    /// Parse and classify one text frame. Transient errors (bad JSON,
    /// unknown msgType) are logged and swallowed here rather than
    /// propagated, per this server's error taxonomy.
    pub async fn route(&self, sender: ClientId, raw: &str) {
        match self.try_route(sender, raw).await {
            Ok(()) => {}
            Err(RouterError::BadJson(e)) => {
                tracing::warn!(client = %sender.short(), error = %e, "dropping malformed message");
            }
            Err(RouterError::UnknownMsgType(code)) => {
                tracing::warn!(client = %sender.short(), msg_type = code, "dropping unknown msgType");
            }
            Err(RouterError::QueueClosed) => {
                tracing::warn!(client = %sender.short(), "SimTick queue closed, dropping message");
            }
        }
    }

    async fn try_route(&self, sender: ClientId, raw: &str) -> Result<(), RouterError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let msg_type = MsgType::from_u8(envelope.msg_type).ok_or(RouterError::UnknownMsgType(envelope.msg_type))?;

        if msg_type == MsgType::HeartbeatPong {
            self.registry.register_heartbeat(&sender);
            return Ok(());
        }

        self.sim_queue
            .send(InboundMessage {
                sender,
                msg_type,
                payload: envelope.rest,
            })
            .await
            .map_err(|_| RouterError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_id::ClientId;

    fn router() -> (std::sync::Arc<ClientRegistry>, mpsc::Receiver<InboundMessage>, MessageRouter) {
        let registry = std::sync::Arc::new(ClientRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let router = MessageRouter::new(registry.clone(), tx);
        (registry, rx, router)
    }

    #[tokio::test]
    async fn heartbeat_pong_is_handled_inline_and_not_queued() {
        let (registry, mut rx, router) = router();
        let uid = registry.add();
        registry.increment_missed_heartbeats(&uid);

        router.route(uid, r#"{"msgType":11}"#).await;

        assert_eq!(registry.get(&uid).unwrap().missed_heartbeats, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn recognized_message_is_forwarded_to_sim_queue() {
        let (registry, mut rx, router) = router();
        let uid = registry.add();

        router.route(uid, r#"{"msgType":4}"#).await;

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.msg_type, MsgType::VisDataPause);
        assert_eq!(msg.sender, uid);
    }

    #[tokio::test]
    async fn bad_json_is_dropped_silently() {
        let (_registry, mut rx, router) = router();
        let uid = ClientId::new();
        router.route(uid, "not json").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_msg_type_is_dropped() {
        let (_registry, mut rx, router) = router();
        let uid = ClientId::new();
        router.route(uid, r#"{"msgType":200}"#).await;
        assert!(rx.try_recv().is_err());
    }
}
