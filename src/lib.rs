//! Simularium Server
//!
//! Real-time trajectory broadcasting server for molecular visualization
//! clients. Many browser connections stream precomputed or
//! live-simulated trajectories over WebSockets, each with its own
//! playback cursor, while frames are ingested from a running simulation
//! or a background file-preparation pipeline.
//!
//! # Architecture
//!
//! ```text
//! Wire -> MessageRouter -> WorkerOrchestrator -> Simulation -> TrajectoryCache -> BinaryTrajectoryFile
//!                                  |                                                    |
//!                                  v                                                    v
//!                          BroadcastEngine  <--------------------------------------------
//! ```
//!
//! Four long-lived tasks (Listen, SimTick, Heartbeat, FileIO) cooperate
//! through a `ClientRegistry`, a bounded `JobQueue` of file-preparation
//! requests, and the commit-at-count-update invariant of
//! `BinaryTrajectoryFile`.

pub mod broadcast;
pub mod client_id;
pub mod config;
pub mod job_queue;
pub mod object_store;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod simulation;
pub mod trajectory;
pub mod wire;

pub use broadcast::BroadcastEngine;
pub use client_id::ClientId;
pub use config::ServerConfig;
pub use job_queue::{FileRequest, JobQueue};
pub use object_store::{NullObjectStore, ObjectStore, ObjectStoreError, S3ObjectStore};
pub use orchestrator::WorkerOrchestrator;
pub use registry::{ClientRegistry, ClientState, PlayState};
pub use router::{InboundMessage, MessageRouter, MsgType};
pub use simulation::{SimMode, SimPkg, Simulation, SyntheticSimPkg};
pub use trajectory::{BinaryTrajectoryFile, TrajId, TrajectoryCache, TrajectoryFrame};
pub use wire::{ConnectionTable, OutboundFrame};

/// Installs the `tracing` subscriber, honoring `RUST_LOG`-style
/// env-filter directives. Call once at process startup.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
