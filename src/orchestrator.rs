//! Spawns and coordinates the four long-lived workers: Listen, SimTick,
//! Heartbeat, FileIO. Cooperative shutdown via a single `AtomicBool`
//! polled at every loop head.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broadcast::BroadcastEngine;
use crate::client_id::ClientId;
use crate::config::ServerConfig;
use crate::job_queue::{FileRequest, JobQueue};
use crate::registry::{ClientRegistry, PlayState};
use crate::router::{InboundMessage, MessageRouter, MsgType};
use crate::simulation::{SimMode, Simulation};
use crate::trajectory::TrajId;
use crate::wire::{self, ConnectionTable};

const SIM_TICK_INTERVAL: Duration = Duration::from_millis(200);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const FILE_IO_INTERVAL: Duration = Duration::from_millis(100);
const NO_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const INBOUND_QUEUE_CAPACITY: usize = 256;
const FILE_REQUEST_QUEUE_CAPACITY: usize = 64;

/// Worker tick intervals, split out from the constants above so tests can
/// run the four workers on a compressed clock instead of waiting on
/// production-scale timeouts.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    pub sim_tick: Duration,
    pub heartbeat: Duration,
    pub file_io: Duration,
    pub no_client_timeout: Duration,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            sim_tick: SIM_TICK_INTERVAL,
            heartbeat: HEARTBEAT_INTERVAL,
            file_io: FILE_IO_INTERVAL,
            no_client_timeout: NO_CLIENT_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct LateJoinerCache {
    model_definition: Option<serde_json::Value>,
    rate_params: HashMap<String, f64>,
    time_step: Option<f64>,
}

pub struct WorkerOrchestrator {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    simulation: Arc<Simulation>,
    connections: ConnectionTable,
    job_queue: Arc<JobQueue>,
    router: Arc<MessageRouter>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    broadcast: BroadcastEngine,
    running: Arc<AtomicBool>,
    active_mode_owner: Mutex<Option<ClientId>>,
    late_joiner_cache: Mutex<LateJoinerCache>,
    known_uids: Mutex<std::collections::HashSet<ClientId>>,
    sim_dt: Mutex<f64>,
    idle_since_instant: Mutex<Option<Instant>>,
    timing: WorkerTiming,
}

impl WorkerOrchestrator {
    pub fn new(config: ServerConfig, simulation: Arc<Simulation>) -> Self {
        Self::new_with_timing(config, simulation, WorkerTiming::default())
    }

    pub fn new_with_timing(config: ServerConfig, simulation: Arc<Simulation>, timing: WorkerTiming) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let connections = ConnectionTable::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let router = Arc::new(MessageRouter::new(registry.clone(), inbound_tx));
        let broadcast = BroadcastEngine::new(registry.clone(), simulation.clone(), connections.clone());

        Self {
            config,
            registry,
            simulation,
            connections,
            job_queue: Arc::new(JobQueue::new(FILE_REQUEST_QUEUE_CAPACITY)),
            router,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            broadcast,
            running: Arc::new(AtomicBool::new(true)),
            active_mode_owner: Mutex::new(None),
            late_joiner_cache: Mutex::new(LateJoinerCache::default()),
            known_uids: Mutex::new(std::collections::HashSet::new()),
            sim_dt: Mutex::new(1.0),
            idle_since_instant: Mutex::new(Some(Instant::now())),
            timing,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Runs Listen, SimTick, Heartbeat, and FileIO in parallel across the
    /// runtime's worker threads until shutdown, then joins all four.
    pub async fn run(self: Arc<Self>, addr: std::net::SocketAddr) -> Result<(), crate::wire::WireError> {
        let tls_acceptor = self.config.tls_acceptor()?;

        let listen_result_task = {
            let registry = self.registry.clone();
            let router = self.router.clone();
            let connections = self.connections.clone();
            let running = self.running.clone();
            tokio::spawn(wire::listen(addr, tls_acceptor, registry, router, connections, running))
        };

        let sim_tick_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_sim_tick().await })
        };
        let heartbeat_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_heartbeat().await })
        };
        let file_io_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_file_io().await })
        };

        let listen_result = listen_result_task.await.expect("listen worker panicked");
        let _ = tokio::join!(sim_tick_task, heartbeat_task, file_io_task);
        listen_result
    }

    pub fn close_server(&self) {
        self.running.store(false, Ordering::Release);
    }

    // ---- SimTick ----

    async fn run_sim_tick(&self) {
        let mut rx = self
            .inbound_rx
            .lock()
            .take()
            .expect("SimTick started more than once");

        let mut ticker = tokio::time::interval(self.timing.sim_tick);
        while self.running.load(Ordering::Acquire) {
            ticker.tick().await;
            self.catch_up_new_connections();

            while let Ok(msg) = rx.try_recv() {
                self.handle_inbound(msg).await;
            }

            if self.registry.is_empty() {
                continue;
            }

            if self.simulation.mode() == SimMode::Live {
                let dt = *self.sim_dt.lock();
                if let Err(e) = self.simulation.run_time_step(dt).await {
                    tracing::warn!(error = %e, "live time step failed");
                }
            }

            self.broadcast.tick();
        }

        self.inbound_rx.lock().replace(rx);
    }

    fn catch_up_new_connections(&self) {
        let current: std::collections::HashSet<ClientId> = self.registry.all_uids().into_iter().collect();
        let mut known = self.known_uids.lock();
        let new_uids: Vec<ClientId> = current.difference(&known).copied().collect();
        *known = current;
        drop(known);

        if new_uids.is_empty() {
            return;
        }
        let cache = self.late_joiner_cache.lock();
        for uid in new_uids {
            if let Some(model) = &cache.model_definition {
                self.connections.send_json(&uid, model);
            }
            for (name, value) in &cache.rate_params {
                self.connections.send_json(
                    &uid,
                    &serde_json::json!({ "msgType": MsgType::UpdateRateParam.as_u8(), "paramName": name, "paramValue": value }),
                );
            }
        }
    }

    async fn handle_inbound(&self, msg: InboundMessage) {
        match msg.msg_type {
            MsgType::VisDataRequest => self.handle_vis_data_request(msg).await,
            MsgType::VisDataPause => self.registry.set_play_state(&msg.sender, PlayState::Paused),
            MsgType::VisDataResume => self.registry.set_play_state(&msg.sender, PlayState::Playing),
            MsgType::VisDataAbort => self.registry.set_play_state(&msg.sender, PlayState::Stopped),
            MsgType::UpdateTimeStep => self.handle_update_time_step(msg),
            MsgType::UpdateRateParam => self.handle_update_rate_param(msg),
            MsgType::ModelDefinition => self.handle_model_definition(msg),
            MsgType::GotoSimulationTime => self.handle_goto_simulation_time(msg),
            MsgType::InitTrajectoryFile => self.handle_init_trajectory_file(msg),
            _ => {}
        }
    }

    fn handle_update_time_step(&self, msg: InboundMessage) {
        if let Some(dt) = msg.payload.get("timeStep").and_then(|v| v.as_f64()) {
            *self.sim_dt.lock() = dt;
            self.late_joiner_cache.lock().time_step = Some(dt);
            self.connections.broadcast_json(&serde_json::json!({
                "msgType": MsgType::UpdateTimeStep.as_u8(),
                "timeStep": dt,
            }));
        }
    }

    fn handle_update_rate_param(&self, msg: InboundMessage) {
        let (Some(name), Some(value)) = (
            msg.payload.get("paramName").and_then(|v| v.as_str()),
            msg.payload.get("paramValue").and_then(|v| v.as_f64()),
        ) else {
            return;
        };
        self.late_joiner_cache
            .lock()
            .rate_params
            .insert(name.to_string(), value);
        self.connections.broadcast_json(&serde_json::json!({
            "msgType": MsgType::UpdateRateParam.as_u8(),
            "paramName": name,
            "paramValue": value,
        }));
    }

    fn handle_model_definition(&self, msg: InboundMessage) {
        let envelope = serde_json::json!({
            "msgType": MsgType::ModelDefinition.as_u8(),
            "model": msg.payload,
        });
        self.late_joiner_cache.lock().model_definition = Some(envelope.clone());
        self.connections.broadcast_json(&envelope);
    }

    fn handle_goto_simulation_time(&self, msg: InboundMessage) {
        let Some(state) = self.registry.get(&msg.sender) else { return };
        let Some(time_ns) = msg.payload.get("time").and_then(parse_f64_field) else { return };
        let frame = self.simulation.get_closest_frame_number_for_time(&state.sim_id, time_ns);
        self.broadcast.send_single_frame_to_client(&msg.sender, &state.sim_id, frame);
    }

    fn handle_init_trajectory_file(&self, msg: InboundMessage) {
        let Some(file_name) = msg.payload.get("file-name").and_then(|v| v.as_str()) else { return };
        let request = FileRequest {
            sender: msg.sender,
            file_name: file_name.to_string(),
            frame_number: None,
        };
        if self.job_queue.try_push(request).is_err() {
            tracing::warn!(client = %msg.sender.short(), "file request queue full, dropping init request");
        }
    }

    async fn handle_vis_data_request(&self, msg: InboundMessage) {
        let mode = msg.payload.get("mode").and_then(|v| v.as_str()).unwrap_or("");

        if mode != "playback" && !self.claim_active_mode(msg.sender) {
            tracing::warn!(client = %msg.sender.short(), "rejecting mode change: another client is active");
            return;
        }

        match mode {
            "live" => {
                self.registry.set_sim_id(&msg.sender, TrajId::live());
                self.simulation.set_mode(SimMode::Live);
                self.simulation.set_sim_id(TrajId::live());
                let _ = self.simulation.reset().await;
            }
            "prerun" => {
                let time_step = msg.payload.get("timeStep").and_then(parse_f64_field).unwrap_or(1.0);
                let num_steps = msg.payload.get("numTimeSteps").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

                self.registry.set_sim_id(&msg.sender, TrajId::prerun());
                self.simulation.set_mode(SimMode::Prerun);
                self.simulation.set_sim_id(TrajId::prerun());
                let _ = self.simulation.reset().await;

                if !self.simulation.cache().contains(&TrajId::prerun()) {
                    if let Err(e) = self
                        .simulation
                        .cache()
                        .create(&TrajId::prerun(), num_steps.max(1))
                    {
                        tracing::warn!(error = %e, "failed to create prerun cache");
                        return;
                    }
                }
                *self.sim_dt.lock() = time_step;
                for _ in 0..num_steps {
                    if self.simulation.load_next_frame(&TrajId::prerun()).await.is_err() {
                        break;
                    }
                }
                let props = crate::trajectory::TrajectoryFileProperties {
                    number_of_frames: num_steps,
                    time_step_size: time_step,
                    ..Default::default()
                };
                self.simulation.cache().set_properties(&TrajId::prerun(), props);
            }
            "playback" => {
                let Some(file_name) = msg.payload.get("file-name").and_then(|v| v.as_str()) else {
                    return;
                };
                let id = TrajId::file(file_name);
                self.registry.set_sim_id(&msg.sender, id.clone());
                self.simulation.set_mode(SimMode::Playback);

                let frame_number = msg.payload.get("frameNumber").and_then(|v| v.as_u64()).map(|v| v as u32);
                self.registry.set_play_state(
                    &msg.sender,
                    if frame_number.is_none() { PlayState::Playing } else { PlayState::Paused },
                );

                let request = FileRequest {
                    sender: msg.sender,
                    file_name: file_name.to_string(),
                    frame_number,
                };
                if self.job_queue.try_push(request).is_err() {
                    tracing::warn!(client = %msg.sender.short(), "file request queue full, dropping playback request");
                }
            }
            _ => {
                tracing::warn!(client = %msg.sender.short(), mode, "unrecognized vis-data-request mode");
            }
        }
    }

    fn claim_active_mode(&self, sender: ClientId) -> bool {
        let mut owner = self.active_mode_owner.lock();
        match *owner {
            Some(existing) if existing != sender && self.registry.len() != 1 => false,
            _ => {
                *owner = Some(sender);
                true
            }
        }
    }

    // ---- Heartbeat ----

    async fn run_heartbeat(&self) {
        let mut ticker = tokio::time::interval(self.timing.heartbeat);
        while self.running.load(Ordering::Acquire) {
            ticker.tick().await;

            if self.registry.is_empty() {
                if let Some(age) = self.idle_since() {
                    if age >= self.timing.no_client_timeout && !self.config.no_timeout {
                        tracing::info!("no clients connected past timeout, shutting down");
                        self.close_server();
                        break;
                    }
                }
                continue;
            }
            self.reset_idle_timer();

            let expired = self.registry.sweep_expired();
            for uid in &expired {
                tracing::info!(client = %uid.short(), "removing unresponsive network connection");
                self.connections.force_close(uid);
            }

            let ping = serde_json::json!({ "msgType": MsgType::HeartbeatPing.as_u8() });
            self.connections.broadcast_json(&ping);
        }
    }

    fn idle_since(&self) -> Option<Duration> {
        let mut guard = self.idle_since_instant.lock();
        let start = *guard.get_or_insert_with(Instant::now);
        Some(start.elapsed())
    }

    fn reset_idle_timer(&self) {
        *self.idle_since_instant.lock() = None;
    }

    // ---- FileIO ----

    async fn run_file_io(&self) {
        let mut ticker = tokio::time::interval(self.timing.file_io);
        while self.running.load(Ordering::Acquire) {
            ticker.tick().await;
            for request in self.job_queue.drain() {
                self.process_file_request(request).await;
            }
        }
    }

    async fn process_file_request(&self, request: FileRequest) {
        let Some(state) = self.registry.get(&request.sender) else {
            tracing::debug!(file = %request.file_name, "abandoning file request: client gone");
            return;
        };
        if state.sim_id.as_str() != request.file_name {
            tracing::debug!(
                client = %request.sender.short(),
                requested = %request.file_name,
                current = %state.sim_id,
                "abandoning stale file request"
            );
            return;
        }

        let id = TrajId::file(request.file_name.clone());
        self.prepare_trajectory(&id, &request.file_name).await;

        self.broadcast.send_single_frame_to_client(&request.sender, &id, 0);
        if let Some(n) = request.frame_number {
            self.broadcast.send_single_frame_to_client(&request.sender, &id, n);
        }

        if let Some(props) = self.simulation.cache().properties(&id) {
            self.connections.send_json(
                &request.sender,
                &serde_json::json!({
                    "msgType": MsgType::TrajectoryFileInfo.as_u8(),
                    "version": 3,
                    "totalSteps": props.number_of_frames,
                    "timeStepSize": props.time_step_size,
                }),
            );
        }
    }

    /// `DownloadRuntimeCache` -> `FindSimulariumFile` -> SimPkg rebuild,
    /// uploading on the first successful non-download step.
    async fn prepare_trajectory(&self, id: &TrajId, name: &str) -> bool {
        let cache = self.simulation.cache();

        if !self.config.force_init {
            match cache.download_runtime_cache(id).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => tracing::warn!(id = %id, error = %e, "runtime cache download failed"),
            }
        }

        match cache.find_simularium_file(id, name).await {
            Ok(true) => {
                if !self.config.no_upload {
                    let _ = cache.upload_runtime_cache(id).await;
                }
                return true;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(id = %id, error = %e, "simularium ingest failed"),
        }

        if let Err(e) = self.simulation.load_trajectory_file(id, name).await {
            tracing::warn!(id = %id, error = %e, "SimPkg failed to build cache");
            cache.mark_broken(id);
            return false;
        }

        loop {
            match self.simulation.load_next_frame(id).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "frame build failed");
                    cache.mark_broken(id);
                    return false;
                }
            }
        }

        if !self.config.no_upload {
            let _ = cache.upload_runtime_cache(id).await;
        }
        true
    }
}

fn parse_f64_field(value: &serde_json::Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}
