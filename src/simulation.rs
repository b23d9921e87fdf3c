//! Simulation: owns the trajectory cache and the set of pluggable
//! simulation backends (`SimPkg`), and is the only component that
//! mutates a trajectory's frame data.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::trajectory::{TrajId, TrajectoryCache, TrajectoryFileProperties, TrajectoryFrame};

#[derive(Debug, Error)]
pub enum SimPkgError {
    #[error("simulation package error: {0}")]
    Failed(String),
}

/// Pluggable simulation backend. The core only ever talks to this
/// interface — no physics/chemistry engine lives in this crate.
#[async_trait]
pub trait SimPkg: Send + Sync {
    async fn setup(&self) -> Result<(), SimPkgError>;
    async fn shutdown(&self) -> Result<(), SimPkgError>;

    async fn init_agents(&self, model: &serde_json::Value) -> Result<(), SimPkgError>;
    async fn init_reactions(&self, model: &serde_json::Value) -> Result<(), SimPkgError>;

    /// Advance by `dt` and produce exactly one frame.
    async fn run_time_step(&self, dt: f64) -> Result<TrajectoryFrame, SimPkgError>;

    async fn update_parameter(&self, name: &str, value: f64) -> Result<(), SimPkgError>;

    /// Drive `n_steps` time steps of size `dt` without yielding
    /// intermediate results (used for prerun mode).
    async fn run(&self, dt: f64, n_steps: u32) -> Result<Vec<TrajectoryFrame>, SimPkgError>;

    /// Produce the next frame for cache-build purposes.
    async fn get_next_frame(&self) -> Result<Option<TrajectoryFrame>, SimPkgError>;

    fn is_finished(&self) -> bool;

    async fn load_trajectory_file(
        &self,
        path: &std::path::Path,
    ) -> Result<TrajectoryFileProperties, SimPkgError>;

    fn get_simulation_time_at_frame(&self, n: u32) -> f64;
    fn get_closest_frame_number_for_time(&self, time_ns: f64) -> u32;

    fn can_load_file(&self, path: &str) -> bool;

    /// Companion files (e.g. topology, parameter sidecars) that must be
    /// present locally before `load_trajectory_file` can run.
    fn get_file_names(&self, path: &str) -> Vec<String>;
}

/// Deterministic generator used by tests and as the default backend:
/// one agent per frame moving along `(t, t, t)`.
pub struct SyntheticSimPkg {
    time_step: f64,
    frame_counter: AtomicU32,
    max_frames: Option<u32>,
}

impl SyntheticSimPkg {
    pub fn new(time_step: f64) -> Self {
        Self {
            time_step,
            frame_counter: AtomicU32::new(0),
            max_frames: None,
        }
    }

    pub fn bounded(time_step: f64, max_frames: u32) -> Self {
        Self {
            time_step,
            frame_counter: AtomicU32::new(0),
            max_frames: Some(max_frames),
        }
    }

    fn make_frame(&self, n: u32) -> TrajectoryFrame {
        let t = n as f32;
        let agent = crate::trajectory::AgentData {
            vis_type: 1000.0,
            id: 0.0,
            type_id: 0.0,
            x: t,
            y: t,
            z: t,
            xrot: 0.0,
            yrot: 0.0,
            zrot: 0.0,
            collision_radius: 1.0,
            subpoints: vec![],
        };
        TrajectoryFrame::new(n, n as f32 * self.time_step as f32, vec![agent])
    }
}

#[async_trait]
impl SimPkg for SyntheticSimPkg {
    async fn setup(&self) -> Result<(), SimPkgError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SimPkgError> {
        Ok(())
    }

    async fn init_agents(&self, _model: &serde_json::Value) -> Result<(), SimPkgError> {
        Ok(())
    }

    async fn init_reactions(&self, _model: &serde_json::Value) -> Result<(), SimPkgError> {
        Ok(())
    }

    async fn run_time_step(&self, _dt: f64) -> Result<TrajectoryFrame, SimPkgError> {
        let n = self.frame_counter.fetch_add(1, Ordering::AcqRel);
        Ok(self.make_frame(n))
    }

    async fn update_parameter(&self, _name: &str, _value: f64) -> Result<(), SimPkgError> {
        Ok(())
    }

    async fn run(&self, _dt: f64, n_steps: u32) -> Result<Vec<TrajectoryFrame>, SimPkgError> {
        let mut frames = Vec::with_capacity(n_steps as usize);
        for _ in 0..n_steps {
            let n = self.frame_counter.fetch_add(1, Ordering::AcqRel);
            frames.push(self.make_frame(n));
        }
        Ok(frames)
    }

    async fn get_next_frame(&self) -> Result<Option<TrajectoryFrame>, SimPkgError> {
        if self.is_finished() {
            return Ok(None);
        }
        let n = self.frame_counter.fetch_add(1, Ordering::AcqRel);
        Ok(Some(self.make_frame(n)))
    }

    fn is_finished(&self) -> bool {
        match self.max_frames {
            Some(max) => self.frame_counter.load(Ordering::Acquire) >= max,
            None => false,
        }
    }

    async fn load_trajectory_file(
        &self,
        path: &std::path::Path,
    ) -> Result<TrajectoryFileProperties, SimPkgError> {
        Err(SimPkgError::Failed(format!(
            "SyntheticSimPkg does not load trajectory files ({})",
            path.display()
        )))
    }

    fn get_simulation_time_at_frame(&self, n: u32) -> f64 {
        n as f64 * self.time_step
    }

    fn get_closest_frame_number_for_time(&self, time_ns: f64) -> u32 {
        if time_ns < 0.0 {
            return 0;
        }
        (time_ns / self.time_step).floor() as u32
    }

    fn can_load_file(&self, _path: &str) -> bool {
        false
    }

    fn get_file_names(&self, _path: &str) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    Live,
    Prerun,
    Playback,
}

pub struct Simulation {
    cache: Arc<TrajectoryCache>,
    pkgs: Vec<Arc<dyn SimPkg>>,
    active_pkg: std::sync::RwLock<usize>,
    mode: std::sync::RwLock<SimMode>,
    sim_id: std::sync::RwLock<TrajId>,
}

impl Simulation {
    pub fn new(cache: Arc<TrajectoryCache>, pkgs: Vec<Arc<dyn SimPkg>>) -> Self {
        Self {
            cache,
            pkgs,
            active_pkg: std::sync::RwLock::new(0),
            mode: std::sync::RwLock::new(SimMode::Live),
            sim_id: std::sync::RwLock::new(TrajId::live()),
        }
    }

    pub fn cache(&self) -> &Arc<TrajectoryCache> {
        &self.cache
    }

    pub fn mode(&self) -> SimMode {
        *self.mode.read().unwrap()
    }

    pub fn set_mode(&self, mode: SimMode) {
        *self.mode.write().unwrap() = mode;
    }

    pub fn sim_id(&self) -> TrajId {
        self.sim_id.read().unwrap().clone()
    }

    pub fn set_sim_id(&self, id: TrajId) {
        *self.sim_id.write().unwrap() = id;
    }

    fn active(&self) -> Option<Arc<dyn SimPkg>> {
        let idx = *self.active_pkg.read().unwrap();
        self.pkgs.get(idx).cloned()
    }

    /// Advance the active SimPkg by `dt` and append the produced frame
    /// under the current sim id. Only meaningful in Live mode.
    pub async fn run_time_step(&self, dt: f64) -> Result<(), SimPkgError> {
        if self.mode() != SimMode::Live {
            return Ok(());
        }
        let Some(pkg) = self.active() else {
            return Ok(());
        };
        let frame = pkg.run_time_step(dt).await?;
        let id = self.sim_id();
        if !self.cache.contains(&id) {
            self.cache
                .create(&id, crate::trajectory::cache::DEFAULT_TOC_CAPACITY)
                .map_err(|e| SimPkgError::Failed(e.to_string()))?;
        }
        self.cache
            .write_frame(&id, &frame)
            .map_err(|e| SimPkgError::Failed(e.to_string()))?;
        Ok(())
    }

    /// Ask the active SimPkg for one more frame and append it. Used
    /// during cache build.
    pub async fn load_next_frame(&self, id: &TrajId) -> Result<bool, SimPkgError> {
        let Some(pkg) = self.active() else {
            return Ok(false);
        };
        match pkg.get_next_frame().await? {
            Some(frame) => {
                self.cache
                    .write_frame(id, &frame)
                    .map_err(|e| SimPkgError::Failed(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Select the first SimPkg that can load `name`, ensure its
    /// companion inputs are present in the cache, hand it the local raw
    /// path, and populate metadata.
    pub async fn load_trajectory_file(&self, id: &TrajId, name: &str) -> Result<(), SimPkgError> {
        let pkg = self
            .pkgs
            .iter()
            .find(|p| p.can_load_file(name))
            .cloned()
            .ok_or_else(|| SimPkgError::Failed(format!("no SimPkg can load {name}")))?;

        for companion in pkg.get_file_names(name) {
            self.cache.find_file(&companion).await;
        }
        self.cache.find_file(name).await;

        let local_path = std::path::Path::new(name);
        let properties = pkg.load_trajectory_file(local_path).await?;
        self.cache.set_properties(id, properties);
        Ok(())
    }

    pub fn get_broadcast_frame(
        &self,
        id: &TrajId,
        n: u32,
    ) -> Result<crate::trajectory::BroadcastChunk, crate::trajectory::CacheError> {
        self.cache.get_broadcast_frame(id, n)
    }

    pub fn get_broadcast_update(
        &self,
        id: &TrajId,
        pos: u64,
        size: u64,
    ) -> Result<crate::trajectory::BroadcastChunk, crate::trajectory::CacheError> {
        self.cache.get_broadcast_update(id, pos, size)
    }

    /// `clamp(floor(tNs/timeStepSize), 0, numberOfFrames-1)`, delegating
    /// to the active SimPkg when metadata hasn't been populated yet.
    pub fn get_closest_frame_number_for_time(&self, id: &TrajId, time_ns: f64) -> u32 {
        match self.cache.properties(id) {
            Some(props) if props.number_of_frames > 0 => props.closest_frame_for_time(time_ns),
            _ => self.active().map(|p| p.get_closest_frame_number_for_time(time_ns)).unwrap_or(0),
        }
    }

    pub fn get_simulation_time_at_frame(&self, id: &TrajId, n: u32) -> f64 {
        match self.cache.properties(id) {
            Some(props) if props.number_of_frames > 0 => props.time_at_frame(n),
            _ => self.active().map(|p| p.get_simulation_time_at_frame(n)).unwrap_or(0.0),
        }
    }

    /// Tear down and re-initialize all SimPkgs. File-backed caches
    /// survive a reset; only Live/Prerun state is cleared.
    pub async fn reset(&self) -> Result<(), SimPkgError> {
        for pkg in &self.pkgs {
            pkg.shutdown().await?;
            pkg.setup().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::NullObjectStore;

    fn sim() -> (tempfile::TempDir, Simulation) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TrajectoryCache::new(dir.path(), Arc::new(NullObjectStore)));
        let pkg: Arc<dyn SimPkg> = Arc::new(SyntheticSimPkg::new(1.0));
        (dir, Simulation::new(cache, vec![pkg]))
    }

    #[tokio::test]
    async fn live_tick_appends_sequential_frames() {
        let (_dir, sim) = sim();
        sim.set_mode(SimMode::Live);
        sim.set_sim_id(TrajId::live());

        for _ in 0..10 {
            sim.run_time_step(1.0).await.unwrap();
        }

        let id = TrajId::live();
        assert_eq!(sim.cache().num_frames(&id).unwrap(), 10);
        for i in 0..10u32 {
            let chunk = sim.get_broadcast_frame(&id, i).unwrap();
            let frame = TrajectoryFrame::from_bytes(&chunk.bytes).unwrap();
            assert_eq!(frame.frame_number, i);
        }
    }

    #[tokio::test]
    async fn prerun_mode_does_not_append() {
        let (_dir, sim) = sim();
        sim.set_mode(SimMode::Prerun);
        sim.set_sim_id(TrajId::live());
        sim.run_time_step(1.0).await.unwrap();
        assert!(!sim.cache().contains(&TrajId::live()));
    }

    #[test]
    fn time_and_frame_mapping_falls_back_to_sim_pkg_without_metadata() {
        let (_dir, sim) = sim();
        let id = TrajId::live();
        assert_eq!(sim.get_closest_frame_number_for_time(&id, -5.0), 0);
        assert_eq!(sim.get_closest_frame_number_for_time(&id, 50.0), 50);
    }
}
