//! Executed inside SimTick once per tick: advances each Playing client's
//! end-of-stream state, then streams one bounded slice to it.

use std::sync::Arc;

use crate::registry::{ClientRegistry, PlayState};
use crate::simulation::Simulation;
use crate::trajectory::TrajId;
use crate::wire::ConnectionTable;

/// ~25 KiB of f32 words per slice send.
pub const SLICE_BYTES: u64 = 100_000;

pub struct BroadcastEngine {
    registry: Arc<ClientRegistry>,
    simulation: Arc<Simulation>,
    connections: ConnectionTable,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<ClientRegistry>, simulation: Arc<Simulation>, connections: ConnectionTable) -> Self {
        Self {
            registry,
            simulation,
            connections,
        }
    }

    /// One SimTick iteration's worth of broadcast work: refresh every
    /// client's end-of-stream state, then send a slice to everyone left
    /// in `Playing`.
    pub fn tick(&self) {
        for uid in self.registry.all_uids() {
            let Some(state) = self.registry.get(&uid) else { continue };
            if !self.simulation.cache().contains(&state.sim_id) {
                continue;
            }

            self.update_end_of_stream_state(&uid, &state.sim_id, state.play_state, state.playback_pos);

            let Some(refreshed) = self.registry.get(&uid) else { continue };
            if refreshed.play_state == PlayState::Playing {
                self.send_slice(&uid, &refreshed.sim_id, refreshed.playback_pos);
            }
        }
    }

    fn update_end_of_stream_state(&self, uid: &crate::client_id::ClientId, id: &TrajId, state: PlayState, pos: u64) {
        let cache = self.simulation.cache();
        let Ok(end_pos) = cache.end_of_stream_pos(id) else { return };
        let Ok(loaded_frames) = cache.num_frames(id) else { return };
        let total_frames = cache.properties(id).map(|p| p.number_of_frames).unwrap_or(loaded_frames);

        if loaded_frames == 0 {
            self.registry.set_play_state(uid, PlayState::Waiting);
            return;
        }

        let fully_processed = total_frames == loaded_frames;

        if pos >= end_pos && fully_processed {
            if id.is_live() {
                self.registry.set_play_state(uid, PlayState::Waiting);
            } else {
                self.registry.set_play_state(uid, PlayState::Finished);
                self.registry.set_pos(uid, end_pos);
            }
            return;
        }

        if state == PlayState::Playing && pos >= end_pos && !fully_processed {
            self.registry.set_play_state(uid, PlayState::Waiting);
            return;
        }

        if state == PlayState::Waiting && pos < end_pos {
            self.registry.set_play_state(uid, PlayState::Playing);
        }
    }

    fn send_slice(&self, uid: &crate::client_id::ClientId, id: &TrajId, pos: u64) {
        match self.simulation.get_broadcast_update(id, pos, SLICE_BYTES) {
            Ok(chunk) => {
                self.registry.set_pos(uid, chunk.new_pos);
                self.connections.send_binary(uid, chunk.bytes);
            }
            Err(e) => {
                tracing::warn!(client = %uid.short(), id = %id, error = %e, "slice read failed");
            }
        }
    }

    /// Single-frame send path for `goto-simulation-time` and the FileIO
    /// worker's initial-frame replies: advances the cursor to the start
    /// of the frame after `n`.
    pub fn send_single_frame_to_client(&self, uid: &crate::client_id::ClientId, id: &TrajId, n: u32) {
        match self.simulation.get_broadcast_frame(id, n) {
            Ok(chunk) => {
                self.registry.set_pos(uid, chunk.new_pos);
                self.connections.send_binary(uid, chunk.bytes);
            }
            Err(e) => {
                tracing::warn!(client = %uid.short(), id = %id, frame = n, error = %e, "single-frame send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::NullObjectStore;
    use crate::simulation::{SimMode, SimPkg, SyntheticSimPkg};
    use crate::trajectory::{TrajectoryCache, TrajectoryFrame};

    fn engine() -> (tempfile::TempDir, Arc<ClientRegistry>, Arc<Simulation>, BroadcastEngine) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TrajectoryCache::new(dir.path(), Arc::new(NullObjectStore)));
        let pkg: Arc<dyn SimPkg> = Arc::new(SyntheticSimPkg::new(1.0));
        let simulation = Arc::new(Simulation::new(cache, vec![pkg]));
        let registry = Arc::new(ClientRegistry::new());
        let connections = ConnectionTable::new();
        let engine = BroadcastEngine::new(registry.clone(), simulation.clone(), connections);
        (dir, registry, simulation, engine)
    }

    #[tokio::test]
    async fn empty_cache_keeps_client_waiting() {
        let (_dir, registry, simulation, engine) = engine();
        let uid = registry.add();
        simulation.cache().create(&TrajId::live(), 10).unwrap();
        registry.set_sim_id(&uid, TrajId::live());
        registry.set_play_state(&uid, PlayState::Playing);

        engine.tick();

        assert_eq!(registry.get(&uid).unwrap().play_state, PlayState::Waiting);
    }

    #[tokio::test]
    async fn playing_client_advances_and_then_waits_for_more_live_data() {
        let (_dir, registry, simulation, engine) = engine();
        let uid = registry.add();
        registry.set_sim_id(&uid, TrajId::live());
        simulation.set_mode(SimMode::Live);
        simulation.set_sim_id(TrajId::live());
        simulation.run_time_step(1.0).await.unwrap();
        registry.set_play_state(&uid, PlayState::Playing);

        engine.tick();
        let after_first = registry.get(&uid).unwrap();
        assert!(after_first.playback_pos > 0);
        assert_eq!(after_first.play_state, PlayState::Waiting);
    }

    #[tokio::test]
    async fn file_backed_trajectory_reaches_finished_at_end_of_stream() {
        let (_dir, registry, simulation, engine) = engine();
        let uid = registry.add();
        let id = TrajId::from("demo");
        simulation.cache().create(&id, 10).unwrap();
        for i in 0..3u32 {
            simulation
                .cache()
                .write_frame(&id, &TrajectoryFrame::new(i, i as f32, vec![]))
                .unwrap();
        }
        let mut props = crate::trajectory::TrajectoryFileProperties::default();
        props.number_of_frames = 3;
        simulation.cache().set_properties(&id, props);

        registry.set_sim_id(&uid, id.clone());
        registry.set_play_state(&uid, PlayState::Playing);

        for _ in 0..10 {
            engine.tick();
            if registry.get(&uid).unwrap().play_state == PlayState::Finished {
                break;
            }
        }

        assert_eq!(registry.get(&uid).unwrap().play_state, PlayState::Finished);
    }
}
