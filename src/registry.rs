//! Per-connection state: UID, playback state machine, playback cursor,
//! selected trajectory, and heartbeat bookkeeping.
//!
//! Backed by a `dashmap::DashMap` rather than a single mutex-guarded
//! `HashMap` so the four workers can read/mutate distinct clients'
//! entries without contending on a single lock.

use dashmap::DashMap;

use crate::client_id::ClientId;
use crate::trajectory::TrajId;

pub const MAX_MISSED_HEARTBEATS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Paused,
    Waiting,
    Playing,
    Finished,
}

#[derive(Debug, Clone)]
pub struct ClientState {
    pub uid: ClientId,
    pub play_state: PlayState,
    pub playback_pos: u64,
    pub sim_id: TrajId,
    pub missed_heartbeats: u8,
}

impl ClientState {
    fn new(uid: ClientId) -> Self {
        Self {
            uid,
            play_state: PlayState::Stopped,
            playback_pos: 0,
            sim_id: TrajId::live(),
            missed_heartbeats: 0,
        }
    }
}

pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn add(&self) -> ClientId {
        let uid = ClientId::new();
        self.clients.insert(uid, ClientState::new(uid));
        uid
    }

    pub fn remove(&self, uid: &ClientId) {
        self.clients.remove(uid);
    }

    /// Forced close: same effect as `remove`, but named separately so
    /// call sites document which worker decided to evict the client.
    pub fn close(&self, uid: &ClientId) {
        self.clients.remove(uid);
    }

    pub fn get(&self, uid: &ClientId) -> Option<ClientState> {
        self.clients.get(uid).map(|e| e.clone())
    }

    pub fn contains(&self, uid: &ClientId) -> bool {
        self.clients.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn all_uids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    pub fn set_play_state(&self, uid: &ClientId, state: PlayState) {
        if let Some(mut entry) = self.clients.get_mut(uid) {
            entry.play_state = state;
        }
    }

    pub fn set_pos(&self, uid: &ClientId, pos: u64) {
        if let Some(mut entry) = self.clients.get_mut(uid) {
            entry.playback_pos = pos;
        }
    }

    pub fn set_sim_id(&self, uid: &ClientId, sim_id: TrajId) {
        if let Some(mut entry) = self.clients.get_mut(uid) {
            entry.sim_id = sim_id;
        }
    }

    pub fn register_heartbeat(&self, uid: &ClientId) {
        if let Some(mut entry) = self.clients.get_mut(uid) {
            entry.missed_heartbeats = 0;
        }
    }

    /// Returns the post-increment count so callers can decide whether to
    /// force-close without a second lookup.
    pub fn increment_missed_heartbeats(&self, uid: &ClientId) -> Option<u8> {
        self.clients.get_mut(uid).map(|mut entry| {
            entry.missed_heartbeats = entry.missed_heartbeats.saturating_add(1);
            entry.missed_heartbeats
        })
    }

    /// Any client whose connection exceeds `MAX_MISSED_HEARTBEATS` on
    /// this sweep is marked expired and returned for the caller to
    /// close.
    pub fn sweep_expired(&self) -> Vec<ClientId> {
        let mut expired = Vec::new();
        for uid in self.all_uids() {
            if let Some(count) = self.increment_missed_heartbeats(&uid) {
                if count > MAX_MISSED_HEARTBEATS {
                    expired.push(uid);
                }
            }
        }
        for uid in &expired {
            self.close(uid);
        }
        expired
    }

}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_creates_stopped_client_at_pos_zero() {
        let reg = ClientRegistry::new();
        let uid = reg.add();
        let state = reg.get(&uid).unwrap();
        assert_eq!(state.play_state, PlayState::Stopped);
        assert_eq!(state.playback_pos, 0);
    }

    #[test]
    fn heartbeat_pong_resets_missed_count() {
        let reg = ClientRegistry::new();
        let uid = reg.add();
        reg.increment_missed_heartbeats(&uid);
        reg.increment_missed_heartbeats(&uid);
        reg.register_heartbeat(&uid);
        assert_eq!(reg.get(&uid).unwrap().missed_heartbeats, 0);
    }

    #[test]
    fn sweep_closes_clients_past_the_missed_heartbeat_limit() {
        let reg = ClientRegistry::new();
        let uid = reg.add();
        for _ in 0..MAX_MISSED_HEARTBEATS {
            let expired = reg.sweep_expired();
            assert!(expired.is_empty());
        }
        let expired = reg.sweep_expired();
        assert_eq!(expired, vec![uid]);
        assert!(!reg.contains(&uid));
    }

    #[test]
    fn remove_drops_the_client() {
        let reg = ClientRegistry::new();
        let uid = reg.add();
        reg.remove(&uid);
        assert!(reg.get(&uid).is_none());
    }
}
