//! Trajectory frame and agent record types.
//!
//! A frame chunk is a homogeneous buffer of little-endian `f32`s: the
//! frame header triplet, then each agent's record back to back. Every
//! integer-valued field (`id`, `type_id`, `subpoint_count`) is carried as
//! a float to keep the buffer a single contiguous float sequence — this
//! is a wire/disk format decision inherited from the original agent
//! simulation engine, not a Rust idiom, and it must be preserved exactly
//! since browser clients decode the same layout.

use serde::{Deserialize, Serialize};

/// One agent's state within a frame. Field order is part of the wire
/// format and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentData {
    pub vis_type: f32,
    pub id: f32,
    pub type_id: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub xrot: f32,
    pub yrot: f32,
    pub zrot: f32,
    pub collision_radius: f32,
    pub subpoints: Vec<f32>,
}

impl AgentData {
    /// Number of f32 words this agent occupies, including its own
    /// subpoint-count field.
    pub fn encoded_len(&self) -> usize {
        10 + self.subpoints.len()
    }

    pub fn encode_into(&self, out: &mut Vec<f32>) {
        out.push(self.vis_type);
        out.push(self.id);
        out.push(self.type_id);
        out.push(self.x);
        out.push(self.y);
        out.push(self.z);
        out.push(self.xrot);
        out.push(self.yrot);
        out.push(self.zrot);
        out.push(self.collision_radius);
        out.push(self.subpoints.len() as f32);
        out.extend_from_slice(&self.subpoints);
    }

    /// Decode one agent record starting at `words[0]`. Returns the agent
    /// and the number of words consumed.
    pub fn decode(words: &[f32]) -> Option<(Self, usize)> {
        if words.len() < 11 {
            return None;
        }
        let subpoint_count = words[10].round() as usize;
        if words.len() < 11 + subpoint_count {
            return None;
        }
        let agent = AgentData {
            vis_type: words[0],
            id: words[1],
            type_id: words[2],
            x: words[3],
            y: words[4],
            z: words[5],
            xrot: words[6],
            yrot: words[7],
            zrot: words[8],
            collision_radius: words[9],
            subpoints: words[11..11 + subpoint_count].to_vec(),
        };
        Some((agent, 11 + subpoint_count))
    }
}

/// One time-step's payload: an ordered, semantically-unordered list of
/// agents plus a frame number and simulation time.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryFrame {
    pub frame_number: u32,
    pub time_ns: f32,
    pub agents: Vec<AgentData>,
}

/// 20-byte trailer appended after every frame chunk. Written for forward
/// compatibility with older readers; current readers use the TOC to find
/// chunk boundaries and never parse this.
pub const EOF_SENTINEL: [u8; 20] = *b"\\eof\\eof\\eof\\eof\\eof";

impl TrajectoryFrame {
    pub fn new(frame_number: u32, time_ns: f32, agents: Vec<AgentData>) -> Self {
        Self {
            frame_number,
            time_ns,
            agents,
        }
    }

    /// Encode the frame chunk body: `[frameNumber][timeNs][agentCount]`
    /// followed by every agent record, as little-endian f32 words.
    pub fn encode(&self) -> Vec<f32> {
        let mut words = Vec::with_capacity(3 + self.agents.iter().map(AgentData::encoded_len).sum::<usize>());
        words.push(self.frame_number as f32);
        words.push(self.time_ns);
        words.push(self.agents.len() as f32);
        for agent in &self.agents {
            agent.encode_into(&mut words);
        }
        words
    }

    /// Decode a frame chunk body from its f32 words (sentinel excluded).
    pub fn decode(words: &[f32]) -> Option<Self> {
        if words.len() < 3 {
            return None;
        }
        let frame_number = words[0].round() as u32;
        let time_ns = words[1];
        let agent_count = words[2].round() as usize;

        let mut agents = Vec::with_capacity(agent_count);
        let mut cursor = 3usize;
        for _ in 0..agent_count {
            let (agent, consumed) = AgentData::decode(&words[cursor..])?;
            agents.push(agent);
            cursor += consumed;
        }
        Some(Self {
            frame_number,
            time_ns,
            agents,
        })
    }

    /// Serialize to the little-endian byte buffer stored on disk / sent
    /// over the wire, including the trailing EOF sentinel.
    pub fn to_bytes(&self) -> Vec<u8> {
        let words = self.encode();
        let mut bytes = Vec::with_capacity(words.len() * 4 + EOF_SENTINEL.len());
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes.extend_from_slice(&EOF_SENTINEL);
        bytes
    }

    /// Parse a frame chunk's bytes (sentinel tolerated but not required).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let word_count = bytes.len() / 4;
        let mut words = Vec::with_capacity(word_count);
        for chunk in bytes.chunks_exact(4).take(word_count) {
            words.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Self::decode(&words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(id: f32) -> AgentData {
        AgentData {
            vis_type: 1000.0,
            id,
            type_id: 0.0,
            x: 1.0,
            y: 2.0,
            z: 3.0,
            xrot: 0.0,
            yrot: 0.0,
            zrot: 0.0,
            collision_radius: 1.5,
            subpoints: vec![0.1, 0.2, 0.3],
        }
    }

    #[test]
    fn agent_round_trips_through_words() {
        let agent = sample_agent(7.0);
        let mut words = Vec::new();
        agent.encode_into(&mut words);
        let (decoded, consumed) = AgentData::decode(&words).unwrap();
        assert_eq!(consumed, words.len());
        assert_eq!(decoded, agent);
    }

    #[test]
    fn frame_round_trips_through_bytes() {
        let frame = TrajectoryFrame::new(5, 5.0, vec![sample_agent(1.0), sample_agent(2.0)]);
        let bytes = frame.to_bytes();
        let decoded = TrajectoryFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_frame_round_trips() {
        let frame = TrajectoryFrame::new(0, 0.0, vec![]);
        let bytes = frame.to_bytes();
        let decoded = TrajectoryFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn agent_order_is_preserved() {
        let frame = TrajectoryFrame::new(0, 0.0, vec![sample_agent(3.0), sample_agent(1.0), sample_agent(9.0)]);
        let decoded = TrajectoryFrame::from_bytes(&frame.to_bytes()).unwrap();
        let ids: Vec<f32> = decoded.agents.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![3.0, 1.0, 9.0]);
    }
}
