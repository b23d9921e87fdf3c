//! Trajectory data model, on-disk binary cache, and cache registry.

pub mod binary_file;
pub mod cache;
pub mod frame;
pub mod properties;

pub use binary_file::{BinaryFileError, BinaryTrajectoryFile, BroadcastChunk};
pub use cache::{CacheError, TrajectoryCache};
pub use frame::{AgentData, TrajectoryFrame};
pub use properties::{BoxSize, CameraDefault, InfoVersion, TrajectoryFileProperties};

use serde::{Deserialize, Serialize};

/// Opaque trajectory identifier; doubles as a cache-file stem and, for
/// file-backed streams, an object-store key. `"live"` and `"prerun"` are
/// reserved values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrajId(pub String);

pub const LIVE: &str = "live";
pub const PRERUN: &str = "prerun";

impl TrajId {
    pub fn live() -> Self {
        Self(LIVE.to_string())
    }

    pub fn prerun() -> Self {
        Self(PRERUN.to_string())
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn is_live(&self) -> bool {
        self.0 == LIVE
    }

    pub fn is_prerun(&self) -> bool {
        self.0 == PRERUN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrajId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrajId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TrajId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
