//! Static metadata associated with a trajectory ID.
//!
//! Populated from a `.simularium` JSON source, a remote `*_info` sidecar,
//! or SimPkg metadata after raw-file ingestion. `numberOfFrames` is
//! authoritative for `"prerun"` and file-backed IDs once set; for
//! `"live"` it tracks the current count.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxSize {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraDefault {
    pub position: [f32; 3],
    pub look_at_point: [f32; 3],
    pub up_vector: [f32; 3],
    pub fov_degrees: f32,
}

impl Default for CameraDefault {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 120.0],
            look_at_point: [0.0, 0.0, 0.0],
            up_vector: [0.0, 1.0, 0.0],
            fov_degrees: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub display_type: String,
    pub url: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMappingEntry {
    pub name: String,
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub magnitude: f32,
    pub name: String,
}

impl UnitInfo {
    #[allow(dead_code)]
    fn default_spatial() -> Self {
        Self {
            magnitude: 1.0,
            name: "m".to_string(),
        }
    }

    #[allow(dead_code)]
    fn default_time() -> Self {
        Self {
            magnitude: 1.0,
            name: "ns".to_string(),
        }
    }
}

/// Sidecar schema version. v1/v2/v3 differ only in which optional blocks
/// are present; readers are forward-compatible within the v3 superset.
///
/// The wire/sidecar `version` field is a plain JSON integer, not a
/// string, so this carries a custom `u8` representation instead of the
/// derived enum-name encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum InfoVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

impl TryFrom<u8> for InfoVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(format!("unknown info version {other}")),
        }
    }
}

impl From<InfoVersion> for u8 {
    fn from(value: InfoVersion) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryFileProperties {
    pub version: InfoVersion,
    pub file_name: String,
    #[serde(rename = "totalSteps")]
    pub number_of_frames: u32,
    pub time_step_size: f64,
    pub spatial_unit_factor_meters: f64,
    pub type_mapping: HashMap<u32, TypeMappingEntry>,
    pub size: BoxSize,
    pub camera_default: Option<CameraDefault>,
    pub time_units: Option<UnitInfo>,
    pub spatial_units: Option<UnitInfo>,
}

impl Default for TrajectoryFileProperties {
    fn default() -> Self {
        Self {
            version: InfoVersion::V3,
            file_name: String::new(),
            number_of_frames: 0,
            time_step_size: 100.0,
            spatial_unit_factor_meters: 1e-9,
            type_mapping: HashMap::new(),
            size: BoxSize { x: 0.0, y: 0.0, z: 0.0 },
            camera_default: None,
            time_units: None,
            spatial_units: None,
        }
    }
}

impl TrajectoryFileProperties {
    /// §8 invariant 5/6: map a simulation time to the closest frame
    /// number, clamping to the valid range.
    pub fn closest_frame_for_time(&self, time_ns: f64) -> u32 {
        if self.number_of_frames == 0 {
            return 0;
        }
        if time_ns < 0.0 {
            return 0;
        }
        let frame = (time_ns / self.time_step_size).floor();
        let max_frame = (self.number_of_frames - 1) as f64;
        frame.clamp(0.0, max_frame) as u32
    }

    /// Symmetric to `closest_frame_for_time`.
    pub fn time_at_frame(&self, frame_number: u32) -> f64 {
        frame_number as f64 * self.time_step_size
    }

    /// Required sidecar keys per the wire contract; missing any
    /// invalidates a downloaded cache.
    pub const REQUIRED_KEYS: &'static [&'static str] = &[
        "version",
        "fileName",
        "totalSteps",
        "timeStepSize",
        "spatialUnitFactorMeters",
        "size",
        "typeMapping",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(n_frames: u32, step: f64) -> TrajectoryFileProperties {
        TrajectoryFileProperties {
            number_of_frames: n_frames,
            time_step_size: step,
            ..Default::default()
        }
    }

    #[test]
    fn negative_time_clamps_to_zero() {
        let p = props(100, 1.0);
        assert_eq!(p.closest_frame_for_time(-1.0), 0);
    }

    #[test]
    fn time_past_end_clamps_to_last_frame() {
        let p = props(100, 1.0);
        assert_eq!(p.closest_frame_for_time(5000.0), 99);
    }

    #[test]
    fn frame_time_round_trip_is_idempotent() {
        let p = props(100, 1.0);
        for t in [0.0, 12.0, 49.5, 99.9] {
            let frame = p.closest_frame_for_time(t);
            let resolved_time = p.time_at_frame(frame);
            let refound = p.closest_frame_for_time(resolved_time);
            assert_eq!(frame, refound);
        }
    }

    #[test]
    fn empty_trajectory_always_resolves_to_zero() {
        let p = props(0, 1.0);
        assert_eq!(p.closest_frame_for_time(42.0), 0);
    }
}
