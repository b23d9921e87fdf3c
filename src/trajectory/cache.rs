//! Keyed registry of `BinaryTrajectoryFile` + metadata, and the
//! input-acquisition pipeline that populates it from local disk, the
//! object store, or a `.simularium` JSON source.
//!
//! File-prep mutation (download, build, upload) happens only on the
//! FileIO worker; reads are concurrent with those writes and rely on
//! `BinaryTrajectoryFile`'s commit-at-count-update invariant.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::trajectory::binary_file::{BinaryFileError, BinaryTrajectoryFile, BroadcastChunk};
use crate::trajectory::frame::{AgentData, TrajectoryFrame};
use crate::trajectory::properties::TrajectoryFileProperties;
use crate::trajectory::TrajId;

/// Default TOC capacity for a freshly created cache file. Live and
/// prerun trajectories grow without a known final frame count up front,
/// so this is generous headroom rather than an exact fit; file-backed
/// caches downloaded whole use the sidecar's `totalSteps` instead.
pub const DEFAULT_TOC_CAPACITY: u32 = 200_000;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache entry for trajectory {0}")]
    NotFound(String),
    #[error("trajectory {0} is marked broken")]
    Broken(String),
    #[error("info sidecar for {0} is missing required keys")]
    IncompleteSidecar(String),
    #[error(transparent)]
    BinaryFile(#[from] BinaryFileError),
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct CacheEntry {
    file: Arc<BinaryTrajectoryFile>,
    properties: TrajectoryFileProperties,
    broken: AtomicBool,
}

pub struct TrajectoryCache {
    local_dir: PathBuf,
    object_store: Arc<dyn ObjectStore>,
    entries: DashMap<String, CacheEntry>,
    tmp_files: DashMap<String, Vec<PathBuf>>,
}

fn raw_key(id: &str) -> String {
    format!("trajectory/{id}")
}
fn cache_key(id: &str) -> String {
    format!("trajectory/{id}_cache")
}
fn info_key(id: &str) -> String {
    format!("trajectory/{id}_info")
}
fn simularium_key(stem: &str) -> String {
    format!("trajectory/{stem}.simularium")
}

impl TrajectoryCache {
    pub fn new(local_dir: impl Into<PathBuf>, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            local_dir: local_dir.into(),
            object_store,
            entries: DashMap::new(),
            tmp_files: DashMap::new(),
        }
    }

    fn local_path(&self, suffix: &str) -> PathBuf {
        self.local_dir.join(suffix)
    }

    /// Register a newly created binary file as the entry for `id`,
    /// replacing any prior entry (used on mode reset).
    pub fn create(&self, id: &TrajId, toc_capacity: u32) -> Result<(), CacheError> {
        let path = self.local_path(&format!("{}.bin", id.as_str()));
        let file = BinaryTrajectoryFile::create(&path, toc_capacity)?;
        self.entries.insert(
            id.as_str().to_string(),
            CacheEntry {
                file: Arc::new(file),
                properties: TrajectoryFileProperties::default(),
                broken: AtomicBool::new(false),
            },
        );
        Ok(())
    }

    pub fn contains(&self, id: &TrajId) -> bool {
        self.entries.contains_key(id.as_str())
    }

    pub fn is_broken(&self, id: &TrajId) -> bool {
        self.entries
            .get(id.as_str())
            .map(|e| e.broken.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn mark_broken(&self, id: &TrajId) {
        if let Some(entry) = self.entries.get(id.as_str()) {
            entry.broken.store(true, Ordering::Release);
            tracing::warn!(id = %id, "trajectory marked broken");
        }
    }

    pub fn file(&self, id: &TrajId) -> Option<Arc<BinaryTrajectoryFile>> {
        self.entries.get(id.as_str()).map(|e| e.file.clone())
    }

    pub fn properties(&self, id: &TrajId) -> Option<TrajectoryFileProperties> {
        self.entries.get(id.as_str()).map(|e| e.properties.clone())
    }

    pub fn set_properties(&self, id: &TrajId, properties: TrajectoryFileProperties) {
        if let Some(mut entry) = self.entries.get_mut(id.as_str()) {
            entry.properties = properties;
        }
    }

    pub fn num_frames(&self, id: &TrajId) -> Result<u32, CacheError> {
        let entry = self
            .entries
            .get(id.as_str())
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        Ok(entry.file.num_saved_frames()?)
    }

    pub fn write_frame(&self, id: &TrajId, frame: &TrajectoryFrame) -> Result<(), CacheError> {
        let entry = self
            .entries
            .get(id.as_str())
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        entry.file.write_frame(frame)?;
        Ok(())
    }

    pub fn get_broadcast_frame(&self, id: &TrajId, index: u32) -> Result<BroadcastChunk, CacheError> {
        let file = self.file(id).ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        Ok(file.get_broadcast_frame(index)?)
    }

    pub fn get_broadcast_update(
        &self,
        id: &TrajId,
        pos: u64,
        slice_bytes: u64,
    ) -> Result<BroadcastChunk, CacheError> {
        let file = self.file(id).ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        Ok(file.get_broadcast_update(pos, slice_bytes)?)
    }

    pub fn end_of_stream_pos(&self, id: &TrajId) -> Result<u64, CacheError> {
        let file = self.file(id).ok_or_else(|| CacheError::NotFound(id.to_string()))?;
        Ok(file.end_of_stream_pos()?)
    }

    /// True if a raw trajectory input for `name` is present locally,
    /// downloading it from the object store first if not.
    pub async fn find_file(&self, name: &str) -> bool {
        let path = self.local_path(name);
        if path.exists() {
            return true;
        }
        self.object_store.download(&raw_key(name), &path).await.is_ok()
    }

    /// Try `<stem>.simularium` and `<name>.simularium`; on success parse
    /// and write the contained frames into a fresh cache entry for `id`.
    pub async fn find_simularium_file(&self, id: &TrajId, name: &str) -> Result<bool, CacheError> {
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);

        for key in [simularium_key(stem), simularium_key(name)] {
            let dest = self.local_path(&format!("{stem}.simularium"));
            if self.object_store.download(&key, &dest).await.is_ok() {
                self.mark_tmp_file(id, dest.clone());
                self.ingest_simularium_json(id, &dest).await?;
                self.delete_tmp_files(id).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn ingest_simularium_json(&self, id: &TrajId, path: &Path) -> Result<(), CacheError> {
        let text = tokio::fs::read_to_string(path).await?;
        let value: serde_json::Value = serde_json::from_str(&text)?;

        let properties = parse_trajectory_info(&value)?;
        let num_frames = properties.number_of_frames.max(1);
        self.create(id, num_frames)?;
        self.set_properties(id, properties);

        if let Some(bundles) = value.get("spatialData").and_then(|s| s.get("bundleData")).and_then(|b| b.as_array()) {
            for bundle in bundles {
                let frame_number = bundle.get("frameNumber").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let time_ns = bundle.get("time").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
                let words: Vec<f32> = bundle
                    .get("data")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|n| n.as_f64()).map(|n| n as f32).collect())
                    .unwrap_or_default();

                let mut agents = Vec::new();
                let mut cursor = 0usize;
                while cursor < words.len() {
                    match AgentData::decode(&words[cursor..]) {
                        Some((agent, consumed)) => {
                            agents.push(agent);
                            cursor += consumed;
                        }
                        None => break,
                    }
                }

                self.write_frame(id, &TrajectoryFrame::new(frame_number, time_ns, agents))?;
            }
        }

        Ok(())
    }

    /// Fetch a pre-built `<id>_cache` binary and `<id>_info` sidecar.
    /// Returns `Ok(true)` and registers the entry on success; `Ok(false)`
    /// if either asset is unavailable or the sidecar is incomplete.
    pub async fn download_runtime_cache(&self, id: &TrajId) -> Result<bool, CacheError> {
        let cache_path = self.local_path(&format!("{}.bin", id.as_str()));
        let info_path = self.local_path(&format!("{}_info.json", id.as_str()));

        if self.object_store.download(&cache_key(id.as_str()), &cache_path).await.is_err() {
            return Ok(false);
        }
        if self.object_store.download(&info_key(id.as_str()), &info_path).await.is_err() {
            return Ok(false);
        }

        let text = tokio::fs::read_to_string(&info_path).await?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if !sidecar_has_required_keys(&value) {
            return Err(CacheError::IncompleteSidecar(id.to_string()));
        }

        let properties = parse_trajectory_info(&value)?;
        let toc_capacity = properties.number_of_frames.max(1);
        let file = BinaryTrajectoryFile::open_existing(&cache_path, toc_capacity)?;

        self.entries.insert(
            id.as_str().to_string(),
            CacheEntry {
                file: Arc::new(file),
                properties,
                broken: AtomicBool::new(false),
            },
        );
        Ok(true)
    }

    /// Publish the built cache and its info sidecar. Idempotent:
    /// re-upload overwrites the prior object.
    pub async fn upload_runtime_cache(&self, id: &TrajId) -> Result<(), CacheError> {
        let entry = self
            .entries
            .get(id.as_str())
            .ok_or_else(|| CacheError::NotFound(id.to_string()))?;

        let info_path = self.local_path(&format!("{}_info.json", id.as_str()));
        let json = serde_json::to_string(&entry.properties)?;
        tokio::fs::write(&info_path, json).await?;

        let cache_path = entry.file.path().to_path_buf();
        drop(entry);

        if let Err(e) = self.object_store.upload(&cache_path, &cache_key(id.as_str())).await {
            tracing::warn!(id = %id, error = %e, "cache upload failed");
        }
        if let Err(e) = self.object_store.upload(&info_path, &info_key(id.as_str())).await {
            tracing::warn!(id = %id, error = %e, "info sidecar upload failed");
        }
        Ok(())
    }

    pub fn mark_tmp_file(&self, id: &TrajId, path: PathBuf) {
        self.tmp_files.entry(id.as_str().to_string()).or_default().push(path);
    }

    pub async fn delete_tmp_files(&self, id: &TrajId) {
        if let Some((_, paths)) = self.tmp_files.remove(id.as_str()) {
            for path in paths {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete tmp file");
                }
            }
        }
    }
}

fn sidecar_has_required_keys(value: &serde_json::Value) -> bool {
    TrajectoryFileProperties::REQUIRED_KEYS
        .iter()
        .all(|key| value.get(key).is_some())
}

fn parse_trajectory_info(value: &serde_json::Value) -> Result<TrajectoryFileProperties, CacheError> {
    if !sidecar_has_required_keys(value) {
        return Ok(TrajectoryFileProperties::default());
    }
    Ok(serde_json::from_value(value.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::NullObjectStore;

    fn cache() -> (tempfile::TempDir, TrajectoryCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = TrajectoryCache::new(dir.path(), Arc::new(NullObjectStore));
        (dir, cache)
    }

    #[test]
    fn create_then_write_then_read_round_trips() {
        let (_dir, cache) = cache();
        let id = TrajId::from("live");
        cache.create(&id, 10).unwrap();

        let frame = TrajectoryFrame::new(0, 0.0, vec![]);
        cache.write_frame(&id, &frame).unwrap();

        assert_eq!(cache.num_frames(&id).unwrap(), 1);
        let chunk = cache.get_broadcast_frame(&id, 0).unwrap();
        assert_eq!(TrajectoryFrame::from_bytes(&chunk.bytes).unwrap(), frame);
    }

    #[test]
    fn missing_entry_is_not_found() {
        let (_dir, cache) = cache();
        let id = TrajId::from("nope");
        assert!(matches!(cache.num_frames(&id), Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn download_runtime_cache_misses_without_remote_assets() {
        let (_dir, cache) = cache();
        let id = TrajId::from("some-file");
        assert!(!cache.download_runtime_cache(&id).await.unwrap());
    }

    #[test]
    fn mark_broken_is_observable() {
        let (_dir, cache) = cache();
        let id = TrajId::from("live");
        cache.create(&id, 10).unwrap();
        assert!(!cache.is_broken(&id));
        cache.mark_broken(&id);
        assert!(cache.is_broken(&id));
    }
}
