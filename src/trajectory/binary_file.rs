//! On-disk binary cache file (`<id>.bin`): append-only frame storage with
//! a fixed-capacity table of contents for random-access reads.
//!
//! Layout (all integers little-endian):
//! - bytes 0..12: magic `"SIMULARIUMBIN"`
//! - bytes 13..15: version (major, minor, patch)
//! - byte 16 (`HEADER_SIZE`): `populatedCount: u32`
//! - bytes 20..20+4*capacity: `offsets: [u32; capacity]`
//! - thereafter: appended frame chunks
//!
//! The writer is single-owner per process (`Mutex<File>`); reads reopen
//! the path read-only so concurrent readers never contend with the
//! writer's cursor, and the "commit at count update" invariant makes
//! those reads safe without additional locking: a frame is only visible
//! once its TOC entry and the populated count have both been written,
//! and the count is always written last.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::frame::TrajectoryFrame;

pub const MAGIC: &[u8; 13] = b"SIMULARIUMBIN";
pub const VERSION: [u8; 3] = [1, 0, 0];
pub const HEADER_SIZE: u64 = 16;
const TOC_COUNT_OFFSET: u64 = HEADER_SIZE;
const TOC_ENTRIES_OFFSET: u64 = HEADER_SIZE + 4;

#[derive(Debug, Error)]
pub enum BinaryFileError {
    #[error("io error on trajectory file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a simularium binary file (bad magic): {0}")]
    BadMagic(PathBuf),
    #[error("frame {0} requested but only {1} frames are saved")]
    FrameOutOfRange(u32, u32),
}

fn io_err(path: &Path, source: std::io::Error) -> BinaryFileError {
    BinaryFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of a broadcast read: the raw bytes to send and the client's
/// next byte cursor.
pub struct BroadcastChunk {
    pub bytes: Vec<u8>,
    pub new_pos: u64,
}

pub struct BinaryTrajectoryFile {
    path: PathBuf,
    toc_capacity: u32,
    end_of_toc: u64,
    writer: Mutex<File>,
}

impl BinaryTrajectoryFile {
    /// Truncate-create a new file with `toc_capacity` reserved frame
    /// slots.
    pub fn create(path: impl AsRef<Path>, toc_capacity: u32) -> Result<Self, BinaryFileError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION);
        file.write_all(&header).map_err(|e| io_err(&path, e))?;

        let toc_bytes = vec![0u8; 4 + 4 * toc_capacity as usize];
        file.write_all(&toc_bytes).map_err(|e| io_err(&path, e))?;
        file.flush().map_err(|e| io_err(&path, e))?;

        let end_of_toc = TOC_ENTRIES_OFFSET + 4 * toc_capacity as u64;

        Ok(Self {
            path,
            toc_capacity,
            end_of_toc,
            writer: Mutex::new(file),
        })
    }

    /// Reopen a file this process did not create (e.g. one just
    /// downloaded from the object store). `toc_capacity` must match the
    /// capacity the file was created with — it is not itself persisted
    /// in the file, so the caller supplies it from the info sidecar's
    /// `totalSteps` (or a larger headroom value if more frames may still
    /// be appended).
    pub fn open_existing(path: impl AsRef<Path>, toc_capacity: u32) -> Result<Self, BinaryFileError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let mut magic = [0u8; 13];
        file.read_exact(&mut magic).map_err(|e| io_err(&path, e))?;
        if &magic != MAGIC {
            return Err(BinaryFileError::BadMagic(path));
        }

        let end_of_toc = TOC_ENTRIES_OFFSET + 4 * toc_capacity as u64;

        Ok(Self {
            path,
            toc_capacity,
            end_of_toc,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn end_of_toc(&self) -> u64 {
        self.end_of_toc
    }

    fn open_reader(&self) -> Result<File, BinaryFileError> {
        File::open(&self.path).map_err(|e| io_err(&self.path, e))
    }

    /// Append a frame. The populated-count update is the commit point:
    /// it is written only after the chunk bytes and its TOC entry are
    /// on disk, so a reader can never observe a torn chunk.
    ///
    /// Exceeding the reserved TOC capacity is a programmer error —
    /// callers must recreate the file with a larger capacity — and is
    /// treated as fatal per this server's error taxonomy.
    pub fn write_frame(&self, frame: &TrajectoryFrame) -> Result<(), BinaryFileError> {
        let mut file = self.writer.lock();

        let count = self.read_count_locked(&mut file)?;
        assert!(
            count < self.toc_capacity,
            "trajectory file {:?} TOC capacity ({}) exceeded",
            self.path,
            self.toc_capacity
        );

        file.seek(SeekFrom::End(0)).map_err(|e| io_err(&self.path, e))?;
        let frame_pos = file.stream_position().map_err(|e| io_err(&self.path, e))?;

        let bytes = frame.to_bytes();
        file.write_all(&bytes).map_err(|e| io_err(&self.path, e))?;
        file.flush().map_err(|e| io_err(&self.path, e))?;

        let toc_pos = TOC_ENTRIES_OFFSET + 4 * count as u64;
        file.seek(SeekFrom::Start(toc_pos)).map_err(|e| io_err(&self.path, e))?;
        file.write_all(&(frame_pos as u32).to_le_bytes())
            .map_err(|e| io_err(&self.path, e))?;
        file.flush().map_err(|e| io_err(&self.path, e))?;

        file.seek(SeekFrom::Start(TOC_COUNT_OFFSET))
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(&(count + 1).to_le_bytes())
            .map_err(|e| io_err(&self.path, e))?;
        file.flush().map_err(|e| io_err(&self.path, e))?;

        Ok(())
    }

    fn read_count_locked(&self, file: &mut File) -> Result<u32, BinaryFileError> {
        file.seek(SeekFrom::Start(TOC_COUNT_OFFSET))
            .map_err(|e| io_err(&self.path, e))?;
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf).map_err(|e| io_err(&self.path, e))?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn num_saved_frames(&self) -> Result<u32, BinaryFileError> {
        let mut reader = self.open_reader()?;
        self.read_count_locked(&mut reader)
    }

    fn read_toc_entry(&self, reader: &mut File, index: u32) -> Result<u32, BinaryFileError> {
        let toc_pos = TOC_ENTRIES_OFFSET + 4 * index as u64;
        reader.seek(SeekFrom::Start(toc_pos)).map_err(|e| io_err(&self.path, e))?;
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).map_err(|e| io_err(&self.path, e))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Byte offset of frame `i`. Undefined for `i >= NumSavedFrames()`.
    pub fn frame_pos(&self, index: u32) -> Result<u64, BinaryFileError> {
        let mut reader = self.open_reader()?;
        Ok(self.read_toc_entry(&mut reader, index)? as u64)
    }

    fn end_of_file_pos(&self, reader: &mut File) -> Result<u64, BinaryFileError> {
        reader.seek(SeekFrom::End(0)).map_err(|e| io_err(&self.path, e))
    }

    /// Frame-granular read: the bytes of frame chunk `i`, and the byte
    /// offset immediately after it.
    pub fn get_broadcast_frame(&self, index: u32) -> Result<BroadcastChunk, BinaryFileError> {
        let mut reader = self.open_reader()?;
        let num_frames = self.read_count_locked(&mut reader)?;
        if index >= num_frames {
            return Err(BinaryFileError::FrameOutOfRange(index, num_frames));
        }

        let start = self.read_toc_entry(&mut reader, index)? as u64;
        let end = if index + 1 == num_frames {
            self.end_of_file_pos(&mut reader)?
        } else {
            self.read_toc_entry(&mut reader, index + 1)? as u64
        };

        reader.seek(SeekFrom::Start(start)).map_err(|e| io_err(&self.path, e))?;
        let mut bytes = vec![0u8; (end - start) as usize];
        reader.read_exact(&mut bytes).map_err(|e| io_err(&self.path, e))?;

        Ok(BroadcastChunk { bytes, new_pos: end })
    }

    /// Slice read for continuous streaming: up to `slice_bytes` bytes
    /// starting at `max(current_pos, endOfTOC)`. Not frame-aligned.
    pub fn get_broadcast_update(
        &self,
        current_pos: u64,
        slice_bytes: u64,
    ) -> Result<BroadcastChunk, BinaryFileError> {
        let mut reader = self.open_reader()?;
        let start = current_pos.max(self.end_of_toc);
        let file_len = self.end_of_file_pos(&mut reader)?;

        let available = file_len.saturating_sub(start);
        let to_read = slice_bytes.min(available);

        reader.seek(SeekFrom::Start(start)).map_err(|e| io_err(&self.path, e))?;
        let mut bytes = vec![0u8; to_read as usize];
        reader.read_exact(&mut bytes).map_err(|e| io_err(&self.path, e))?;

        Ok(BroadcastChunk {
            bytes,
            new_pos: start + to_read,
        })
    }

    /// The current end-of-stream byte position (end of file).
    pub fn end_of_stream_pos(&self) -> Result<u64, BinaryFileError> {
        let mut reader = self.open_reader()?;
        self.end_of_file_pos(&mut reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::frame::AgentData;
    use tempfile::NamedTempFile;

    fn agent(id: f32) -> AgentData {
        AgentData {
            vis_type: 1000.0,
            id,
            type_id: 0.0,
            x: id,
            y: id,
            z: id,
            xrot: 0.0,
            yrot: 0.0,
            zrot: 0.0,
            collision_radius: 1.0,
            subpoints: vec![],
        }
    }

    fn make_file(capacity: u32) -> (NamedTempFile, BinaryTrajectoryFile) {
        let tmp = NamedTempFile::new().unwrap();
        let bf = BinaryTrajectoryFile::create(tmp.path(), capacity).unwrap();
        (tmp, bf)
    }

    #[test]
    fn round_trip_written_frames() {
        let (_tmp, bf) = make_file(10);
        let frames: Vec<TrajectoryFrame> = (0..5)
            .map(|i| TrajectoryFrame::new(i, i as f32, vec![agent(i as f32)]))
            .collect();

        for f in &frames {
            bf.write_frame(f).unwrap();
        }

        assert_eq!(bf.num_saved_frames().unwrap(), 5);
        for (i, expected) in frames.iter().enumerate() {
            let chunk = bf.get_broadcast_frame(i as u32).unwrap();
            let decoded = TrajectoryFrame::from_bytes(&chunk.bytes).unwrap();
            assert_eq!(&decoded, expected);
        }
    }

    #[test]
    fn toc_offsets_are_monotone_and_past_end_of_toc() {
        let (_tmp, bf) = make_file(10);
        for i in 0..5u32 {
            bf.write_frame(&TrajectoryFrame::new(i, i as f32, vec![agent(i as f32)]))
                .unwrap();
        }
        let n = bf.num_saved_frames().unwrap();
        let mut last = bf.end_of_toc();
        for i in 0..n {
            let pos = bf.frame_pos(i).unwrap();
            assert!(pos >= bf.end_of_toc());
            if i > 0 {
                assert!(pos > last);
            }
            last = pos;
        }
    }

    #[test]
    fn broadcast_update_cursor_is_monotone_and_reaches_end() {
        let (_tmp, bf) = make_file(10);
        for i in 0..20u32 {
            bf.write_frame(&TrajectoryFrame::new(i, i as f32, vec![agent(i as f32)]))
                .unwrap();
        }

        let end = bf.end_of_stream_pos().unwrap();
        let mut pos = bf.end_of_toc();
        let mut iterations = 0;
        while pos < end {
            let chunk = bf.get_broadcast_update(pos, 64).unwrap();
            assert!(chunk.new_pos >= pos);
            pos = chunk.new_pos;
            iterations += 1;
            assert!(iterations < 10_000, "broadcast update never reached end of stream");
        }
        assert_eq!(pos, end);
    }

    #[test]
    fn exceeding_toc_capacity_panics() {
        let (_tmp, bf) = make_file(1);
        bf.write_frame(&TrajectoryFrame::new(0, 0.0, vec![])).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            bf.write_frame(&TrajectoryFrame::new(1, 1.0, vec![]))
        }));
        assert!(result.is_err());
    }

    #[test]
    fn reading_unwritten_frame_errors() {
        let (_tmp, bf) = make_file(10);
        bf.write_frame(&TrajectoryFrame::new(0, 0.0, vec![])).unwrap();
        assert!(matches!(
            bf.get_broadcast_frame(5),
            Err(BinaryFileError::FrameOutOfRange(5, 1))
        ));
    }
}
