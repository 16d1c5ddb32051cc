// Rolling on-disk frame store
//
// Keeps the most recent window of camera frames as JPEG files in a
// per-session scratch directory. Each append compresses the frame, then
// evicts from the front until the span between the oldest and newest
// frame fits the configured window again.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;

use crate::frame::RasterFrame;

/// Error type for frame store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JPEG compression failed: {0}")]
    Compress(#[from] image::ImageError),

    #[error("Frame store for session '{0}' was released")]
    Released(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A compressed frame on disk with its capture time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
    pub path: PathBuf,
    /// Capture time in milliseconds since the store was created
    pub timestamp_ms: u64,
}

/// Time-windowed store of JPEG frames
pub struct FrameRingStore {
    key: String,
    root: PathBuf,
    max_duration_ms: u64,
    jpeg_quality: u8,
    frames: VecDeque<StoredFrame>,
    /// Total frames ever written; used for file names and never reused
    frames_written: u64,
    width: u32,
    height: u32,
    epoch: Instant,
    released: bool,
}

impl FrameRingStore {
    /// Create the store and its scratch directory `scratch_root/frames_<key>`.
    /// Leftovers from an earlier run with the same key are removed.
    pub fn new(scratch_root: &Path, key: &str, max_duration_ms: u64, jpeg_quality: u8) -> Result<Self> {
        let root = scratch_root.join(format!("frames_{}", key));
        if root.exists() {
            log::warn!("Removing stale frame directory {}", root.display());
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        log::debug!("Frame store '{}' created at {}", key, root.display());

        Ok(Self {
            key: key.to_string(),
            root,
            max_duration_ms,
            jpeg_quality: jpeg_quality.clamp(1, 100),
            frames: VecDeque::with_capacity(64),
            frames_written: 0,
            width: 0,
            height: 0,
            epoch: Instant::now(),
            released: false,
        })
    }

    /// Append a frame stamped with the current time
    pub fn append(&mut self, frame: &RasterFrame) -> Result<()> {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.append_at(frame, now_ms)
    }

    /// Append a frame captured at `timestamp_ms`.
    ///
    /// Timestamps older than the newest stored frame are clamped to it so
    /// the sequence stays ordered.
    pub fn append_at(&mut self, frame: &RasterFrame, timestamp_ms: u64) -> Result<()> {
        if self.released {
            return Err(StoreError::Released(self.key.clone()));
        }

        let timestamp_ms = match self.frames.back() {
            Some(newest) if timestamp_ms < newest.timestamp_ms => {
                log::debug!(
                    "Clamping out-of-order timestamp {}ms to {}ms",
                    timestamp_ms,
                    newest.timestamp_ms
                );
                newest.timestamp_ms
            }
            _ => timestamp_ms,
        };

        let index = self.frames_written;
        self.frames_written += 1;
        let path = self.root.join(format!("frame_{}.jpg", index));
        self.write_jpeg(frame, &path)?;

        self.width = frame.width();
        self.height = frame.height();
        self.frames.push_back(StoredFrame { path, timestamp_ms });
        self.evict(timestamp_ms);

        log::trace!(
            "Stored frame {} at {}ms, window holds {} frames",
            index,
            timestamp_ms,
            self.frames.len()
        );
        Ok(())
    }

    fn write_jpeg(&self, frame: &RasterFrame, path: &Path) -> Result<()> {
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, self.jpeg_quality).encode_image(frame.image())?;
        if let Err(e) = fs::write(path, &data) {
            // Don't leave a truncated file behind
            let _ = fs::remove_file(path);
            return Err(e.into());
        }
        Ok(())
    }

    fn evict(&mut self, newest_ms: u64) {
        while let Some(front) = self.frames.front() {
            if newest_ms - front.timestamp_ms <= self.max_duration_ms {
                break;
            }
            if let Some(evicted) = self.frames.pop_front() {
                if let Err(e) = fs::remove_file(&evicted.path) {
                    log::warn!("Failed to delete evicted frame {}: {}", evicted.path.display(), e);
                }
            }
        }
    }

    /// Paths of the frames currently in the window, oldest first
    pub fn frames(&self) -> Vec<PathBuf> {
        self.frames.iter().map(|f| f.path.clone()).collect()
    }

    /// Frames currently in the window with their timestamps, oldest first
    pub fn snapshot(&self) -> Vec<StoredFrame> {
        self.frames.iter().cloned().collect()
    }

    /// Span between the oldest and newest frame
    pub fn duration_ms(&self) -> u64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
            _ => 0,
        }
    }

    /// Achieved capture rate over the window.
    ///
    /// `None` until at least two frames with distinct timestamps exist.
    pub fn fps(&self) -> Option<u32> {
        let duration = self.duration_ms();
        if self.frames.len() < 2 || duration == 0 {
            return None;
        }
        Some((self.frames.len() as f64 / duration as f64 * 1000.0).ceil() as u32)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Size of the most recently appended frame
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration_ms
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Delete the scratch directory and forget all frames.
    ///
    /// Safe to call any number of times. Returns `true` only for the call
    /// that actually released the storage.
    pub fn release(&mut self) -> bool {
        self.frames.clear();
        if self.released {
            return false;
        }
        self.released = true;

        match fs::remove_dir_all(&self.root) {
            Ok(()) => log::debug!("Released frame store '{}'", self.key),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", self.root.display(), e),
        }
        true
    }
}

impl Drop for FrameRingStore {
    fn drop(&mut self) {
        self.release();
    }
}
