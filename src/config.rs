// Configuration management for Grabber

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::Resolution;

/// Seconds between key frames; fixed for every encode
pub const KEY_FRAME_INTERVAL_SECS: u32 = 1;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Target encoder bit rate in bits per second
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,

    /// Frames larger than this are scaled down before they are stored
    #[serde(default = "default_max_resolution")]
    pub max_resolution: Resolution,

    /// Rolling window kept by the frame store, in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Overall deadline for a stop-and-encode, in milliseconds
    #[serde(default = "default_encode_timeout_ms")]
    pub encode_timeout_ms: u64,

    /// Frame rate used when the store cannot estimate one yet
    #[serde(default = "default_frame_rate")]
    pub default_frame_rate: u32,

    /// JPEG quality for buffered frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Where per-session frame directories are created
    #[serde(default = "default_storage_path")]
    pub scratch_root: PathBuf,

    /// Where finished videos are written
    #[serde(default = "default_storage_path")]
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bit_rate: default_bit_rate(),
            max_resolution: default_max_resolution(),
            window_ms: default_window_ms(),
            encode_timeout_ms: default_encode_timeout_ms(),
            default_frame_rate: default_frame_rate(),
            jpeg_quality: default_jpeg_quality(),
            scratch_root: default_storage_path(),
            output_dir: default_storage_path(),
        }
    }
}

impl Config {
    /// Config whose scratch and output directories both live under `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            scratch_root: root.clone(),
            output_dir: root,
            ..Self::default()
        }
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_millis(self.encode_timeout_ms)
    }

    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        log::warn!("Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }
}

fn default_bit_rate() -> u32 {
    8 * 1024 * 1024
}

fn default_max_resolution() -> Resolution {
    Resolution::new(1280, 720)
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_encode_timeout_ms() -> u64 {
    10_000
}

fn default_frame_rate() -> u32 {
    30
}

fn default_jpeg_quality() -> u8 {
    85
}

/// Default storage path for scratch frames and videos
fn default_storage_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("grabber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_field_defaults() {
        let config: Config = toml::from_str("window_ms = 2500\n").unwrap();
        assert_eq!(config.window_ms, 2500);
        assert_eq!(config.jpeg_quality, 85);
        assert_eq!(config.max_resolution, Resolution::new(1280, 720));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grabber.toml");
        let mut config = Config::with_root(dir.path());
        config.bit_rate = 4_000_000;
        config.save(&path).unwrap();

        assert_eq!(Config::load_or_default(&path), config);
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grabber.toml");
        std::fs::write(&path, "window_ms = \"soon\"").unwrap();
        assert_eq!(Config::load_or_default(&path), Config::default());
    }
}
