//! Clip encoder driving a codec session and a container writer
//!
//! The codec and the container writer are platform collaborators (a
//! hardware encoder with an input surface, an MP4 muxer). They are reached
//! through the [`EncoderPlatform`], [`CodecSession`] and [`ContainerWriter`]
//! traits so the draining protocol here stays independent of the backend.
//!
//! ## Lifecycle
//! `Idle -> Configuring -> Started -> Draining -> Finalized`, with
//! `Idle -> Failed` when the codec cannot be set up.
//!
//! ## Draining
//! Every submitted frame is followed by a non-blocking drain pass that moves
//! whatever compressed output is ready into the container. At the end the
//! input is closed and the drain spins until the end-of-stream packet is
//! written. The spin polls a [`CancelFlag`] on every iteration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{imageops, RgbImage};

use super::{ContainerFormat, MediaConfig, VideoCodec};
use crate::frame::RasterFrame;

/// How long a single output dequeue may block
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(10);

/// Longest the end-of-stream drain waits without seeing any output
pub const EOS_IDLE_LIMIT: Duration = Duration::from_secs(5);

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("No usable encoder: {0}")]
    CodecUnavailable(String),

    #[error("Failed to encode with {codec}: {source}")]
    Encode {
        codec: VideoCodec,
        #[source]
        source: Box<EncoderError>,
    },

    #[error("Encoder output format changed twice")]
    FormatChangedTwice,

    #[error("Invalid encoder state: {0}")]
    InvalidState(String),

    #[error("Encoding cancelled")]
    Cancelled,

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Cooperative cancellation shared between the coordinator and the encode worker
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Output track description produced by the codec once its format is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Backend-specific description (e.g. serialized caps with codec data)
    pub description: String,
}

/// Flags attached to an output packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub key_frame: bool,
    /// Codec setup data; already carried by the track format
    pub codec_config: bool,
    pub end_of_stream: bool,
}

/// Compressed output from the codec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    /// Start of the payload within `data`
    pub offset: usize,
    /// Payload length in bytes
    pub size: usize,
    /// Presentation timestamp in microseconds
    pub pts_us: u64,
    pub flags: PacketFlags,
}

impl EncodedPacket {
    /// Packet whose payload is the whole of `data`
    pub fn new(data: Vec<u8>, pts_us: u64, key_frame: bool) -> Self {
        let size = data.len();
        Self {
            data,
            offset: 0,
            size,
            pts_us,
            flags: PacketFlags {
                key_frame,
                ..PacketFlags::default()
            },
        }
    }

    /// Empty packet flagged end-of-stream
    pub fn end_of_stream(pts_us: u64) -> Self {
        Self {
            pts_us,
            flags: PacketFlags {
                end_of_stream: true,
                ..PacketFlags::default()
            },
            ..Self::default()
        }
    }

    /// The bytes between `offset` and `offset + size`, clipped to `data`
    pub fn payload(&self) -> &[u8] {
        let start = self.offset.min(self.data.len());
        let end = self.offset.saturating_add(self.size).min(self.data.len());
        &self.data[start..end]
    }
}

/// Result of one output dequeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputStatus {
    /// Nothing ready yet
    TryAgainLater,
    /// The output format is now known; the container track can be added
    FormatChanged(TrackFormat),
    /// Negative status code the codec reported instead of a buffer
    Unexpected(i32),
    /// A compressed output buffer
    Buffer(EncodedPacket),
}

/// Per-sample metadata handed to the container writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    /// Presentation time relative to the first sample, in microseconds
    pub pts_us: u64,
    pub duration_us: u64,
    pub key_frame: bool,
}

/// A configured codec instance with an input surface
pub trait CodecSession: Send {
    fn configure(&mut self, config: &MediaConfig) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    /// Draw a frame onto the input surface
    fn draw_frame(&mut self, frame: &RasterFrame, pts_us: u64) -> Result<()>;
    fn signal_end_of_input(&mut self) -> Result<()>;
    /// Wait up to `timeout` for the next output event
    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputStatus>;
    /// Stop and release the codec; must tolerate being called more than once
    fn stop(&mut self);
}

/// Container writer (muxer)
pub trait ContainerWriter: Send {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize>;
    fn start(&mut self) -> Result<()>;
    fn write_sample(&mut self, track: usize, payload: &[u8], info: &SampleInfo) -> Result<()>;
    /// Flush and close the output; must tolerate being called more than once
    fn finish(&mut self) -> Result<()>;
}

/// Factory for codec sessions and container writers
pub trait EncoderPlatform: Send + Sync {
    fn device(&self) -> super::DeviceInfo;
    fn supports(&self, codec: VideoCodec) -> bool;
    fn create_codec(&self, config: &MediaConfig) -> Result<Box<dyn CodecSession>>;
    fn create_writer(&self, path: &Path, container: ContainerFormat) -> Result<Box<dyn ContainerWriter>>;
}

/// Encoder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    Configuring,
    Started,
    Draining,
    Finalized,
    Failed,
}

/// Statistics from an encoding session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub frames_submitted: u64,
    pub samples_written: u64,
    pub bytes_written: u64,
    /// Span from the first to the end of the last sample
    pub duration_us: u64,
}

/// Encodes a sequence of rasters into one container file
pub struct VideoEncoder {
    config: MediaConfig,
    output_path: PathBuf,
    state: EncoderState,
    cancel: CancelFlag,
    codec: Option<Box<dyn CodecSession>>,
    writer: Option<Box<dyn ContainerWriter>>,
    track: Option<usize>,
    /// PTS of the first muxed sample; every later sample is relative to it
    first_pts_us: Option<u64>,
    last_pts_us: Option<u64>,
    stats: EncodeStats,
    finalized_path: Option<PathBuf>,
}

impl VideoEncoder {
    pub fn new(config: MediaConfig, output_path: PathBuf, cancel: CancelFlag) -> Self {
        Self {
            config,
            output_path,
            state: EncoderState::Idle,
            cancel,
            codec: None,
            writer: None,
            track: None,
            first_pts_us: None,
            last_pts_us: None,
            stats: EncodeStats::default(),
            finalized_path: None,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    pub fn stats(&self) -> EncodeStats {
        self.stats
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Create and configure the codec and the container writer, then start
    /// the codec
    pub fn start(&mut self, platform: &dyn EncoderPlatform) -> Result<()> {
        if self.state != EncoderState::Idle {
            return Err(EncoderError::InvalidState(format!(
                "start() called in {:?}",
                self.state
            )));
        }
        self.state = EncoderState::Configuring;

        if let Err(e) = self.setup(platform) {
            log::warn!("Failed to set up {} encoder: {}", self.config.codec, e);
            self.release_internals();
            self.state = EncoderState::Failed;
            return Err(match e {
                EncoderError::CodecUnavailable(_) | EncoderError::Cancelled => e,
                other => EncoderError::CodecUnavailable(format!("{}: {}", self.config.codec, other)),
            });
        }

        self.state = EncoderState::Started;
        log::debug!(
            "Encoding {}x{} @ {}fps, {} bps with {}",
            self.config.width,
            self.config.height,
            self.config.frame_rate,
            self.config.bit_rate,
            self.config.codec
        );
        self.drain(false)
    }

    fn setup(&mut self, platform: &dyn EncoderPlatform) -> Result<()> {
        let mut codec = platform.create_codec(&self.config)?;
        codec.configure(&self.config)?;
        self.codec = Some(codec);

        if let Some(parent) = self.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.writer = Some(platform.create_writer(&self.output_path, self.config.codec.container())?);

        if let Some(codec) = self.codec.as_mut() {
            codec.start()?;
        }
        Ok(())
    }

    /// Draw one frame onto the input surface and move any ready output into
    /// the container. Frames are stamped `index / frame_rate`.
    pub fn submit_frame(&mut self, frame: &RasterFrame) -> Result<()> {
        self.expect_state(EncoderState::Started, "submit_frame")?;

        let pts_us = self.stats.frames_submitted * self.config.frame_duration_us();
        let surface_frame = self.fit_to_surface(frame);
        let codec = self
            .codec
            .as_mut()
            .ok_or_else(|| EncoderError::InvalidState("codec missing".into()))?;
        codec.draw_frame(surface_frame.as_ref().unwrap_or(frame), pts_us)?;
        self.stats.frames_submitted += 1;

        self.drain(false)
    }

    /// Frames of a different size are drawn at the top-left of a black
    /// surface-sized canvas; `None` means the frame already fits exactly.
    fn fit_to_surface(&self, frame: &RasterFrame) -> Option<RasterFrame> {
        if frame.width() == self.config.width && frame.height() == self.config.height {
            return None;
        }
        log::debug!(
            "Frame {}x{} drawn onto {}x{} surface",
            frame.width(),
            frame.height(),
            self.config.width,
            self.config.height
        );
        let mut canvas = RgbImage::new(self.config.width, self.config.height);
        imageops::replace(&mut canvas, frame.image(), 0, 0);
        Some(RasterFrame::from_image(canvas))
    }

    /// Close the input and pull output until end-of-stream
    pub fn drain_remaining(&mut self) -> Result<()> {
        self.expect_state(EncoderState::Started, "drain_remaining")?;
        self.state = EncoderState::Draining;

        log::debug!("Sending end of stream to encoder");
        if let Some(codec) = self.codec.as_mut() {
            codec.signal_end_of_input()?;
        }
        self.drain(true)
    }

    fn drain(&mut self, end_of_stream: bool) -> Result<()> {
        let mut idle_since = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(EncoderError::Cancelled);
            }

            let status = self
                .codec
                .as_mut()
                .ok_or_else(|| EncoderError::InvalidState("codec missing".into()))?
                .dequeue_output(DEQUEUE_TIMEOUT)?;

            match status {
                OutputStatus::TryAgainLater => {
                    if !end_of_stream || eos_wait_expired(idle_since) {
                        break;
                    }
                    log::trace!("No output available, spinning to await EOS");
                }
                OutputStatus::FormatChanged(format) => {
                    if self.track.is_some() {
                        return Err(EncoderError::FormatChangedTwice);
                    }
                    log::debug!("Encoder output format changed: {}", format.description);
                    let writer = self
                        .writer
                        .as_mut()
                        .ok_or_else(|| EncoderError::InvalidState("writer missing".into()))?;
                    let track = writer.add_track(&format)?;
                    writer.start()?;
                    self.track = Some(track);
                    idle_since = Instant::now();
                }
                // Counts as idle, same as no output
                OutputStatus::Unexpected(status) => {
                    log::debug!("Unexpected result from encoder dequeue: {}", status);
                    if !end_of_stream || eos_wait_expired(idle_since) {
                        break;
                    }
                }
                OutputStatus::Buffer(packet) => {
                    idle_since = Instant::now();
                    if self.write_packet(packet)? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Mux one packet; returns whether it carried end-of-stream
    fn write_packet(&mut self, packet: EncodedPacket) -> Result<bool> {
        let end_of_stream = packet.flags.end_of_stream;
        if packet.flags.codec_config || packet.payload().is_empty() {
            return Ok(end_of_stream);
        }

        let track = self.track.ok_or_else(|| {
            EncoderError::Pipeline("encoder produced output before its format".into())
        })?;

        let first = *self.first_pts_us.get_or_insert_with(|| {
            log::info!("First video sample written");
            packet.pts_us
        });
        let mut pts_us = packet.pts_us.saturating_sub(first);
        if let Some(last) = self.last_pts_us {
            if pts_us <= last {
                pts_us = last + 1;
            }
        }
        self.last_pts_us = Some(pts_us);

        let frame_duration = self.config.frame_duration_us();
        let info = SampleInfo {
            pts_us,
            duration_us: frame_duration,
            key_frame: packet.flags.key_frame,
        };
        let payload = packet.payload();
        self.writer
            .as_mut()
            .ok_or_else(|| EncoderError::InvalidState("writer missing".into()))?
            .write_sample(track, payload, &info)?;

        self.stats.samples_written += 1;
        self.stats.bytes_written += payload.len() as u64;
        self.stats.duration_us = pts_us + frame_duration;
        Ok(end_of_stream)
    }

    /// Stop the codec and close the container.
    ///
    /// Returns the output file when at least one sample was muxed; otherwise
    /// the empty artifact is deleted and `None` is returned. Repeated calls
    /// return the first result.
    pub fn finalize(&mut self) -> Option<PathBuf> {
        if self.state == EncoderState::Finalized {
            return self.finalized_path.clone();
        }

        let closed = self.release_internals();
        self.state = EncoderState::Finalized;

        if closed && self.stats.samples_written > 0 && self.output_path.exists() {
            self.finalized_path = Some(self.output_path.clone());
        } else {
            remove_artifact(&self.output_path);
        }
        self.finalized_path.clone()
    }

    /// Finalize and throw the output away
    pub fn discard(&mut self) {
        self.finalize();
        if self.finalized_path.take().is_some() {
            remove_artifact(&self.output_path);
        }
    }

    /// Stop codec and writer; returns whether the container closed cleanly
    fn release_internals(&mut self) -> bool {
        log::debug!("Releasing encoder objects");
        if let Some(mut codec) = self.codec.take() {
            codec.stop();
        }
        let mut closed = true;
        if let Some(mut writer) = self.writer.take() {
            if self.track.is_some() {
                if let Err(e) = writer.finish() {
                    log::warn!("Failed to finalize container: {}", e);
                    closed = false;
                }
            }
        }
        closed
    }

    fn expect_state(&self, expected: EncoderState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(EncoderError::InvalidState(format!(
                "{}() called in {:?}",
                operation, self.state
            )));
        }
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        // Error paths may skip finalize(); never leak a running codec
        if self.codec.is_some() || self.writer.is_some() {
            self.release_internals();
        }
    }
}

fn eos_wait_expired(idle_since: Instant) -> bool {
    let expired = idle_since.elapsed() > EOS_IDLE_LIMIT;
    if expired {
        log::warn!(
            "No end of stream from encoder after {:?}, giving up",
            EOS_IDLE_LIMIT
        );
    }
    expired
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Deleted incomplete output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to delete {}: {}", path.display(), e),
    }
}
