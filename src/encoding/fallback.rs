// Codec selection and the one-shot fallback retry
//
// The primary codec is tried first. If that attempt fails structurally the
// clip is encoded again with the fallback codec, and the caller's sticky
// flag is set so later encodes go straight to the fallback.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use super::encoder::{CancelFlag, EncodeStats, EncoderError, EncoderPlatform, Result, VideoEncoder};
use super::{MediaConfig, VideoCodec};
use crate::frame::RasterFrame;

/// Everything needed to encode one clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeRequest {
    pub width: u32,
    pub height: u32,
    /// Bits per second
    pub bit_rate: u32,
    pub frame_rate: u32,
    /// Stored JPEG frames, oldest first
    pub frames: Vec<PathBuf>,
}

impl EncodeRequest {
    fn media_config(&self, codec: VideoCodec) -> MediaConfig {
        MediaConfig::new(codec, self.width, self.height, self.bit_rate, self.frame_rate)
    }
}

/// A successfully encoded clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeOutcome {
    pub path: PathBuf,
    pub codec: VideoCodec,
    pub stats: EncodeStats,
}

/// Pick the codec for the next encode.
///
/// The fallback codec is used when the sticky flag is set, when the primary
/// is unsupported, or when the device is known to produce corrupt primary
/// output (and the fallback is available).
pub fn select_codec(platform: &dyn EncoderPlatform, sticky: bool) -> Result<VideoCodec> {
    let primary = VideoCodec::PRIMARY;
    let fallback = VideoCodec::FALLBACK;
    let device = platform.device();
    let has_primary = platform.supports(primary);
    let has_fallback = platform.supports(fallback);

    if has_primary && !sticky && !device.is_corrupt_avc_device() {
        return Ok(primary);
    }
    if has_fallback {
        if !sticky && has_primary {
            log::info!(
                "Using {} on {} (API {}): {} output is unreliable there",
                fallback,
                device.manufacturer,
                device.api_level,
                primary
            );
        }
        return Ok(fallback);
    }
    if has_primary {
        log::warn!("{} unavailable, staying on {}", fallback, primary);
        return Ok(primary);
    }
    Err(EncoderError::CodecUnavailable(format!(
        "neither {} nor {} is supported",
        primary, fallback
    )))
}

/// Encode `request` into `destination`, retrying once with the fallback
/// codec when the first attempt fails.
///
/// Partial output is deleted on every failure. Cancellation is never
/// retried.
pub fn encode_with_fallback(
    platform: &dyn EncoderPlatform,
    request: &EncodeRequest,
    destination: &Path,
    sticky: &AtomicBool,
    cancel: &CancelFlag,
) -> Result<EncodeOutcome> {
    if request.frames.is_empty() {
        return Err(EncoderError::InvalidState("no frames to encode".into()));
    }

    let codec = select_codec(platform, sticky.load(Ordering::Acquire))?;
    let err = match encode_once(platform, request, destination, codec, cancel) {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };

    let retryable = matches!(
        err,
        EncoderError::Encode { .. } | EncoderError::CodecUnavailable(_)
    );
    if !retryable
        || codec == VideoCodec::FALLBACK
        || cancel.is_cancelled()
        || !platform.supports(VideoCodec::FALLBACK)
    {
        return Err(err);
    }
    if sticky.swap(true, Ordering::AcqRel) {
        // Another encode already switched over; don't retry twice
        return Err(err);
    }

    log::warn!(
        "Encoding with {} failed ({}), retrying with {}",
        codec,
        err,
        VideoCodec::FALLBACK
    );
    encode_once(platform, request, destination, VideoCodec::FALLBACK, cancel)
}

fn encode_once(
    platform: &dyn EncoderPlatform,
    request: &EncodeRequest,
    destination: &Path,
    codec: VideoCodec,
    cancel: &CancelFlag,
) -> Result<EncodeOutcome> {
    let mut encoder = VideoEncoder::new(
        request.media_config(codec),
        destination.to_path_buf(),
        cancel.clone(),
    );

    if let Err(e) = feed_frames(&mut encoder, platform, request, cancel) {
        encoder.discard();
        return Err(match e {
            EncoderError::Cancelled | EncoderError::CodecUnavailable(_) => e,
            other => EncoderError::Encode {
                codec,
                source: Box::new(other),
            },
        });
    }

    let stats = encoder.stats();
    match encoder.finalize() {
        Some(path) => {
            log::info!(
                "Encoded {} frames with {} into {} ({} bytes)",
                stats.frames_submitted,
                codec,
                path.display(),
                stats.bytes_written
            );
            Ok(EncodeOutcome { path, codec, stats })
        }
        None => Err(EncoderError::Encode {
            codec,
            source: Box::new(EncoderError::Pipeline("encoder wrote no samples".into())),
        }),
    }
}

fn feed_frames(
    encoder: &mut VideoEncoder,
    platform: &dyn EncoderPlatform,
    request: &EncodeRequest,
    cancel: &CancelFlag,
) -> Result<()> {
    encoder.start(platform)?;
    for path in &request.frames {
        if cancel.is_cancelled() {
            return Err(EncoderError::Cancelled);
        }
        let image = image::open(path)?.to_rgb8();
        encoder.submit_frame(&RasterFrame::from_image(image))?;
    }
    encoder.drain_remaining()
}
