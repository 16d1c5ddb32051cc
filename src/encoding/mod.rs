// Video encoding and container format support
//
// This module defines the codecs the clip encoder can target and the fixed
// configuration handed to an encoder session. To add a new codec:
// 1. Add variant to VideoCodec enum
// 2. Add MIME type, caps name and parser mappings
// 3. Add container mapping in container()
// 4. Teach the GStreamer backend which elements encode it

pub mod encoder;
pub mod fallback;
#[cfg(feature = "gstreamer")]
pub mod gst_backend;

pub use encoder::{
    CancelFlag, CodecSession, ContainerWriter, EncodeStats, EncodedPacket, EncoderError,
    EncoderPlatform, EncoderState, OutputStatus, PacketFlags, SampleInfo, TrackFormat,
    VideoEncoder,
};
pub use fallback::{encode_with_fallback, select_codec, EncodeOutcome, EncodeRequest};

use serde::{Deserialize, Serialize};

use crate::config::KEY_FRAME_INTERVAL_SECS;

/// Supported video codecs for clip encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC - preferred, widest hardware support
    H264,
    /// H.265/HEVC - fallback when AVC is missing or known to misbehave
    H265,
}

impl VideoCodec {
    /// Codec tried first
    pub const PRIMARY: VideoCodec = VideoCodec::H264;
    /// Codec used after the primary fails (and for denylisted devices)
    pub const FALLBACK: VideoCodec = VideoCodec::H265;

    /// MIME type as reported by platform codec lists
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/avc",
            VideoCodec::H265 => "video/hevc",
        }
    }

    /// Get the GStreamer caps name for this codec
    pub fn gst_caps_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/x-h264",
            VideoCodec::H265 => "video/x-h265",
        }
    }

    /// Get the GStreamer parser element name for this codec
    pub fn gst_parser(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264parse",
            VideoCodec::H265 => "h265parse",
        }
    }

    /// Stream format the MP4 muxer accepts
    pub fn gst_stream_format(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "avc",
            VideoCodec::H265 => "hvc1",
        }
    }

    /// Human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
        }
    }

    /// Get the appropriate container format for this codec
    pub fn container(&self) -> ContainerFormat {
        ContainerFormat::Mp4
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// MP4 (.mp4)
    Mp4,
}

impl ContainerFormat {
    /// Get the file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
        }
    }

    /// Get the GStreamer muxer element name
    pub fn gst_muxer(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4mux",
        }
    }
}

/// Fixed configuration for one encoder session.
/// Nothing here is renegotiated once the session has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Target bit rate in bits per second
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub key_frame_interval_secs: u32,
}

impl MediaConfig {
    pub fn new(codec: VideoCodec, width: u32, height: u32, bit_rate: u32, frame_rate: u32) -> Self {
        Self {
            codec,
            width,
            height,
            bit_rate,
            frame_rate: frame_rate.max(1),
            key_frame_interval_secs: KEY_FRAME_INTERVAL_SECS,
        }
    }

    /// Same configuration targeting another codec
    pub fn with_codec(&self, codec: VideoCodec) -> Self {
        Self { codec, ..self.clone() }
    }

    /// Key frame interval expressed in frames
    pub fn key_frame_interval_frames(&self) -> u32 {
        (self.frame_rate * self.key_frame_interval_secs).max(1)
    }

    /// Duration of one frame in microseconds
    pub fn frame_duration_us(&self) -> u64 {
        1_000_000 / self.frame_rate.max(1) as u64
    }
}

/// Manufacturers whose AVC encoders are known to produce corrupt output
const CORRUPT_AVC_MANUFACTURERS: &[&str] = &["huawei", "xiaomi", "redmi", "oppo", "sony"];

/// First platform API level where the corrupt AVC output shows up
const CORRUPT_AVC_MIN_API_LEVEL: u32 = 28;

/// What we know about the device the encoder runs on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: String,
    /// Platform API level, 0 when unknown
    pub api_level: u32,
}

impl DeviceInfo {
    pub fn new(manufacturer: impl Into<String>, api_level: u32) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            api_level,
        }
    }

    /// Whether AVC output from this device should not be trusted
    pub fn is_corrupt_avc_device(&self) -> bool {
        if self.api_level < CORRUPT_AVC_MIN_API_LEVEL {
            return false;
        }
        let manufacturer = self.manufacturer.to_lowercase();
        CORRUPT_AVC_MANUFACTURERS
            .iter()
            .any(|m| manufacturer.contains(m))
    }
}
