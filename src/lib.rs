// Grabber - rolling camera frame buffer with on-demand video encoding
// Main library entry point

pub mod config;
pub mod encoding;
pub mod frame;
#[cfg(feature = "gstreamer")]
pub mod gstreamer_init;
pub mod recording;

pub use config::Config;
pub use encoding::{EncoderPlatform, VideoCodec};
pub use frame::{PixelFormat, PixelFormatConverter, RasterFrame, RawFrame};
pub use recording::{EncodedVideo, FramePipeline, FrameRingStore, PipelineError};
