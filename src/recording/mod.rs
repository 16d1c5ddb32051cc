// Recording modules
//
// `frame_store` keeps the rolling window of compressed frames on disk;
// `pipeline` feeds it from the camera and turns it into a video on demand.

pub mod frame_store;
pub mod pipeline;

pub use frame_store::{FrameRingStore, StoreError, StoredFrame};
pub use pipeline::{EncodedVideo, FramePipeline, PipelineError};
