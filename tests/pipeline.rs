// End-to-end tests of the frame pipeline against the scripted encoder platform

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_logging, ScriptedPlatform, YuvPlanes};
use grabber_lib::encoding::{DeviceInfo, VideoCodec};
use grabber_lib::frame::{PixelFormat, Plane, RawFrame, Resolution};
use grabber_lib::{Config, FramePipeline, PipelineError};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn pipeline(dir: &TempDir, platform: Arc<ScriptedPlatform>) -> FramePipeline {
    init_logging();
    FramePipeline::new(Config::with_root(dir.path()), platform)
}

fn feed(pipeline: &FramePipeline, count: usize) {
    let planes = YuvPlanes::solid(16, 16, 235, 128, 128);
    for _ in 0..count {
        pipeline.on_raw_frame(&planes.frame());
    }
}

#[test]
fn encodes_buffered_frames_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new());
    let pipeline = pipeline(&dir, platform.clone());

    pipeline.start_session("a").unwrap();
    assert!(pipeline.is_recording());
    feed(&pipeline, 5);
    assert_eq!(pipeline.buffered_frames(), 5);

    let video = pipeline.stop_and_encode(TIMEOUT).expect("video");
    assert_eq!(video.path, dir.path().join("video_a.mp4"));
    assert!(video.path.exists());
    assert!(video.size_bytes > 0);
    assert_eq!(video.codec, VideoCodec::H264);
    assert_eq!(video.frame_count, 5);

    assert!(!dir.path().join("frames_a").exists());
    assert!(!pipeline.is_recording());
    assert!(!pipeline.is_encoding());
    assert_eq!(platform.attempts(), vec![VideoCodec::H264]);
}

#[test]
fn empty_store_returns_none_and_removes_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, Arc::new(ScriptedPlatform::new()));

    pipeline.start_session("empty").unwrap();
    assert!(dir.path().join("frames_empty").exists());

    assert!(pipeline.stop_and_encode(TIMEOUT).is_none());
    assert!(!dir.path().join("frames_empty").exists());
    assert!(!dir.path().join("video_empty.mp4").exists());
}

#[test]
fn empty_store_reports_no_frames() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, Arc::new(ScriptedPlatform::new()));

    pipeline.start_session("empty").unwrap();
    assert!(matches!(
        pipeline.try_stop_and_encode(TIMEOUT),
        Err(PipelineError::NoFrames(key)) if key == "empty"
    ));
}

#[test]
fn primary_failure_falls_back_and_sticks() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new().failing_avc(1));
    let pipeline = pipeline(&dir, platform.clone());

    pipeline.start_session("first").unwrap();
    feed(&pipeline, 3);
    let video = pipeline.stop_and_encode(TIMEOUT).expect("fallback video");
    assert_eq!(video.codec, VideoCodec::H265);
    assert!(pipeline.uses_fallback_codec());
    assert_eq!(platform.attempts(), vec![VideoCodec::H264, VideoCodec::H265]);

    // A later encode goes straight to the fallback codec
    pipeline.start_session("second").unwrap();
    feed(&pipeline, 3);
    let video = pipeline.stop_and_encode(TIMEOUT).expect("second video");
    assert_eq!(video.codec, VideoCodec::H265);
    assert_eq!(
        platform.attempts(),
        vec![VideoCodec::H264, VideoCodec::H265, VideoCodec::H265]
    );
}

#[test]
fn failure_on_both_codecs_returns_none_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new().failing_avc(1).failing_hevc(1));
    let pipeline = pipeline(&dir, platform.clone());

    pipeline.start_session("broken").unwrap();
    feed(&pipeline, 3);
    assert!(pipeline.stop_and_encode(TIMEOUT).is_none());

    assert!(!dir.path().join("frames_broken").exists());
    assert!(!dir.path().join("video_broken.mp4").exists());
    assert_eq!(platform.attempts(), vec![VideoCodec::H264, VideoCodec::H265]);
    assert!(pipeline.uses_fallback_codec());
    assert!(!pipeline.is_encoding());

    // The pipeline is usable again, now on the fallback codec
    pipeline.start_session("next").unwrap();
    feed(&pipeline, 2);
    let video = pipeline.stop_and_encode(TIMEOUT).expect("video");
    assert_eq!(video.codec, VideoCodec::H265);
}

#[test]
fn denylisted_device_never_tries_avc() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new().with_device(DeviceInfo::new("HUAWEI", 29)));
    let pipeline = pipeline(&dir, platform.clone());

    pipeline.start_session("d").unwrap();
    feed(&pipeline, 2);
    let video = pipeline.stop_and_encode(TIMEOUT).expect("video");
    assert_eq!(video.codec, VideoCodec::H265);
    assert_eq!(platform.attempts(), vec![VideoCodec::H265]);
    // Device selection is not a failure, so nothing becomes sticky
    assert!(!pipeline.uses_fallback_codec());
}

#[test]
fn timeout_returns_none_and_removes_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new().dequeue_delay(Duration::from_millis(200)));
    let pipeline = pipeline(&dir, platform);

    pipeline.start_session("slow").unwrap();
    feed(&pipeline, 5);

    let result = pipeline.try_stop_and_encode(Duration::from_millis(20));
    assert!(matches!(result, Err(PipelineError::Timeout(_))));
    assert!(!dir.path().join("frames_slow").exists());
    assert!(!dir.path().join("video_slow.mp4").exists());
}

#[test]
fn configured_timeout_bounds_the_default_encode() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new().dequeue_delay(Duration::from_millis(200)));
    let mut config = Config::with_root(dir.path());
    config.encode_timeout_ms = 20;
    init_logging();
    let pipeline = FramePipeline::new(config, platform);

    pipeline.start_session("bounded").unwrap();
    feed(&pipeline, 5);
    assert!(pipeline.stop_and_encode_default().is_none());
    assert!(!dir.path().join("frames_bounded").exists());
    assert!(!dir.path().join("video_bounded.mp4").exists());
}

#[test]
fn default_encode_uses_configured_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, Arc::new(ScriptedPlatform::new()));
    pipeline.start_session("quick").unwrap();
    feed(&pipeline, 2);
    let video = pipeline.stop_and_encode_default().expect("video");
    assert_eq!(video.path, dir.path().join("video_quick.mp4"));
}

#[test]
fn different_key_conflicts_with_active_session() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, Arc::new(ScriptedPlatform::new()));

    pipeline.start_session("a").unwrap();
    feed(&pipeline, 2);
    let err = pipeline.start_session("b").unwrap_err();
    assert!(matches!(
        err,
        PipelineError::SessionConflict { ref active, ref requested } if active == "a" && requested == "b"
    ));
    assert_eq!(pipeline.active_key().as_deref(), Some("a"));
    assert_eq!(pipeline.buffered_frames(), 2);

    // Restarting the same key starts over with an empty store
    pipeline.start_session("a").unwrap();
    assert_eq!(pipeline.buffered_frames(), 0);
    assert!(dir.path().join("frames_a").exists());
}

#[test]
fn frames_without_a_session_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, Arc::new(ScriptedPlatform::new()));

    feed(&pipeline, 3);
    assert!(!pipeline.is_recording());
    assert!(matches!(
        pipeline.try_stop_and_encode(TIMEOUT),
        Err(PipelineError::NoSession)
    ));
    assert!(pipeline.stop_and_encode(TIMEOUT).is_none());
}

#[test]
fn unconvertible_frames_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(&dir, Arc::new(ScriptedPlatform::new()));
    pipeline.start_session("bad").unwrap();

    let data = [0u8; 16];
    let plane = Plane { data: &data, row_stride: 4, pixel_stride: 1 };
    pipeline.on_raw_frame(&RawFrame::new(4, 4, PixelFormat::Other(0x20), vec![plane]));
    pipeline.on_raw_frame(&RawFrame::new(4, 4, PixelFormat::Yuv420, vec![plane]));

    assert_eq!(pipeline.buffered_frames(), 0);
    assert!(pipeline.is_recording());
}

#[test]
fn frames_are_rotated_then_scaled_to_fit() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new());
    let mut config = Config::with_root(dir.path());
    config.max_resolution = Resolution::new(8, 8);
    init_logging();
    let pipeline = FramePipeline::new(config, platform.clone());

    pipeline.start_session("r").unwrap();
    let planes = YuvPlanes::solid(16, 8, 235, 128, 128);
    pipeline.on_raw_frame(&planes.frame().with_rotation(90));
    pipeline.stop_and_encode(TIMEOUT).expect("video");

    // 16x8 rotated is 8x16, scaled by 0.5 to 4x8
    let configs = platform.configs();
    assert_eq!((configs[0].width, configs[0].height), (4, 8));
}

#[test]
fn discard_releases_without_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new());
    let pipeline = pipeline(&dir, platform.clone());

    pipeline.start_session("x").unwrap();
    feed(&pipeline, 2);
    assert!(pipeline.discard());
    assert!(!pipeline.discard());

    assert!(!dir.path().join("frames_x").exists());
    assert!(platform.attempts().is_empty());
    pipeline.start_session("y").unwrap();
}

#[test]
fn producer_keeps_running_while_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(ScriptedPlatform::new().dequeue_delay(Duration::from_millis(5)));
    let pipeline = Arc::new(pipeline(&dir, platform));
    pipeline.start_session("live").unwrap();
    feed(&pipeline, 4);

    let producer = {
        let pipeline = pipeline.clone();
        std::thread::spawn(move || feed(&pipeline, 50))
    };
    let video = pipeline.stop_and_encode(TIMEOUT);
    producer.join().unwrap();

    let video = video.expect("video");
    assert!(video.frame_count >= 4);
    assert!(!pipeline.is_recording());
    assert!(!dir.path().join("frames_live").exists());
}
