// Shared helpers for integration tests: a scripted encoder platform that
// behaves like a hardware codec with an input surface, plus frame builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use grabber_lib::encoding::{
    CodecSession, ContainerFormat, ContainerWriter, DeviceInfo, EncodedPacket, EncoderError,
    EncoderPlatform, MediaConfig, OutputStatus, SampleInfo, TrackFormat, VideoCodec,
};
use grabber_lib::frame::{PixelFormat, Plane, RawFrame};
use grabber_lib::RasterFrame;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What the scripted codec was asked to do
#[derive(Default)]
pub struct PlatformLog {
    pub attempts: Vec<VideoCodec>,
    pub configs: Vec<MediaConfig>,
    pub frames_drawn: usize,
}

pub struct ScriptedPlatform {
    pub device: DeviceInfo,
    pub supported: Vec<VideoCodec>,
    /// AVC attempts that still have to fail mid-encode
    failing_avc: AtomicUsize,
    /// Same for HEVC
    failing_hevc: AtomicUsize,
    /// Simulated hardware latency per output dequeue
    dequeue_delay: Duration,
    log: Arc<Mutex<PlatformLog>>,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self {
            device: DeviceInfo::new("Google", 33),
            supported: vec![VideoCodec::H264, VideoCodec::H265],
            failing_avc: AtomicUsize::new(0),
            failing_hevc: AtomicUsize::new(0),
            dequeue_delay: Duration::ZERO,
            log: Arc::new(Mutex::new(PlatformLog::default())),
        }
    }

    pub fn failing_avc(self, attempts: usize) -> Self {
        self.failing_avc.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn failing_hevc(self, attempts: usize) -> Self {
        self.failing_hevc.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn dequeue_delay(mut self, delay: Duration) -> Self {
        self.dequeue_delay = delay;
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    pub fn attempts(&self) -> Vec<VideoCodec> {
        self.log.lock().attempts.clone()
    }

    pub fn configs(&self) -> Vec<MediaConfig> {
        self.log.lock().configs.clone()
    }
}

impl EncoderPlatform for ScriptedPlatform {
    fn device(&self) -> DeviceInfo {
        self.device.clone()
    }

    fn supports(&self, codec: VideoCodec) -> bool {
        self.supported.contains(&codec)
    }

    fn create_codec(&self, config: &MediaConfig) -> Result<Box<dyn CodecSession>, EncoderError> {
        {
            let mut log = self.log.lock();
            log.attempts.push(config.codec);
            log.configs.push(config.clone());
        }
        let remaining_faults = match config.codec {
            VideoCodec::H264 => &self.failing_avc,
            VideoCodec::H265 => &self.failing_hevc,
        };
        let faulty = remaining_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(ScriptedCodec {
            config: config.clone(),
            faulty,
            delay: self.dequeue_delay,
            log: self.log.clone(),
            pending: VecDeque::new(),
            format_sent: false,
            eos_requested: false,
        }))
    }

    fn create_writer(
        &self,
        path: &Path,
        _container: ContainerFormat,
    ) -> Result<Box<dyn ContainerWriter>, EncoderError> {
        Ok(Box::new(FileWriter {
            path: path.to_path_buf(),
            file: None,
        }))
    }
}

struct ScriptedCodec {
    config: MediaConfig,
    faulty: bool,
    delay: Duration,
    log: Arc<Mutex<PlatformLog>>,
    pending: VecDeque<EncodedPacket>,
    format_sent: bool,
    eos_requested: bool,
}

impl CodecSession for ScriptedCodec {
    fn configure(&mut self, _config: &MediaConfig) -> Result<(), EncoderError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        Ok(())
    }

    fn draw_frame(&mut self, frame: &RasterFrame, pts_us: u64) -> Result<(), EncoderError> {
        if self.faulty {
            return Err(EncoderError::Pipeline("simulated encoder fault".into()));
        }
        let index = self.log.lock().frames_drawn;
        self.log.lock().frames_drawn += 1;
        let key_frame = index as u32 % self.config.key_frame_interval_frames() == 0;
        let data = frame.pixels()[..16.min(frame.pixels().len())].to_vec();
        self.pending.push_back(EncodedPacket::new(data, pts_us, key_frame));
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<(), EncoderError> {
        self.eos_requested = true;
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<OutputStatus, EncoderError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if !self.format_sent && !self.pending.is_empty() {
            self.format_sent = true;
            return Ok(OutputStatus::FormatChanged(TrackFormat {
                codec: self.config.codec,
                width: self.config.width,
                height: self.config.height,
                frame_rate: self.config.frame_rate,
                description: self.config.codec.mime_type().to_string(),
            }));
        }
        if let Some(packet) = self.pending.pop_front() {
            return Ok(OutputStatus::Buffer(packet));
        }
        if self.eos_requested {
            self.eos_requested = false;
            return Ok(OutputStatus::Buffer(EncodedPacket::end_of_stream(0)));
        }
        Ok(OutputStatus::TryAgainLater)
    }

    fn stop(&mut self) {}
}

struct FileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl ContainerWriter for FileWriter {
    fn add_track(&mut self, _format: &TrackFormat) -> Result<usize, EncoderError> {
        Ok(0)
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        self.file = Some(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?,
        );
        Ok(())
    }

    fn write_sample(
        &mut self,
        _track: usize,
        payload: &[u8],
        _info: &SampleInfo,
    ) -> Result<(), EncoderError> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(payload)?),
            None => Err(EncoderError::InvalidState("writer not started".into())),
        }
    }

    fn finish(&mut self) -> Result<(), EncoderError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Planes of a solid-colour 4:2:0 frame with packed rows
pub struct YuvPlanes {
    pub width: u32,
    pub height: u32,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl YuvPlanes {
    pub fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let luma = (width * height) as usize;
        let chroma = luma / 4;
        Self {
            width,
            height,
            y: vec![y; luma],
            u: vec![u; chroma],
            v: vec![v; chroma],
        }
    }

    pub fn frame(&self) -> RawFrame<'_> {
        let chroma_stride = (self.width / 2) as usize;
        RawFrame::new(
            self.width,
            self.height,
            PixelFormat::Yuv420,
            vec![
                Plane { data: &self.y, row_stride: self.width as usize, pixel_stride: 1 },
                Plane { data: &self.u, row_stride: chroma_stride, pixel_stride: 1 },
                Plane { data: &self.v, row_stride: chroma_stride, pixel_stride: 1 },
            ],
        )
    }
}
