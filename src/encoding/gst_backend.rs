//! GStreamer implementation of the encoder platform
//!
//! The codec session is `appsrc ! videoconvert ! <enc> ! <parse> ! capsfilter ! appsink`.
//! Rasters are pushed into the appsrc and compressed access units are pulled
//! from the appsink, so the generic drain loop in [`super::encoder`] drives
//! it exactly like a hardware codec with an input surface.
//!
//! The container writer is `appsrc ! mp4mux ! filesink`, with caps taken from
//! the codec's negotiated output (which carries the codec data).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::encoder::{
    CodecSession, ContainerWriter, EncodedPacket, EncoderError, EncoderPlatform, OutputStatus,
    PacketFlags, Result, SampleInfo, TrackFormat,
};
use super::{ContainerFormat, DeviceInfo, MediaConfig, VideoCodec};
use crate::frame::RasterFrame;
use crate::gstreamer_init::init_gstreamer;

/// Encoder element families, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEncoderType {
    /// VA-API (Linux)
    VaApi,
    /// NVIDIA NVENC
    Nvenc,
    /// Intel QuickSync
    Qsv,
    /// x264 / x265
    Software,
}

impl HardwareEncoderType {
    const PREFERENCE: [HardwareEncoderType; 4] = [
        HardwareEncoderType::VaApi,
        HardwareEncoderType::Nvenc,
        HardwareEncoderType::Qsv,
        HardwareEncoderType::Software,
    ];

    /// Get the GStreamer element name for `codec`
    pub fn encoder_element(&self, codec: VideoCodec) -> &'static str {
        match (self, codec) {
            (HardwareEncoderType::VaApi, VideoCodec::H264) => "vah264enc",
            (HardwareEncoderType::VaApi, VideoCodec::H265) => "vah265enc",
            (HardwareEncoderType::Nvenc, VideoCodec::H264) => "nvh264enc",
            (HardwareEncoderType::Nvenc, VideoCodec::H265) => "nvh265enc",
            (HardwareEncoderType::Qsv, VideoCodec::H264) => "qsvh264enc",
            (HardwareEncoderType::Qsv, VideoCodec::H265) => "qsvh265enc",
            (HardwareEncoderType::Software, VideoCodec::H264) => "x264enc",
            (HardwareEncoderType::Software, VideoCodec::H265) => "x265enc",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            HardwareEncoderType::VaApi => "VA-API",
            HardwareEncoderType::Nvenc => "NVIDIA NVENC",
            HardwareEncoderType::Qsv => "Intel QuickSync",
            HardwareEncoderType::Software => "Software",
        }
    }

    /// Name of the key-frame interval property on this element family
    fn gop_property(&self) -> &'static str {
        match self {
            HardwareEncoderType::Nvenc | HardwareEncoderType::Qsv => "gop-size",
            HardwareEncoderType::VaApi | HardwareEncoderType::Software => "key-int-max",
        }
    }
}

/// Detect the best available encoder for `codec`
pub fn detect_encoder(codec: VideoCodec) -> Option<HardwareEncoderType> {
    HardwareEncoderType::PREFERENCE
        .into_iter()
        .find(|hw| gst::ElementFactory::find(hw.encoder_element(codec)).is_some())
}

fn make_element(name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|e| EncoderError::Pipeline(format!("Failed to create {}: {}", name, e)))
}

/// Property types differ between element families, so values go through
/// their string form. Missing properties are skipped.
fn set_if_present(element: &gst::Element, name: &str, value: &str) {
    if element.has_property(name) {
        element.set_property_from_str(name, value);
    } else {
        log::debug!("{:?} has no '{}' property", element.name(), name);
    }
}

/// Encoder platform backed by GStreamer elements
pub struct GstPlatform {
    device: DeviceInfo,
}

impl GstPlatform {
    pub fn new() -> Result<Self> {
        Self::with_device(DeviceInfo::default())
    }

    /// Platform that reports `device` to the codec selection
    pub fn with_device(device: DeviceInfo) -> Result<Self> {
        if !init_gstreamer() {
            return Err(EncoderError::CodecUnavailable("GStreamer is not available".into()));
        }
        Ok(Self { device })
    }
}

impl EncoderPlatform for GstPlatform {
    fn device(&self) -> DeviceInfo {
        self.device.clone()
    }

    fn supports(&self, codec: VideoCodec) -> bool {
        detect_encoder(codec).is_some()
            && gst::ElementFactory::find(codec.gst_parser()).is_some()
            && gst::ElementFactory::find(codec.container().gst_muxer()).is_some()
    }

    fn create_codec(&self, config: &MediaConfig) -> Result<Box<dyn CodecSession>> {
        let hw_type = detect_encoder(config.codec)
            .ok_or_else(|| EncoderError::CodecUnavailable(format!("no {} encoder element", config.codec)))?;
        log::info!("Using {} {} encoder", hw_type.display_name(), config.codec);
        Ok(Box::new(GstCodecSession::new(hw_type)))
    }

    fn create_writer(&self, path: &Path, container: ContainerFormat) -> Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(GstContainerWriter::new(path, container)))
    }
}

struct CodecPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    video_info: gst_video::VideoInfo,
}

/// One encoder pipeline fed raster by raster
pub struct GstCodecSession {
    hw_type: HardwareEncoderType,
    codec: Option<VideoCodec>,
    frame_rate: u32,
    inner: Option<CodecPipeline>,
    /// First sample, held back until its format has been reported
    pending: Option<gst::Sample>,
    format_reported: bool,
    eos_reported: bool,
    last_pts_us: u64,
}

impl GstCodecSession {
    pub fn new(hw_type: HardwareEncoderType) -> Self {
        Self {
            hw_type,
            codec: None,
            frame_rate: 1,
            inner: None,
            pending: None,
            format_reported: false,
            eos_reported: false,
            last_pts_us: 0,
        }
    }

    fn pipeline(&self) -> Result<&CodecPipeline> {
        self.inner
            .as_ref()
            .ok_or_else(|| EncoderError::InvalidState("codec not configured".into()))
    }

    fn create_encoder(&self, config: &MediaConfig) -> Result<gst::Element> {
        let name = self.hw_type.encoder_element(config.codec);
        let encoder = gst::ElementFactory::make(name)
            .build()
            .map_err(|e| EncoderError::CodecUnavailable(format!("Failed to create {}: {}", name, e)))?;

        // All of these families take kbps
        set_if_present(&encoder, "bitrate", &(config.bit_rate / 1000).max(1).to_string());
        set_if_present(
            &encoder,
            self.hw_type.gop_property(),
            &config.key_frame_interval_frames().to_string(),
        );
        if self.hw_type == HardwareEncoderType::Software {
            set_if_present(&encoder, "tune", "zerolatency");
            set_if_present(&encoder, "speed-preset", "ultrafast");
        }
        Ok(encoder)
    }

    fn track_format(&self, sample: &gst::Sample) -> Result<TrackFormat> {
        let caps = sample
            .caps()
            .ok_or_else(|| EncoderError::Pipeline("encoded sample without caps".into()))?;
        let info = &self.pipeline()?.video_info;
        Ok(TrackFormat {
            codec: self.codec.unwrap_or(VideoCodec::PRIMARY),
            width: info.width(),
            height: info.height(),
            frame_rate: self.frame_rate,
            description: caps.to_string(),
        })
    }

    fn packet(sample: &gst::Sample) -> Result<EncodedPacket> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| EncoderError::Pipeline("encoded sample without buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| EncoderError::Pipeline(format!("Failed to map buffer: {}", e)))?;
        let flags = buffer.flags();
        let data = map.as_slice().to_vec();
        Ok(EncodedPacket {
            size: data.len(),
            data,
            offset: 0,
            pts_us: buffer.pts().map(|t| t.useconds()).unwrap_or(0),
            flags: PacketFlags {
                key_frame: !flags.contains(gst::BufferFlags::DELTA_UNIT),
                codec_config: false,
                end_of_stream: false,
            },
        })
    }

    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline()?.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(EncoderError::Pipeline(format!(
                        "{} ({:?})",
                        err.error(),
                        err.debug()
                    )));
                }
                gst::MessageView::Warning(warn) => {
                    log::warn!("Encoder pipeline warning: {} ({:?})", warn.error(), warn.debug());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl CodecSession for GstCodecSession {
    fn configure(&mut self, config: &MediaConfig) -> Result<()> {
        let pipeline = gst::Pipeline::new();

        let video_info =
            gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, config.width, config.height)
                .fps(gst::Fraction::new(config.frame_rate as i32, 1))
                .build()
                .map_err(|e| EncoderError::Pipeline(format!("Invalid video info: {}", e)))?;
        let raw_caps = video_info
            .to_caps()
            .map_err(|e| EncoderError::Pipeline(format!("Invalid raw caps: {}", e)))?;

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&raw_caps)
            .format(gst::Format::Time)
            .stream_type(gst_app::AppStreamType::Stream)
            .build();

        let videoconvert = make_element("videoconvert")?;
        let encoder = self.create_encoder(config)?;
        let parser = make_element(config.codec.gst_parser())?;

        // The MP4 muxer needs length-prefixed access units with codec data
        let encoded_caps = gst::Caps::builder(config.codec.gst_caps_name())
            .field("stream-format", config.codec.gst_stream_format())
            .field("alignment", "au")
            .build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &encoded_caps)
            .build()
            .map_err(|e| EncoderError::Pipeline(format!("Failed to create capsfilter: {}", e)))?;

        let appsink = gst_app::AppSink::builder().name("sink").sync(false).build();

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &videoconvert,
                &encoder,
                &parser,
                &capsfilter,
                appsink.upcast_ref(),
            ])
            .map_err(|e| EncoderError::Pipeline(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &videoconvert,
            &encoder,
            &parser,
            &capsfilter,
            appsink.upcast_ref(),
        ])
        .map_err(|e| EncoderError::Pipeline(format!("Failed to link elements: {}", e)))?;

        self.codec = Some(config.codec);
        self.frame_rate = config.frame_rate;
        self.inner = Some(CodecPipeline {
            pipeline,
            appsrc,
            appsink,
            video_info,
        });
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.pipeline()?
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to start pipeline: {:?}", e)))?;
        Ok(())
    }

    fn draw_frame(&mut self, frame: &RasterFrame, pts_us: u64) -> Result<()> {
        let inner = self.pipeline()?;
        let info = &inner.video_info;
        if frame.width() != info.width() || frame.height() != info.height() {
            return Err(EncoderError::InvalidState(format!(
                "frame {}x{} does not match surface {}x{}",
                frame.width(),
                frame.height(),
                info.width(),
                info.height()
            )));
        }

        // GStreamer rows are padded to the negotiated stride
        let stride = info.stride()[0] as usize;
        let row_len = frame.width() as usize * 3;
        let mut data = vec![0u8; info.size()];
        for (dst, src) in data
            .chunks_mut(stride)
            .zip(frame.pixels().chunks(row_len))
        {
            dst[..row_len].copy_from_slice(src);
        }

        let mut buffer = gst::Buffer::from_mut_slice(data);
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| EncoderError::Pipeline("buffer is shared".into()))?;
            buffer_ref.set_pts(gst::ClockTime::from_useconds(pts_us));
            buffer_ref.set_duration(gst::ClockTime::from_useconds(
                1_000_000 / self.frame_rate.max(1) as u64,
            ));
        }

        inner
            .appsrc
            .push_buffer(buffer)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to push buffer: {:?}", e)))?;
        Ok(())
    }

    fn signal_end_of_input(&mut self) -> Result<()> {
        self.pipeline()?
            .appsrc
            .end_of_stream()
            .map_err(|e| EncoderError::Pipeline(format!("Failed to send EOS: {:?}", e)))?;
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<OutputStatus> {
        self.check_bus()?;

        if self.format_reported {
            if let Some(sample) = self.pending.take() {
                let packet = Self::packet(&sample)?;
                self.last_pts_us = packet.pts_us;
                return Ok(OutputStatus::Buffer(packet));
            }
        }

        let appsink = self.pipeline()?.appsink.clone();
        let timeout = gst::ClockTime::from_useconds(timeout.as_micros() as u64);
        match appsink.try_pull_sample(timeout) {
            Some(sample) if !self.format_reported => {
                let format = self.track_format(&sample)?;
                self.format_reported = true;
                self.pending = Some(sample);
                Ok(OutputStatus::FormatChanged(format))
            }
            Some(sample) => {
                let packet = Self::packet(&sample)?;
                self.last_pts_us = packet.pts_us;
                Ok(OutputStatus::Buffer(packet))
            }
            None if appsink.is_eos() && !self.eos_reported => {
                self.eos_reported = true;
                Ok(OutputStatus::Buffer(EncodedPacket::end_of_stream(self.last_pts_us)))
            }
            None => Ok(OutputStatus::TryAgainLater),
        }
    }

    fn stop(&mut self) {
        self.pending = None;
        if let Some(inner) = self.inner.take() {
            let _ = inner.pipeline.set_state(gst::State::Null);
        }
    }
}

impl Drop for GstCodecSession {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WriterPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
}

/// MP4 writer fed with already-encoded access units
pub struct GstContainerWriter {
    output_path: PathBuf,
    container: ContainerFormat,
    inner: Option<WriterPipeline>,
}

impl GstContainerWriter {
    pub fn new(path: &Path, container: ContainerFormat) -> Self {
        Self {
            output_path: path.to_path_buf(),
            container,
            inner: None,
        }
    }

    fn pipeline(&self) -> Result<&WriterPipeline> {
        self.inner
            .as_ref()
            .ok_or_else(|| EncoderError::InvalidState("container track not added".into()))
    }
}

impl ContainerWriter for GstContainerWriter {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize> {
        if self.inner.is_some() {
            return Err(EncoderError::InvalidState("only one video track is supported".into()));
        }

        let caps = gst::Caps::from_str(&format.description)
            .map_err(|e| EncoderError::Pipeline(format!("Bad track caps '{}': {}", format.description, e)))?;

        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .build();
        let muxer = make_element(self.container.gst_muxer())?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", self.output_path.to_string_lossy().to_string())
            .property("async", false)
            .property("sync", false)
            .build()
            .map_err(|e| EncoderError::Pipeline(format!("Failed to create filesink: {}", e)))?;

        pipeline
            .add_many([appsrc.upcast_ref(), &muxer, &filesink])
            .map_err(|e| EncoderError::Pipeline(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([appsrc.upcast_ref(), &muxer, &filesink])
            .map_err(|e| EncoderError::Pipeline(format!("Failed to link elements: {}", e)))?;

        log::debug!("Container track added: {}", format.description);
        self.inner = Some(WriterPipeline { pipeline, appsrc });
        Ok(0)
    }

    fn start(&mut self) -> Result<()> {
        self.pipeline()?
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to start writer: {:?}", e)))?;
        Ok(())
    }

    fn write_sample(&mut self, _track: usize, payload: &[u8], info: &SampleInfo) -> Result<()> {
        let mut buffer = gst::Buffer::from_slice(payload.to_vec());
        {
            let buffer_ref = buffer
                .get_mut()
                .ok_or_else(|| EncoderError::Pipeline("buffer is shared".into()))?;
            buffer_ref.set_pts(gst::ClockTime::from_useconds(info.pts_us));
            buffer_ref.set_dts(gst::ClockTime::from_useconds(info.pts_us));
            buffer_ref.set_duration(gst::ClockTime::from_useconds(info.duration_us));
            // The muxer needs this to build the sync sample table
            if !info.key_frame {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        self.pipeline()?
            .appsrc
            .push_buffer(buffer)
            .map_err(|e| EncoderError::Pipeline(format!("Failed to push sample: {:?}", e)))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };

        if let Err(e) = inner.appsrc.end_of_stream() {
            log::warn!("Failed to send EOS to writer: {:?}", e);
        }

        let mut pipeline_error = None;
        if let Some(bus) = inner.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        pipeline_error = Some(format!("{} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }

        // Always set pipeline to NULL before dropping
        let _ = inner.pipeline.set_state(gst::State::Null);

        match pipeline_error {
            Some(err) => Err(EncoderError::Pipeline(err)),
            None => Ok(()),
        }
    }
}

impl Drop for GstContainerWriter {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner.pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_names_follow_codec() {
        assert_eq!(HardwareEncoderType::Software.encoder_element(VideoCodec::H264), "x264enc");
        assert_eq!(HardwareEncoderType::VaApi.encoder_element(VideoCodec::H265), "vah265enc");
        assert_eq!(HardwareEncoderType::Nvenc.gop_property(), "gop-size");
        assert_eq!(HardwareEncoderType::Software.gop_property(), "key-int-max");
    }

    #[test]
    fn writer_requires_a_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = GstContainerWriter::new(&dir.path().join("a.mp4"), ContainerFormat::Mp4);
        assert!(writer.start().is_err());
        // Finishing without a track is a no-op
        assert!(writer.finish().is_ok());
    }
}
