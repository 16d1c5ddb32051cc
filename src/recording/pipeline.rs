// Frame pipeline orchestration
//
// The camera producer pushes raw frames through `on_raw_frame`; each one is
// converted, rotated/scaled and appended to the active session's frame
// store. A coordinator thread calls `stop_and_encode`, which detaches the
// store in one swap of the active slot and encodes the snapshot on a worker
// thread under a deadline. The store is released on every exit path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;

use super::frame_store::{FrameRingStore, StoreError};
use crate::config::Config;
use crate::encoding::{
    encode_with_fallback, CancelFlag, ContainerFormat, EncodeOutcome, EncodeRequest, EncoderError,
    EncoderPlatform, VideoCodec,
};
use crate::frame::{self, scale_to_fit, PixelFormatConverter, RasterFrame, RawFrame};

/// How long a cancelled encode may take to wind down before we stop waiting
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Session '{requested}' conflicts with active session '{active}'")]
    SessionConflict { active: String, requested: String },

    #[error("Encoding did not finish within {0:?}")]
    Timeout(Duration),

    #[error("No active session")]
    NoSession,

    #[error("Session '{0}' has no frames to encode")]
    NoFrames(String),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Frame store error: {0}")]
    Store(#[from] StoreError),

    #[error("Encoder worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A finished clip handed to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVideo {
    pub path: PathBuf,
    pub codec: VideoCodec,
    pub frame_count: u64,
    pub duration_ms: u64,
    pub size_bytes: u64,
}

/// Marks an encode as in flight until dropped by whoever finishes it last
struct InFlight(Arc<Mutex<Option<String>>>);

impl InFlight {
    fn begin(slot: &Arc<Mutex<Option<String>>>, key: &str) -> Self {
        *slot.lock() = Some(key.to_string());
        Self(slot.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Rolling capture and on-demand encode for one camera stream
pub struct FramePipeline {
    config: Config,
    platform: Arc<dyn EncoderPlatform>,
    /// Store of the recording session, if any. Swapped out to detach it.
    active: Mutex<Option<FrameRingStore>>,
    /// Bumped under the `active` lock by every `start_session`
    generation: AtomicU64,
    converter: Mutex<PixelFormatConverter>,
    /// Once set, every encode goes straight to the fallback codec
    sticky_fallback: Arc<AtomicBool>,
    /// Key of the session currently being encoded
    encoding: Arc<Mutex<Option<String>>>,
}

impl FramePipeline {
    pub fn new(config: Config, platform: Arc<dyn EncoderPlatform>) -> Self {
        Self {
            config,
            platform,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            converter: Mutex::new(PixelFormatConverter::new()),
            sticky_fallback: Arc::new(AtomicBool::new(false)),
            encoding: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Begin buffering frames for `key`.
    ///
    /// Restarting the active key replaces its store with a fresh one. Any
    /// other key is rejected while a session is recording or encoding.
    pub fn start_session(&self, key: &str) -> Result<()> {
        let mut active = self.active.lock();
        let busy = match (active.as_ref(), self.encoding.lock().as_ref()) {
            (Some(store), _) if store.key() != key => Some(store.key().to_string()),
            (_, Some(encoding)) => Some(encoding.clone()),
            _ => None,
        };
        if let Some(busy) = busy {
            return Err(PipelineError::SessionConflict {
                active: busy,
                requested: key.to_string(),
            });
        }
        if let Some(mut stale) = active.take() {
            log::debug!("Restarting session '{}', releasing its old frames", key);
            stale.release();
        }

        let store = FrameRingStore::new(
            &self.config.scratch_root,
            key,
            self.config.window_ms,
            self.config.jpeg_quality,
        )?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        *active = Some(store);
        log::info!("Session '{}' started ({}ms window)", key, self.config.window_ms);
        Ok(())
    }

    /// Feed one camera frame. Never fails: frames that cannot be converted
    /// or stored are logged and dropped.
    pub fn on_raw_frame(&self, frame: &RawFrame<'_>) {
        let Some(generation) = self.session_generation() else {
            log::trace!("No active session, ignoring frame");
            return;
        };

        let raster = match self.prepare(frame) {
            Ok(raster) => raster,
            Err(e) => {
                log::warn!("Dropping frame: {}", e);
                return;
            }
        };

        self.append_to_session(generation, &raster);
    }

    /// Generation of the recording session, if one is active
    fn session_generation(&self) -> Option<u64> {
        let active = self.active.lock();
        active.as_ref().map(|_| self.generation.load(Ordering::Acquire))
    }

    /// Append `raster` if the session it was captured for is still the
    /// active one; returns whether it was stored
    fn append_to_session(&self, generation: u64, raster: &RasterFrame) -> bool {
        let mut active = self.active.lock();
        let Some(store) = active.as_mut() else {
            log::debug!("Session closed during conversion, dropping frame");
            return false;
        };
        if self.generation.load(Ordering::Acquire) != generation {
            log::debug!("Frame belongs to an earlier session, not storing it in '{}'", store.key());
            return false;
        }
        match store.append(raster) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to store frame for '{}': {}", store.key(), e);
                false
            }
        }
    }

    /// Convert, rotate, and scale down to the configured maximum
    fn prepare(&self, raw: &RawFrame<'_>) -> frame::Result<RasterFrame> {
        let raster = self.converter.lock().convert(raw)?;

        let quarter_turns = (raw.rotation_degrees as f32 / 90.0).round() as i32;
        let (width, height) = if quarter_turns.rem_euclid(2) == 1 {
            (raster.height(), raster.width())
        } else {
            (raster.width(), raster.height())
        };
        let scale = scale_to_fit(width, height, self.config.max_resolution);

        Ok(frame::transform(raster, raw.rotation_degrees, scale))
    }

    /// Stop the session and encode its window into `output_dir/video_<key>.mp4`.
    ///
    /// The session's frames are released whatever the outcome.
    pub fn try_stop_and_encode(&self, timeout: Duration) -> Result<EncodedVideo> {
        // Detach first so the producer can no longer touch the store
        let (mut store, in_flight) = {
            let mut active = self.active.lock();
            let store = active.take().ok_or(PipelineError::NoSession)?;
            let in_flight = InFlight::begin(&self.encoding, store.key());
            (store, in_flight)
        };

        let result = self.encode_store(&store, timeout, in_flight);
        if store.release() {
            log::debug!("Frames of session '{}' released", store.key());
        }
        result
    }

    /// Like [`Self::try_stop_and_encode`], logging failures and returning `None`
    pub fn stop_and_encode(&self, timeout: Duration) -> Option<EncodedVideo> {
        match self.try_stop_and_encode(timeout) {
            Ok(video) => Some(video),
            Err(PipelineError::NoSession) => {
                log::debug!("stop_and_encode without an active session");
                None
            }
            Err(PipelineError::NoFrames(key)) => {
                log::info!("Session '{}' captured no frames, nothing to encode", key);
                None
            }
            Err(e) => {
                log::error!("Failed to encode video: {}", e);
                None
            }
        }
    }

    /// [`Self::stop_and_encode`] bounded by the configured encode timeout
    pub fn stop_and_encode_default(&self) -> Option<EncodedVideo> {
        self.stop_and_encode(self.config.encode_timeout())
    }

    fn encode_store(
        &self,
        store: &FrameRingStore,
        timeout: Duration,
        in_flight: InFlight,
    ) -> Result<EncodedVideo> {
        let key = store.key().to_string();
        let frames = store.frames();
        if frames.is_empty() {
            return Err(PipelineError::NoFrames(key));
        }

        let frame_rate = store.fps().unwrap_or_else(|| {
            log::debug!(
                "Too few frames to measure a rate, using {}fps",
                self.config.default_frame_rate
            );
            self.config.default_frame_rate
        });
        let request = EncodeRequest {
            // 4:2:0 encoders need even dimensions
            width: (store.width() & !1).max(2),
            height: (store.height() & !1).max(2),
            bit_rate: self.config.bit_rate,
            frame_rate,
            frames,
        };
        let destination = self.config.output_dir.join(format!(
            "video_{}.{}",
            key,
            ContainerFormat::Mp4.extension()
        ));
        log::info!(
            "Encoding {} frames of '{}' at {}x{} @ {}fps",
            request.frames.len(),
            key,
            request.width,
            request.height,
            request.frame_rate
        );

        let cancel = CancelFlag::new();
        let (tx, rx) = bounded(1);
        let worker = {
            let platform = self.platform.clone();
            let sticky = self.sticky_fallback.clone();
            let cancel = cancel.clone();
            let destination = destination.clone();
            std::thread::Builder::new()
                .name("grabber-encoder".into())
                .spawn(move || {
                    let _in_flight = in_flight;
                    let result =
                        encode_with_fallback(platform.as_ref(), &request, &destination, &sticky, &cancel);
                    let result = match result {
                        // Finished after the coordinator gave up; nobody will claim it
                        Ok(outcome) if cancel.is_cancelled() => {
                            remove_output(&outcome.path);
                            Err(EncoderError::Cancelled)
                        }
                        other => other,
                    };
                    let _ = tx.send(result);
                })
                .map_err(|e| PipelineError::Worker(e.to_string()))?
        };

        match rx.recv_timeout(timeout) {
            Ok(Ok(outcome)) => {
                let _ = worker.join();
                Ok(encoded_video(outcome))
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e.into())
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Encoding '{}' exceeded {:?}, cancelling", key, timeout);
                cancel.cancel();
                match rx.recv_timeout(CANCEL_GRACE) {
                    Ok(_) => {
                        let _ = worker.join();
                    }
                    Err(_) => log::warn!("Encoder worker for '{}' is still winding down", key),
                }
                remove_output(&destination);
                Err(PipelineError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                remove_output(&destination);
                Err(PipelineError::Worker("encoder thread exited without a result".into()))
            }
        }
    }

    /// Drop the active session without encoding; returns whether one existed
    pub fn discard(&self) -> bool {
        match self.active.lock().take() {
            Some(mut store) => {
                log::info!("Discarding session '{}'", store.key());
                store.release();
                true
            }
            None => false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn active_key(&self) -> Option<String> {
        self.active.lock().as_ref().map(|store| store.key().to_string())
    }

    /// Number of frames in the active session's window
    pub fn buffered_frames(&self) -> usize {
        self.active.lock().as_ref().map_or(0, |store| store.len())
    }

    /// Whether an encode is running on the worker thread
    pub fn is_encoding(&self) -> bool {
        self.encoding.lock().is_some()
    }

    /// Whether the fallback codec has been made sticky
    pub fn uses_fallback_codec(&self) -> bool {
        self.sticky_fallback.load(Ordering::Acquire)
    }
}

fn encoded_video(outcome: EncodeOutcome) -> EncodedVideo {
    let size_bytes = std::fs::metadata(&outcome.path).map(|m| m.len()).unwrap_or(0);
    EncodedVideo {
        path: outcome.path,
        codec: outcome.codec,
        frame_count: outcome.stats.frames_submitted,
        duration_ms: outcome.stats.duration_us / 1000,
        size_bytes,
    }
}

fn remove_output(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed abandoned output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}
