//! Camera abstraction.
//!
//! A [`FrameSource`] owns one physical (or simulated) camera. `start` hands
//! back a [`FrameStream`]: the receiving end of a bounded frame channel plus a
//! [`CameraLease`] that releases the device when dropped, so the camera is
//! returned even if the consumer stops reading halfway through.

pub mod mjpeg;
pub mod replay;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use image::imageops::{self, FilterType};
use image::GrayImage;
use qrscan_common::config::{MAX_FPS, MIN_FPS};
use qrscan_common::frame::{Frame, FrameError, Orientation, PixelFormat, Resolution};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{info, warn};

pub use mjpeg::MjpegSource;
pub use replay::{ReplayClock, ReplaySource};

/// Optional camera features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    OppositeCamera,
    Torch,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::OppositeCamera => f.write_str("opposite camera"),
            Capability::Torch => f.write_str("torch"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub opposite_camera: bool,
    pub torch: bool,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::OppositeCamera => self.opposite_camera,
            Capability::Torch => self.torch,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

impl CameraFacing {
    pub fn opposite(self) -> Self {
        match self {
            CameraFacing::Back => CameraFacing::Front,
            CameraFacing::Front => CameraFacing::Back,
        }
    }
}

/// Parameters for one capture run.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub fps: f64,
    /// Capacity of the source → session frame channel.
    pub buffer: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 10.0,
            buffer: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera lost: {0}")]
    DeviceLost(String),
    #[error("camera does not support {0}")]
    CapabilityUnsupported(Capability),
}

/// Period between frames at `fps`. Rates outside `MIN_FPS..=MAX_FPS` (NaN
/// and infinity included) leave no usable period and are rejected.
pub fn frame_interval(fps: f64) -> Result<Duration, SourceError> {
    let invalid = || SourceError::DeviceUnavailable(format!("invalid frame rate {fps}"));
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
        return Err(invalid());
    }
    match Duration::try_from_secs_f64(1.0 / fps) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(invalid()),
    }
}

/// A camera producing frames asynchronously.
///
/// Settings changes (`set_orientation`, `set_resolution`, `flip_camera`,
/// `toggle_torch`) are picked up by the producer on the next frame.
pub trait FrameSource: Send + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }

    /// Resolves camera access. The returned future owns everything it needs,
    /// so callers can await it without holding any lock.
    fn authorize(&self) -> BoxFuture<'static, Result<(), SourceError>>;

    /// Acquires the camera and starts producing frames.
    fn start(&mut self, config: &CaptureConfig) -> Result<FrameStream, SourceError>;

    /// Stops the producer and releases the camera. Idempotent.
    fn stop(&mut self);

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn facing(&self) -> CameraFacing {
        CameraFacing::Back
    }

    fn torch_on(&self) -> bool {
        false
    }

    fn flip_camera(&mut self) -> Result<CameraFacing, SourceError> {
        Err(SourceError::CapabilityUnsupported(Capability::OppositeCamera))
    }

    fn toggle_torch(&mut self) -> Result<bool, SourceError> {
        Err(SourceError::CapabilityUnsupported(Capability::Torch))
    }

    fn set_orientation(&mut self, orientation: Orientation);

    fn set_resolution(&mut self, resolution: Option<Resolution>);
}

// =============================================================================
// Device bookkeeping
// =============================================================================

#[derive(Debug, Default)]
struct DeviceInner {
    acquired: bool,
    generation: u64,
    acquisitions: u32,
    releases: u32,
}

/// Acquisition state of one camera device.
///
/// Every acquisition gets a fresh generation number; a release only takes
/// effect for the generation that is currently held, so a stale lease can
/// never release a later acquisition.
#[derive(Debug, Default)]
pub struct DeviceState {
    inner: Mutex<DeviceInner>,
}

impl DeviceState {
    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_acquired(&self) -> bool {
        self.lock().acquired
    }

    pub fn acquisitions(&self) -> u32 {
        self.lock().acquisitions
    }

    pub fn releases(&self) -> u32 {
        self.lock().releases
    }

    fn acquire(&self, source: &str) -> Result<u64, SourceError> {
        let mut inner = self.lock();
        if inner.acquired {
            return Err(SourceError::DeviceUnavailable(format!(
                "{source} camera is already in use"
            )));
        }
        inner.acquired = true;
        inner.generation += 1;
        inner.acquisitions += 1;
        info!(source, generation = inner.generation, "camera acquired");
        Ok(inner.generation)
    }

    fn release(&self, source: &str, generation: u64) {
        let mut inner = self.lock();
        if inner.acquired && inner.generation == generation {
            inner.acquired = false;
            inner.releases += 1;
            info!(source, generation, "camera released");
        }
    }

    fn release_current(&self, source: &str) {
        let generation = self.lock().generation;
        self.release(source, generation);
    }
}

/// Scoped hold on a camera. Dropping it stops the producer task and
/// releases the device.
#[derive(Debug)]
pub struct CameraLease {
    device: Arc<DeviceState>,
    generation: u64,
    producer: AbortHandle,
    source: String,
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.producer.abort();
        self.device.release(&self.source, self.generation);
    }
}

pub type FrameResult = Result<Frame, SourceError>;

/// Frames from a running camera. The camera stays acquired for as long as
/// the stream is alive.
#[derive(Debug)]
pub struct FrameStream {
    rx: mpsc::Receiver<FrameResult>,
    lease: CameraLease,
}

impl FrameStream {
    /// Acquire `device` and spawn `producer` to feed a channel of `buffer` frames.
    fn spawn<F, Fut>(
        device: &Arc<DeviceState>,
        source: &str,
        buffer: usize,
        producer: F,
    ) -> Result<Self, SourceError>
    where
        F: FnOnce(mpsc::Sender<FrameResult>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = device.acquire(source)?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(producer(tx));
        Ok(Self {
            rx,
            lease: CameraLease {
                device: Arc::clone(device),
                generation,
                producer: handle.abort_handle(),
                source: source.to_string(),
            },
        })
    }

    /// Next frame, or `None` once the producer has gone away.
    pub async fn next(&mut self) -> Option<FrameResult> {
        self.rx.recv().await
    }

    fn abort_handle(&self) -> AbortHandle {
        self.lease.producer.clone()
    }
}

// =============================================================================
// Live capture settings
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct LiveSettings {
    orientation: Orientation,
    resolution: Option<Resolution>,
    facing: CameraFacing,
    torch: bool,
}

/// Settings shared between a source and its producer task.
#[derive(Debug, Clone, Default)]
struct SettingsHandle(Arc<Mutex<LiveSettings>>);

impl SettingsHandle {
    fn snapshot(&self) -> LiveSettings {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<R>(&self, f: impl FnOnce(&mut LiveSettings) -> R) -> R {
        let mut settings = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut settings)
    }

    fn set_orientation(&self, orientation: Orientation) {
        self.update(|s| s.orientation = orientation);
    }

    fn set_resolution(&self, resolution: Option<Resolution>) {
        if let Some(res) = resolution {
            if res.width == 0 || res.height == 0 {
                warn!(
                    width = res.width,
                    height = res.height,
                    "ignoring empty resolution request"
                );
                return;
            }
        }
        self.update(|s| s.resolution = resolution);
    }

    /// Build the next frame from a template frame. Luma templates are resized
    /// and mirrored as the settings require; other formats are only restamped.
    fn render(&self, template: &Frame, captured_at_ms: i64, seq: u64) -> Result<Frame, FrameError> {
        let settings = self.snapshot();
        if template.format() != PixelFormat::Luma8 || !settings.needs_pixels(template) {
            return Ok(template
                .restamped(captured_at_ms, seq)
                .with_orientation(settings.orientation));
        }
        let image = GrayImage::from_raw(template.width(), template.height(), template.data().to_vec())
            .ok_or(FrameError::BufferSize {
                got: template.data().len(),
                expected: PixelFormat::Luma8.buffer_len(template.width(), template.height()),
            })?;
        settings.frame_from(image, captured_at_ms, seq)
    }

    fn frame_from_image(&self, image: GrayImage, captured_at_ms: i64, seq: u64) -> Result<Frame, FrameError> {
        self.snapshot().frame_from(image, captured_at_ms, seq)
    }
}

impl LiveSettings {
    fn needs_pixels(&self, template: &Frame) -> bool {
        let resize = self
            .resolution
            .is_some_and(|r| (r.width, r.height) != (template.width(), template.height()));
        resize || self.facing == CameraFacing::Front
    }

    fn frame_from(&self, mut image: GrayImage, captured_at_ms: i64, seq: u64) -> Result<Frame, FrameError> {
        if let Some(res) = self.resolution {
            if image.dimensions() != (res.width, res.height) {
                image = imageops::resize(&image, res.width, res.height, FilterType::Nearest);
            }
        }
        // Front cameras deliver a mirrored preview.
        if self.facing == CameraFacing::Front {
            imageops::flip_horizontal_in_place(&mut image);
        }
        let (width, height) = image.dimensions();
        Ok(Frame::luma8(image.into_raw(), width, height, captured_at_ms, seq)?
            .with_orientation(self.orientation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_does_not_release() {
        let device = DeviceState::default();
        let first = device.acquire("test").unwrap();
        device.release_current("test");
        let second = device.acquire("test").unwrap();
        assert_ne!(first, second);

        device.release("test", first);
        assert!(device.is_acquired(), "stale lease must not release new acquisition");

        device.release("test", second);
        assert!(!device.is_acquired());
        assert_eq!(device.acquisitions(), 2);
        assert_eq!(device.releases(), 2);
    }

    #[test]
    fn double_acquire_is_unavailable() {
        let device = DeviceState::default();
        device.acquire("test").unwrap();
        assert!(matches!(
            device.acquire("test"),
            Err(SourceError::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn dropping_stream_releases_device() {
        let device = Arc::new(DeviceState::default());
        let stream = FrameStream::spawn(&device, "test", 1, |_tx| async {
            std::future::pending::<()>().await;
        })
        .unwrap();
        assert!(device.is_acquired());
        drop(stream);
        assert!(!device.is_acquired());
        assert_eq!(device.releases(), 1);
    }

    #[test]
    fn render_resizes_and_mirrors() {
        let template = Frame::luma8(vec![0u8, 255, 0, 255], 2, 2, 0, 0).unwrap();
        let settings = SettingsHandle::default();
        settings.update(|s| s.facing = CameraFacing::Front);
        settings.set_orientation(Orientation::Deg270);

        let mirrored = settings.render(&template, 5, 1).unwrap();
        assert_eq!(mirrored.data(), &[255, 0, 255, 0]);
        assert_eq!(mirrored.orientation(), Orientation::Deg270);
        assert_eq!(mirrored.captured_at_ms(), 5);

        settings.set_resolution(Some(Resolution {
            width: 4,
            height: 4,
        }));
        let resized = settings.render(&template, 6, 2).unwrap();
        assert_eq!((resized.width(), resized.height()), (4, 4));
    }

    #[test]
    fn frame_interval_rejects_unusable_rates() {
        assert_eq!(frame_interval(4.0), Ok(Duration::from_millis(250)));
        assert_eq!(frame_interval(0.5), Ok(Duration::from_secs(2)));
        for fps in [0.0, -5.0, 1e-30, f64::INFINITY, f64::NAN, 1e6] {
            assert!(
                matches!(frame_interval(fps), Err(SourceError::DeviceUnavailable(_))),
                "fps = {fps}"
            );
        }
    }

    #[test]
    fn empty_resolution_ignored() {
        let settings = SettingsHandle::default();
        settings.set_resolution(Some(Resolution {
            width: 0,
            height: 480,
        }));
        assert!(settings.snapshot().resolution.is_none());
    }
}
