use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use qrscan_common::frame::{Frame, Orientation, Resolution};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{
    frame_interval, CameraFacing, Capabilities, Capability, CaptureConfig, DeviceState,
    FrameResult, FrameSource, FrameStream, SettingsHandle, SourceError,
};

/// Where replayed frames get their capture timestamps from.
#[derive(Debug, Clone, Copy)]
pub enum ReplayClock {
    /// Unix millis at the moment each frame is emitted.
    WallClock,
    /// `start_ms + seq * step_ms`, independent of real time.
    Synthetic { start_ms: i64, step_ms: i64 },
}

impl ReplayClock {
    fn timestamp(self, seq: u64) -> i64 {
        match self {
            ReplayClock::WallClock => Utc::now().timestamp_millis(),
            ReplayClock::Synthetic { start_ms, step_ms } => start_ms + seq as i64 * step_ms,
        }
    }
}

/// Replays a fixed set of frames as if they came from a camera.
///
/// Used for offline scanning of still images and for exercising sessions
/// with scripted permission outcomes, capabilities, and device failures.
pub struct ReplaySource {
    frames: Arc<[Frame]>,
    looping: bool,
    clock: ReplayClock,
    permission_denied: bool,
    permission_delay: Option<Duration>,
    available: bool,
    capabilities: Capabilities,
    fail_after: Option<u64>,
    device: Arc<DeviceState>,
    settings: SettingsHandle,
    producer: Option<AbortHandle>,
}

impl ReplaySource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            looping: false,
            clock: ReplayClock::WallClock,
            permission_denied: false,
            permission_delay: None,
            available: true,
            capabilities: Capabilities::default(),
            fail_after: None,
            device: Arc::new(DeviceState::default()),
            settings: SettingsHandle::default(),
            producer: None,
        }
    }

    /// Load still images from disk as grayscale replay frames.
    pub fn from_images<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SourceError> {
        let mut frames = Vec::with_capacity(paths.len());
        for (seq, path) in paths.iter().enumerate() {
            let path = path.as_ref();
            let image = image::open(path)
                .map_err(|e| {
                    SourceError::DeviceUnavailable(format!("failed to load {}: {e}", path.display()))
                })?
                .to_luma8();
            let (width, height) = image.dimensions();
            let frame = Frame::luma8(image.into_raw(), width, height, 0, seq as u64)
                .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;
            debug!(path = %path.display(), width, height, "loaded replay image");
            frames.push(frame);
        }
        Ok(Self::new(frames))
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn clock(mut self, clock: ReplayClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn deny_permission(mut self) -> Self {
        self.permission_denied = true;
        self
    }

    /// Resolve the permission check only after `delay`, like a pending prompt.
    pub fn permission_delay(mut self, delay: Duration) -> Self {
        self.permission_delay = Some(delay);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_opposite_camera(mut self) -> Self {
        self.capabilities.opposite_camera = true;
        self
    }

    pub fn with_torch(mut self) -> Self {
        self.capabilities.torch = true;
        self
    }

    /// Report the device as lost after `frames` frames have been produced.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Shared handle to the device bookkeeping, for observing acquire/release.
    pub fn device(&self) -> Arc<DeviceState> {
        Arc::clone(&self.device)
    }
}

impl FrameSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    fn authorize(&self) -> BoxFuture<'static, Result<(), SourceError>> {
        let denied = self.permission_denied;
        let delay = self.permission_delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if denied {
                Err(SourceError::PermissionDenied)
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    fn start(&mut self, config: &CaptureConfig) -> Result<FrameStream, SourceError> {
        if self.permission_denied {
            return Err(SourceError::PermissionDenied);
        }
        if !self.available {
            return Err(SourceError::DeviceUnavailable(
                "replay device is unavailable".into(),
            ));
        }
        if self.frames.is_empty() {
            return Err(SourceError::DeviceUnavailable("no frames to replay".into()));
        }
        let interval = frame_interval(config.fps)?;

        let job = ReplayJob {
            frames: Arc::clone(&self.frames),
            looping: self.looping,
            clock: self.clock,
            fail_after: self.fail_after,
            interval,
            settings: self.settings.clone(),
        };
        info!(
            frames = self.frames.len(),
            fps = config.fps,
            looping = self.looping,
            "starting replay source"
        );
        let stream = FrameStream::spawn(&self.device, self.name(), config.buffer, move |tx| {
            job.run(tx)
        })?;
        self.producer = Some(stream.abort_handle());
        Ok(stream)
    }

    fn stop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        self.device.release_current("replay");
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn facing(&self) -> CameraFacing {
        self.settings.snapshot().facing
    }

    fn torch_on(&self) -> bool {
        self.settings.snapshot().torch
    }

    fn flip_camera(&mut self) -> Result<CameraFacing, SourceError> {
        if !self.capabilities.opposite_camera {
            return Err(SourceError::CapabilityUnsupported(
                Capability::OppositeCamera,
            ));
        }
        let facing = self.settings.update(|s| {
            s.facing = s.facing.opposite();
            s.facing
        });
        info!(?facing, "replay camera flipped");
        Ok(facing)
    }

    fn toggle_torch(&mut self) -> Result<bool, SourceError> {
        if !self.capabilities.torch {
            return Err(SourceError::CapabilityUnsupported(Capability::Torch));
        }
        let on = self.settings.update(|s| {
            s.torch = !s.torch;
            s.torch
        });
        info!(on, "replay torch toggled");
        Ok(on)
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        self.settings.set_orientation(orientation);
    }

    fn set_resolution(&mut self, resolution: Option<Resolution>) {
        self.settings.set_resolution(resolution);
    }
}

struct ReplayJob {
    frames: Arc<[Frame]>,
    looping: bool,
    clock: ReplayClock,
    fail_after: Option<u64>,
    interval: Duration,
    settings: SettingsHandle,
}

impl ReplayJob {
    async fn run(self, tx: mpsc::Sender<FrameResult>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let len = self.frames.len() as u64;
        let mut seq: u64 = 0;

        loop {
            ticker.tick().await;

            if self.fail_after.is_some_and(|limit| seq >= limit) {
                warn!(seq, "replay device failure");
                let _ = tx
                    .send(Err(SourceError::DeviceLost("scripted device failure".into())))
                    .await;
                return;
            }
            if !self.looping && seq >= len {
                break;
            }

            let template = &self.frames[(seq % len) as usize];
            let ts = self.clock.timestamp(seq);
            match self.settings.render(template, ts, seq) {
                Ok(frame) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        debug!(seq, "frame receiver gone, stopping replay");
                        return;
                    }
                }
                Err(e) => warn!(error = %e, seq, "failed to render replay frame, skipping"),
            }
            seq += 1;
        }

        debug!(frames = seq, "replay exhausted, holding camera open");
        // An exhausted replay behaves like a camera pointed at nothing new.
        std::future::pending::<()>().await;
    }
}
