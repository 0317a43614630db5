//! Scan session state machine.
//!
//! ```text
//!  Idle ──start──▶ Starting ──first frame──▶ Running ◀──resume── Paused
//!   ▲                 │                         │ ──────pause──────▶ │
//!   │                 └────────────┬────────────┴────────────────────┘
//!   └──────────── Stopping ◀──stop─┘
//!
//!  any state ──device error──▶ Failed ──reset──▶ Idle
//! ```
//!
//! Control calls are serialized by an async mutex, so transitions never
//! overlap. The frame path (pump task and decode worker) only touches the
//! small `Core` under a plain mutex and never takes the control lock.
//! Frame-path callbacks carry an epoch number instead of a reference to the
//! session; a bump of the epoch on stop/reset invalidates everything still
//! in flight from the previous run.

pub mod state;


use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use qrscan_common::config::Config;
use qrscan_common::frame::{Orientation, Resolution};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::decoder::Decoder;
use crate::dedup::{ResultDeduplicator, Verdict, DEFAULT_COOLDOWN};
use crate::error::ScanError;
use crate::scheduler::{DecodeBatch, DecodeSink, ScanScheduler, SchedulerStats};
use crate::source::{CameraFacing, Capability, CaptureConfig, FrameSource, FrameStream, SourceError};

pub use state::{FailureReason, ScanSessionState, SessionEvent, Viewport};

/// Runtime knobs for a session.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub cooldown: Duration,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
    pub capture: CaptureConfig,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            event_capacity: 64,
            capture: CaptureConfig::default(),
        }
    }
}

impl ScanSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cooldown: Duration::from_millis(config.scan.cooldown_ms),
            event_capacity: config.scan.event_capacity,
            capture: CaptureConfig {
                fps: config.source.fps,
                buffer: config.scan.frame_buffer,
            },
        }
    }
}

struct Core {
    state: ScanSessionState,
    epoch: u64,
    dedup: ResultDeduplicator,
    viewport: Viewport,
}

struct Shared {
    core: Mutex<Core>,
    events: broadcast::Sender<SessionEvent>,
    state_tx: watch::Sender<ScanSessionState>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, core: &mut Core, next: ScanSessionState) {
        info!(
            epoch = core.epoch,
            "{}→{}",
            core.state.label(),
            next.label()
        );
        core.state = next.clone();
        self.state_tx.send_replace(next);
    }

    fn fail(&self, core: &mut Core, reason: FailureReason) {
        error!(%reason, epoch = core.epoch, "scan session failed");
        self.transition(core, ScanSessionState::Failed(reason.clone()));
        let _ = self.events.send(SessionEvent::Failed(reason));
    }
}

/// Decode results for one run of the session, identified by its epoch.
struct SessionSink {
    shared: Arc<Shared>,
    epoch: u64,
}

impl DecodeSink for SessionSink {
    fn deliver(&self, batch: DecodeBatch) {
        let mut core = self.shared.core();
        if core.epoch != self.epoch || core.state != ScanSessionState::Running {
            debug!(
                seq = batch.frame_seq,
                state = core.state.label(),
                "discarding decode result"
            );
            return;
        }
        for symbol in batch.symbols {
            match core.dedup.filter(&symbol) {
                Verdict::Emit => {
                    info!(
                        text = symbol.text,
                        format = %symbol.format,
                        seq = batch.frame_seq,
                        ts = batch.captured_at_ms,
                        "symbol detected"
                    );
                    let _ = self.shared.events.send(SessionEvent::Symbol(symbol));
                }
                Verdict::Suppress => {}
            }
        }
    }
}

/// Forward frames from the camera to the scheduler until the stream ends,
/// the device fails, or the epoch moves on.
async fn pump_frames(
    shared: Arc<Shared>,
    scheduler: Arc<ScanScheduler>,
    mut stream: FrameStream,
    epoch: u64,
) {
    let mut received: u64 = 0;
    let failure = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break FailureReason::from(e),
            None => break FailureReason::DeviceLost("frame source closed".into()),
        };
        received += 1;
        if received % 100 == 0 {
            debug!(received, "frames received");
        }

        let mut core = shared.core();
        if core.epoch != epoch {
            return;
        }
        match core.state {
            ScanSessionState::Starting => {
                shared.transition(&mut core, ScanSessionState::Running);
                scheduler.submit(frame);
            }
            ScanSessionState::Running => {
                scheduler.submit(frame);
            }
            // Paused: the camera keeps running, frames are not decoded.
            _ => {}
        }
    };

    // Release the camera before anyone can observe the failed state.
    drop(stream);
    scheduler.close();

    let mut core = shared.core();
    if core.epoch == epoch && !core.state.is_failed() {
        shared.fail(&mut core, failure);
    }
}

struct Pipeline {
    scheduler: Arc<ScanScheduler>,
    pump: JoinHandle<()>,
}

impl Pipeline {
    /// Stop the pump (dropping the frame stream releases the camera), then
    /// wait for the in-flight decode, if any.
    async fn teardown(self) {
        self.pump.abort();
        if let Err(e) = self.pump.await {
            if !e.is_cancelled() {
                warn!(error = %e, "frame pump ended abnormally");
            }
        }
        self.scheduler.shutdown().await;
    }
}

struct Control<S> {
    source: S,
    pipeline: Option<Pipeline>,
}

fn invalid(state: &ScanSessionState, operation: &'static str) -> ScanError {
    ScanError::InvalidStateTransition {
        state: state.clone(),
        operation,
    }
}

/// A barcode scanning session over one camera.
pub struct ScanSession<S: FrameSource> {
    shared: Arc<Shared>,
    control: AsyncMutex<Control<S>>,
    decoder: Arc<dyn Decoder>,
    capture: CaptureConfig,
}

impl<S: FrameSource> ScanSession<S> {
    pub fn new(source: S, decoder: Arc<dyn Decoder>, settings: ScanSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (state_tx, _) = watch::channel(ScanSessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: ScanSessionState::Idle,
                    epoch: 0,
                    dedup: ResultDeduplicator::new(settings.cooldown),
                    viewport: Viewport::default(),
                }),
                events,
                state_tx,
            }),
            control: AsyncMutex::new(Control {
                source,
                pipeline: None,
            }),
            decoder,
            capture: settings.capture,
        }
    }

    /// Stream of emitted symbols and terminal failures.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ScanSessionState {
        self.shared.core().state.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ScanSessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Acquire the camera and begin scanning.
    ///
    /// The permission check is awaited without holding the control lock, so
    /// `stop()` can always get in; if it does, this returns
    /// [`ScanError::Interrupted`].
    pub async fn start(&self) -> Result<(), ScanError> {
        let (epoch, authorization) = {
            let control = self.control.lock().await;
            let mut core = self.shared.core();
            if core.state != ScanSessionState::Idle {
                return Err(invalid(&core.state, "start"));
            }
            core.epoch += 1;
            info!(
                source = control.source.name(),
                decoder = self.decoder.name(),
                epoch = core.epoch,
                "starting scan session"
            );
            self.shared.transition(&mut core, ScanSessionState::Starting);
            (core.epoch, control.source.authorize())
        };

        let authorized = authorization.await;

        let mut control = self.control.lock().await;
        {
            let core = self.shared.core();
            if core.epoch != epoch || core.state != ScanSessionState::Starting {
                debug!(epoch, state = core.state.label(), "start superseded");
                return Err(ScanError::Interrupted);
            }
        }
        if let Err(e) = authorized {
            return Err(self.fail_start(&mut control.source, epoch, e));
        }
        let stream = match control.source.start(&self.capture) {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail_start(&mut control.source, epoch, e)),
        };

        let sink = Arc::new(SessionSink {
            shared: Arc::clone(&self.shared),
            epoch,
        });
        let scheduler = Arc::new(ScanScheduler::spawn(Arc::clone(&self.decoder), sink));
        let pump = tokio::spawn(pump_frames(
            Arc::clone(&self.shared),
            Arc::clone(&scheduler),
            stream,
            epoch,
        ));
        control.pipeline = Some(Pipeline { scheduler, pump });
        Ok(())
    }

    fn fail_start(&self, source: &mut S, epoch: u64, err: SourceError) -> ScanError {
        source.stop();
        let mut core = self.shared.core();
        if core.epoch == epoch && core.state == ScanSessionState::Starting {
            self.shared.fail(&mut core, FailureReason::from(err.clone()));
        }
        ScanError::from(err)
    }

    /// Stop decoding while keeping the camera acquired.
    pub async fn pause(&self) -> Result<(), ScanError> {
        let control = self.control.lock().await;
        let mut core = self.shared.core();
        if core.state != ScanSessionState::Running {
            return Err(invalid(&core.state, "pause"));
        }
        self.shared.transition(&mut core, ScanSessionState::Paused);
        if let Some(pipeline) = &control.pipeline {
            pipeline.scheduler.clear_pending();
        }
        Ok(())
    }

    /// Resume decoding. Symbols seen before the pause are emitted again.
    pub async fn resume(&self) -> Result<(), ScanError> {
        let _control = self.control.lock().await;
        let mut core = self.shared.core();
        if core.state != ScanSessionState::Paused {
            return Err(invalid(&core.state, "resume"));
        }
        core.dedup.reset();
        self.shared.transition(&mut core, ScanSessionState::Running);
        Ok(())
    }

    /// Release the camera and return to idle. Safe in any state; waits for at
    /// most one in-flight decode, whose result is discarded. A failed session
    /// stays failed until `reset()`.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        {
            let mut core = self.shared.core();
            match core.state {
                ScanSessionState::Idle => return,
                ScanSessionState::Failed(_) | ScanSessionState::Stopping => {}
                ScanSessionState::Starting
                | ScanSessionState::Running
                | ScanSessionState::Paused => {
                    core.epoch += 1;
                    self.shared.transition(&mut core, ScanSessionState::Stopping);
                }
            }
        }

        if let Some(pipeline) = control.pipeline.take() {
            pipeline.teardown().await;
        }
        control.source.stop();

        let mut core = self.shared.core();
        if core.state == ScanSessionState::Stopping {
            core.dedup.reset();
            self.shared.transition(&mut core, ScanSessionState::Idle);
        }
    }

    /// Leave the failed state. No-op when idle.
    pub async fn reset(&self) -> Result<(), ScanError> {
        let mut control = self.control.lock().await;
        {
            let core = self.shared.core();
            match &core.state {
                ScanSessionState::Idle => return Ok(()),
                ScanSessionState::Failed(_) => {}
                other => return Err(invalid(other, "reset")),
            }
        }

        if let Some(pipeline) = control.pipeline.take() {
            pipeline.teardown().await;
        }
        control.source.stop();

        let mut core = self.shared.core();
        core.epoch += 1;
        core.dedup.reset();
        self.shared.transition(&mut core, ScanSessionState::Idle);
        Ok(())
    }

    /// Forget the last emitted symbol so the next sighting is emitted at once.
    pub fn clear_results(&self) {
        self.shared.core().dedup.reset();
    }

    pub async fn flip_camera(&self) -> Result<CameraFacing, ScanError> {
        let mut control = self.control.lock().await;
        if !control.source.capabilities().opposite_camera {
            debug!(source = control.source.name(), "flip requested without opposite camera");
            return Err(ScanError::CapabilityUnsupported(Capability::OppositeCamera));
        }
        let facing = control.source.flip_camera()?;
        info!(?facing, "camera flipped");
        Ok(facing)
    }

    pub async fn toggle_torch(&self) -> Result<bool, ScanError> {
        let mut control = self.control.lock().await;
        if !control.source.capabilities().torch {
            debug!(source = control.source.name(), "torch requested without torch");
            return Err(ScanError::CapabilityUnsupported(Capability::Torch));
        }
        let on = control.source.toggle_torch()?;
        info!(on, "torch toggled");
        Ok(on)
    }

    pub async fn facing(&self) -> CameraFacing {
        self.control.lock().await.source.facing()
    }

    pub async fn torch_on(&self) -> bool {
        self.control.lock().await.source.torch_on()
    }

    pub async fn set_orientation(&self, orientation: Orientation) {
        self.control.lock().await.source.set_orientation(orientation);
    }

    pub async fn set_resolution(&self, resolution: Option<Resolution>) {
        self.control.lock().await.source.set_resolution(resolution);
    }

    /// Record preview geometry. Accepted in any state; decoding is unaffected.
    pub fn set_viewport(&self, width: f64, height: f64) -> Viewport {
        let viewport = Viewport::new(width, height);
        self.shared.core().viewport = viewport;
        debug!(width = viewport.width, height = viewport.height, "viewport updated");
        viewport
    }

    pub fn viewport(&self) -> Viewport {
        self.shared.core().viewport
    }

    /// Scheduler counters for the current run, if one is active.
    pub async fn stats(&self) -> Option<SchedulerStats> {
        self.control
            .lock()
            .await
            .pipeline
            .as_ref()
            .map(|p| p.scheduler.stats())
    }
}

impl<S: FrameSource> Drop for ScanSession<S> {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if let Some(pipeline) = control.pipeline.take() {
            pipeline.pump.abort();
            pipeline.scheduler.close();
        }
        control.source.stop();
    }
}
