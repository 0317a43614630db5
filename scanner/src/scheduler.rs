//! Latest-frame-wins bridge between a frame producer and a single decoder.
//!
//! The scheduler keeps one pending slot. A frame submitted while a decode is
//! running replaces whatever is pending; the replaced frame is dropped
//! silently. When a decode finishes the worker takes the pending frame, if
//! any, and decodes it next. Decodes therefore never overlap, no frame is
//! decoded twice, and surviving frames keep their submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use qrscan_common::frame::Frame;
use qrscan_common::symbol::DecodedSymbol;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::decoder::Decoder;

/// Symbols found in one frame.
#[derive(Debug, Clone)]
pub struct DecodeBatch {
    pub frame_seq: u64,
    pub captured_at_ms: i64,
    pub symbols: Vec<DecodedSymbol>,
}

/// Receiver of decode results. Called from the worker, one batch at a time,
/// in frame order.
pub trait DecodeSink: Send + Sync + 'static {
    fn deliver(&self, batch: DecodeBatch);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Frame is pending; nothing was displaced.
    Accepted,
    /// Frame is pending and displaced an older pending frame.
    Replaced { dropped_seq: u64 },
    /// Scheduler is closed.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dropped: u64,
    pub decoded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Slot {
    pending: Option<Frame>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    notify: Notify,
    submitted: AtomicU64,
    dropped: AtomicU64,
    decoded: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct ScanScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanScheduler {
    /// Spawn the decode worker on the current runtime.
    pub fn spawn(decoder: Arc<dyn Decoder>, sink: Arc<dyn DecodeSink>) -> Self {
        let shared = Arc::new(Shared::default());
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), decoder, sink));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Offer a frame for decoding. Never blocks on a decode.
    pub fn submit(&self, frame: Frame) -> Submitted {
        let seq = frame.seq();
        let outcome = {
            let mut slot = self.shared.slot();
            if slot.closed {
                return Submitted::Rejected;
            }
            self.shared.submitted.fetch_add(1, Ordering::Relaxed);
            match slot.pending.replace(frame) {
                Some(old) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    Submitted::Replaced {
                        dropped_seq: old.seq(),
                    }
                }
                None => Submitted::Accepted,
            }
        };
        if let Submitted::Replaced { dropped_seq } = outcome {
            debug!(dropped_seq, seq, "decoder busy, replaced pending frame");
        }
        self.shared.notify.notify_one();
        outcome
    }

    /// Drop the pending frame, if any. Returns whether one was dropped.
    pub fn clear_pending(&self) -> bool {
        let cleared = self.shared.slot().pending.take().is_some();
        if cleared {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        cleared
    }

    /// Stop accepting frames and drop the pending one. A decode already in
    /// flight runs to completion but its result is not delivered. Idempotent.
    pub fn close(&self) {
        {
            let mut slot = self.shared.slot();
            if slot.closed {
                return;
            }
            slot.closed = true;
            if slot.pending.take().is_some() {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.notify.notify_one();
    }

    /// Close and wait for the worker to finish its in-flight decode.
    pub async fn shutdown(&self) {
        self.close();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "decode worker ended abnormally");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.slot().closed
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }
}

impl Drop for ScanScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(shared: Arc<Shared>, decoder: Arc<dyn Decoder>, sink: Arc<dyn DecodeSink>) {
    debug!(decoder = decoder.name(), "decode worker started");
    loop {
        let frame = {
            let mut slot = shared.slot();
            match slot.pending.take() {
                Some(frame) => Some(frame),
                None if slot.closed => break,
                None => None,
            }
        };
        let Some(frame) = frame else {
            shared.notify.notified().await;
            continue;
        };

        let seq = frame.seq();
        let captured_at_ms = frame.captured_at_ms();
        let job_decoder = Arc::clone(&decoder);
        let result = tokio::task::spawn_blocking(move || job_decoder.decode(&frame)).await;

        match result {
            Ok(Ok(symbols)) => {
                shared.decoded.fetch_add(1, Ordering::Relaxed);
                if shared.slot().closed {
                    debug!(seq, "scheduler closed during decode, discarding result");
                    continue;
                }
                if !symbols.is_empty() {
                    sink.deliver(DecodeBatch {
                        frame_seq: seq,
                        captured_at_ms,
                        symbols,
                    });
                }
            }
            Ok(Err(e)) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, seq, "decode failed, treating frame as empty");
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, seq, "decoder panicked, treating frame as empty");
            }
        }
    }

    let stats = shared.stats();
    info!(
        decoder = decoder.name(),
        submitted = stats.submitted,
        dropped = stats.dropped,
        decoded = stats.decoded,
        failed = stats.failed,
        "decode worker stopped"
    );
}
