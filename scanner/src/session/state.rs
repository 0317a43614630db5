use qrscan_common::symbol::DecodedSymbol;

use crate::source::SourceError;

/// Why a session ended up in [`ScanSessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied,
    DeviceUnavailable(String),
    DeviceLost(String),
}

impl From<SourceError> for FailureReason {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::PermissionDenied => FailureReason::PermissionDenied,
            SourceError::DeviceUnavailable(msg) => FailureReason::DeviceUnavailable(msg),
            SourceError::DeviceLost(msg) => FailureReason::DeviceLost(msg),
            SourceError::CapabilityUnsupported(cap) => {
                FailureReason::DeviceUnavailable(format!("missing {cap}"))
            }
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::PermissionDenied => f.write_str("camera permission denied"),
            FailureReason::DeviceUnavailable(msg) => write!(f, "camera unavailable: {msg}"),
            FailureReason::DeviceLost(msg) => write!(f, "camera lost: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSessionState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    /// Terminal until `reset()`.
    Failed(FailureReason),
}

impl ScanSessionState {
    pub fn label(&self) -> &'static str {
        match self {
            ScanSessionState::Idle => "IDLE",
            ScanSessionState::Starting => "STARTING",
            ScanSessionState::Running => "RUNNING",
            ScanSessionState::Paused => "PAUSED",
            ScanSessionState::Stopping => "STOPPING",
            ScanSessionState::Failed(_) => "FAILED",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ScanSessionState::Failed(_))
    }
}

impl std::fmt::Display for ScanSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanSessionState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(&other.label().to_ascii_lowercase()),
        }
    }
}

/// What subscribers of a session receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Symbol(DecodedSymbol),
    /// Sent once when the session enters the failed state.
    Failed(FailureReason),
}

/// Preview geometry set by the presentation layer. Has no effect on decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    /// Negative or non-finite sizes are clamped to zero.
    pub fn new(width: f64, height: f64) -> Self {
        let clamp = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        Self {
            width: clamp(width),
            height: clamp(height),
        }
    }
}
