use crate::session::ScanSessionState;
use crate::source::{Capability, SourceError};

/// Errors returned by the session control API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("active camera does not support {0}")]
    CapabilityUnsupported(Capability),
    /// The call is not valid in the current state. State is left untouched.
    #[error("cannot {operation} while {state}")]
    InvalidStateTransition {
        state: ScanSessionState,
        operation: &'static str,
    },
    /// `stop()` ran while `start()` was still waiting on the permission check.
    #[error("start interrupted by stop")]
    Interrupted,
}

impl From<SourceError> for ScanError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::PermissionDenied => ScanError::PermissionDenied,
            SourceError::DeviceUnavailable(msg) | SourceError::DeviceLost(msg) => {
                ScanError::DeviceUnavailable(msg)
            }
            SourceError::CapabilityUnsupported(cap) => ScanError::CapabilityUnsupported(cap),
        }
    }
}
