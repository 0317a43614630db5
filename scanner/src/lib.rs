//! Real-time barcode scanning pipeline: camera frames in, deduplicated
//! symbols out.

pub mod decoder;
pub mod dedup;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod source;

#[cfg(test)]
pub(crate) mod test_support;

pub use decoder::{DecodeError, Decoder, QrDecoder};
pub use dedup::ResultDeduplicator;
pub use error::ScanError;
pub use scheduler::ScanScheduler;
pub use session::{ScanSession, ScanSessionState, ScanSettings, SessionEvent};
pub use source::{FrameSource, MjpegSource, ReplaySource, SourceError};
