pub mod qr;

use qrscan_common::frame::{Frame, PixelFormat};
use qrscan_common::symbol::DecodedSymbol;

pub use qr::QrDecoder;

/// Frame-to-symbols decoding interface.
///
/// Implementations must not depend on session state, and must return the
/// same symbols in the same order for identical input. A decode may be slow;
/// callers run it off the async executor.
pub trait Decoder: Send + Sync + 'static {
    /// Returns every symbol found in `frame`, possibly none.
    fn decode(&self, frame: &Frame) -> Result<Vec<DecodedSymbol>, DecodeError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("corrupt symbol: {0}")]
    Corrupt(String),
}
