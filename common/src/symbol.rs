use chrono::{DateTime, Utc};
use serde::Serialize;

/// Symbology of a decoded barcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolFormat {
    QrCode,
    MicroQr,
    DataMatrix,
    Aztec,
    Ean13,
    Ean8,
    UpcA,
    Code128,
    Code39,
}

impl SymbolFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolFormat::QrCode => "QR",
            SymbolFormat::MicroQr => "MicroQR",
            SymbolFormat::DataMatrix => "DataMatrix",
            SymbolFormat::Aztec => "Aztec",
            SymbolFormat::Ean13 => "EAN-13",
            SymbolFormat::Ean8 => "EAN-8",
            SymbolFormat::UpcA => "UPC-A",
            SymbolFormat::Code128 => "Code128",
            SymbolFormat::Code39 => "Code39",
        }
    }
}

impl std::fmt::Display for SymbolFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel coordinate in frame space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Four corners of a detected symbol, in detector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Quad {
    pub corners: [Point; 4],
}

impl Quad {
    /// Axis-aligned `(min, max)` corners enclosing the quad.
    pub fn bounding_box(&self) -> (Point, Point) {
        let xs = self.corners.iter().map(|p| p.x);
        let ys = self.corners.iter().map(|p| p.y);
        let min = Point {
            x: xs.clone().min().unwrap_or(0),
            y: ys.clone().min().unwrap_or(0),
        };
        let max = Point {
            x: xs.max().unwrap_or(0),
            y: ys.max().unwrap_or(0),
        };
        (min, max)
    }
}

/// A decoded barcode payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedSymbol {
    pub text: String,
    pub format: SymbolFormat,
    /// Capture timestamp (Unix millis) of the frame the symbol was found in.
    pub detected_at_ms: i64,
    /// Sequence number of that frame.
    pub frame_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Quad>,
}

impl DecodedSymbol {
    pub fn new(text: impl Into<String>, format: SymbolFormat, detected_at_ms: i64) -> Self {
        Self {
            text: text.into(),
            format,
            detected_at_ms,
            frame_seq: 0,
            bounds: None,
        }
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.detected_at_ms).unwrap_or_else(Utc::now)
    }
}
