use std::borrow::Cow;

use qrscan_common::frame::{Frame, PixelFormat};
use qrscan_common::symbol::{DecodedSymbol, Point, Quad, SymbolFormat};
use tracing::{debug, trace};

use super::{DecodeError, Decoder};

/// QR code decoder backed by `rqrr`.
///
/// Colour frames are reduced to luma first (BT.601 integer weights); NV12
/// frames use their Y plane directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct QrDecoder;

impl QrDecoder {
    pub fn new() -> Self {
        Self
    }
}

/// Grayscale plane of a frame, borrowed when the frame already has one.
fn luma_plane(frame: &Frame) -> Result<Cow<'_, [u8]>, DecodeError> {
    let pixels = frame.width() as usize * frame.height() as usize;
    let data = frame.data();
    match frame.format() {
        PixelFormat::Luma8 => Ok(Cow::Borrowed(data)),
        PixelFormat::Nv12 => data
            .get(..pixels)
            .map(Cow::Borrowed)
            .ok_or(DecodeError::UnsupportedFormat(PixelFormat::Nv12)),
        PixelFormat::Rgb8 => Ok(Cow::Owned(rgb_to_luma(data, 3))),
        PixelFormat::Rgba8 => Ok(Cow::Owned(rgb_to_luma(data, 4))),
    }
}

fn rgb_to_luma(data: &[u8], stride: usize) -> Vec<u8> {
    data.chunks_exact(stride)
        .map(|px| {
            let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
            ((77 * r + 150 * g + 29 * b) >> 8) as u8
        })
        .collect()
}

fn quad_from(bounds: &[rqrr::Point; 4]) -> Quad {
    Quad {
        corners: bounds.map(|p| Point { x: p.x, y: p.y }),
    }
}

impl Decoder for QrDecoder {
    fn decode(&self, frame: &Frame) -> Result<Vec<DecodedSymbol>, DecodeError> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let luma = luma_plane(frame)?;

        let mut prepared =
            rqrr::PreparedImage::prepare_from_greyscale(width, height, |x, y| luma[y * width + x]);
        let grids = prepared.detect_grids();
        if grids.is_empty() {
            trace!(seq = frame.seq(), "no QR grids detected");
            return Ok(Vec::new());
        }

        let mut symbols = Vec::with_capacity(grids.len());
        let mut last_error = None;
        for grid in &grids {
            match grid.decode() {
                Ok((meta, text)) => {
                    debug!(
                        seq = frame.seq(),
                        version = meta.version.0,
                        ecc_level = meta.ecc_level,
                        len = text.len(),
                        "QR code decoded"
                    );
                    symbols.push(DecodedSymbol {
                        text,
                        format: SymbolFormat::QrCode,
                        detected_at_ms: frame.captured_at_ms(),
                        frame_seq: frame.seq(),
                        bounds: Some(quad_from(&grid.bounds)),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        if symbols.is_empty() {
            if let Some(e) = last_error {
                return Err(DecodeError::Corrupt(e.to_string()));
            }
        }

        // Grid detection order depends on scan order; sort so identical input
        // always yields identical output.
        symbols.sort_by(|a, b| (&a.text, a.bounds).cmp(&(&b.text, b.bounds)));
        symbols.dedup_by(|a, b| a.text == b.text && a.bounds == b.bounds);
        Ok(symbols)
    }

    fn name(&self) -> &str {
        "qr"
    }
}
