//! Fixtures shared by the unit tests.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GrayImage, ImageFormat};
use qrcode::{Color, QrCode};
use qrscan_common::frame::Frame;
use qrscan_common::symbol::{DecodedSymbol, SymbolFormat};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::decoder::{DecodeError, Decoder};

const MODULE_PX: u32 = 4;
const QUIET_ZONE: u32 = 4;

/// Render `text` as a black-on-white QR code with a quiet zone.
pub fn qr_image(text: &str) -> GrayImage {
    let code = QrCode::new(text.as_bytes()).unwrap();
    let modules = code.width() as u32;
    let colors = code.to_colors();
    let side = (modules + 2 * QUIET_ZONE) * MODULE_PX;
    GrayImage::from_fn(side, side, |x, y| {
        let mx = (x / MODULE_PX) as i64 - QUIET_ZONE as i64;
        let my = (y / MODULE_PX) as i64 - QUIET_ZONE as i64;
        let inside = (0..modules as i64).contains(&mx) && (0..modules as i64).contains(&my);
        let dark = inside && colors[(my as u32 * modules + mx as u32) as usize] == Color::Dark;
        image::Luma([if dark { 0 } else { 255 }])
    })
}

pub fn qr_frame(text: &str, captured_at_ms: i64, seq: u64) -> Frame {
    let image = qr_image(text);
    let (w, h) = image.dimensions();
    Frame::luma8(image.into_raw(), w, h, captured_at_ms, seq).unwrap()
}

pub fn blank_frame(seq: u64) -> Frame {
    Frame::luma8(vec![255u8; 16], 4, 4, 0, seq).unwrap()
}

/// Striped greyscale image encoded as JPEG.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = GrayImage::from_fn(width, height, |x, _| {
        image::Luma([if (x / 4) % 2 == 0 { 0 } else { 255 }])
    });
    let mut out = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .unwrap();
    out
}

/// A close-delimited HTTP/1.1 response.
pub fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n"
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Local HTTP server answering the n-th connection with `responses[n]`; the
/// last response repeats. Returns the base URL and a connection counter.
pub async fn serve_http(responses: Vec<Vec<u8>>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let served = counter.fetch_add(1, Ordering::SeqCst);
            let response = responses[served.min(responses.len() - 1)].clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{addr}/stream"), hits)
}

/// Decoder that reports the same text for every frame, optionally after a delay.
/// Tracks how many decodes ran and the peak number running at once.
#[derive(Default)]
pub struct FixedDecoder {
    pub text: String,
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FixedDecoder {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Decoder for FixedDecoder {
    fn decode(&self, frame: &Frame) -> Result<Vec<DecodedSymbol>, DecodeError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut symbol = DecodedSymbol::new(
            self.text.clone(),
            SymbolFormat::QrCode,
            frame.captured_at_ms(),
        );
        symbol.frame_seq = frame.seq();
        Ok(vec![symbol])
    }

    fn name(&self) -> &str {
        "fixed"
    }
}
