use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use qrscan_common::config::SourceConfig;
use qrscan_common::frame::{Orientation, Resolution};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::{
    frame_interval, CaptureConfig, DeviceState, FrameResult, FrameSource, FrameStream,
    SettingsHandle, SourceError,
};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn http_client() -> reqwest::Client {
    match reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(
                error = %e,
                "failed to build HTTP client, falling back to defaults without connect timeout"
            );
            reqwest::Client::new()
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum MjpegError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

/// Network camera serving `multipart/x-mixed-replace` MJPEG over HTTP.
///
/// A network camera has a single fixed lens and no torch, so flip and torch
/// requests are reported as unsupported.
pub struct MjpegSource {
    url: String,
    quality: u32,
    max_reconnects: u32,
    client: reqwest::Client,
    device: Arc<DeviceState>,
    settings: SettingsHandle,
    producer: Option<AbortHandle>,
}

impl MjpegSource {
    pub fn new(url: impl Into<String>, quality: u32, max_reconnects: u32) -> Self {
        Self {
            url: url.into(),
            quality,
            max_reconnects,
            client: http_client(),
            device: Arc::new(DeviceState::default()),
            settings: SettingsHandle::default(),
            producer: None,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        let mut source = Self::new(config.url.clone(), config.quality, config.max_reconnects);
        if let (Some(width), Some(height)) = (config.width, config.height) {
            source.set_resolution(Some(Resolution { width, height }));
        }
        source
    }

    pub fn device(&self) -> Arc<DeviceState> {
        Arc::clone(&self.device)
    }

    fn stream_url(&self, fps: f64) -> String {
        format!("{}?quality={}&fps={}", self.url, self.quality, fps)
    }
}

impl FrameSource for MjpegSource {
    fn name(&self) -> &str {
        "mjpeg"
    }

    /// Probe the camera URL. HTTP 401/403 means the camera refused us, anything
    /// else that is not a success means there is no usable camera.
    fn authorize(&self) -> BoxFuture<'static, Result<(), SourceError>> {
        let client = self.client.clone();
        let url = self.url.clone();
        async move {
            let response = client
                .get(&url)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
                .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;
            match response.status() {
                status if status.is_success() => {
                    debug!(url, %status, "camera probe succeeded");
                    Ok(())
                }
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    warn!(url, status = %response.status(), "camera refused access");
                    Err(SourceError::PermissionDenied)
                }
                status => Err(SourceError::DeviceUnavailable(format!(
                    "camera probe returned HTTP {}",
                    status.as_u16()
                ))),
            }
        }
        .boxed()
    }

    fn start(&mut self, config: &CaptureConfig) -> Result<FrameStream, SourceError> {
        // The camera paces the stream; the requested rate only has to be usable.
        frame_interval(config.fps)?;
        let job = MjpegJob {
            client: self.client.clone(),
            url: self.stream_url(config.fps),
            max_reconnects: self.max_reconnects,
            settings: self.settings.clone(),
        };
        let stream =
            FrameStream::spawn(&self.device, self.name(), config.buffer, move |tx| job.run(tx))?;
        self.producer = Some(stream.abort_handle());
        Ok(stream)
    }

    fn stop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        self.device.release_current("mjpeg");
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        self.settings.set_orientation(orientation);
    }

    fn set_resolution(&mut self, resolution: Option<Resolution>) {
        self.settings.set_resolution(resolution);
    }
}

struct MjpegJob {
    client: reqwest::Client,
    url: String,
    max_reconnects: u32,
    settings: SettingsHandle,
}

enum StreamEnd {
    /// Server closed the body after delivering this many frames.
    Closed(u64),
    ReceiverGone,
}

impl MjpegJob {
    /// Consume the MJPEG stream, reconnecting with exponential backoff.
    /// Gives up and reports the device lost after `max_reconnects` attempts
    /// in a row produced no frames.
    async fn run(self, tx: mpsc::Sender<FrameResult>) {
        let mut backoff = Duration::from_secs(2);
        let max_backoff = Duration::from_secs(30);
        let mut failures: u32 = 0;
        let mut seq: u64 = 0;

        loop {
            info!(url = self.url, "connecting to MJPEG stream");
            let failure = match self.consume_stream(&tx, &mut seq).await {
                Ok(StreamEnd::ReceiverGone) => return,
                Ok(StreamEnd::Closed(frames)) if frames > 0 => {
                    info!(frames, "stream ended cleanly, reconnecting");
                    failures = 0;
                    backoff = Duration::from_secs(2);
                    None
                }
                Ok(StreamEnd::Closed(_)) => Some("stream closed before any frame".to_string()),
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = failure {
                failures += 1;
                if failures > self.max_reconnects {
                    error!(reason, failures, "giving up on MJPEG camera");
                    let _ = tx.send(Err(SourceError::DeviceLost(reason))).await;
                    return;
                }
                error!(reason, "stream error, reconnecting in {:?}", backoff);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn consume_stream(
        &self,
        tx: &mpsc::Sender<FrameResult>,
        seq: &mut u64,
    ) -> Result<StreamEnd, MjpegError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(MjpegError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(MjpegError::HttpStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
        info!(status = %response.status(), boundary, "connected to MJPEG stream");

        let mut parser = MultipartParser::new(&boundary);
        let mut byte_stream = response.bytes_stream();
        let mut frames: u64 = 0;

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(MjpegError::HttpStream)?;
            for jpeg in parser.push(&chunk) {
                let image = match image::load_from_memory(&jpeg) {
                    Ok(img) => img.to_luma8(),
                    Err(e) => {
                        warn!(error = %e, bytes = jpeg.len(), "failed to decode JPEG part, skipping");
                        continue;
                    }
                };
                let now_ms = Utc::now().timestamp_millis();
                let frame = match self.settings.frame_from_image(image, now_ms, *seq) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, seq = *seq, "failed to build frame, skipping");
                        continue;
                    }
                };
                debug!(seq = *seq, bytes = jpeg.len(), "frame received");
                *seq += 1;
                frames += 1;
                if tx.send(Ok(frame)).await.is_err() {
                    return Ok(StreamEnd::ReceiverGone);
                }
            }
        }

        Ok(StreamEnd::Closed(frames))
    }
}

/// Extract the multipart boundary from a `Content-Type` header value.
fn boundary_from_content_type(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let val = val.trim().trim_matches('"');
        let val = val.strip_prefix("--").unwrap_or(val);
        (!val.is_empty()).then(|| val.to_string())
    })
}

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a multipart MJPEG body.
struct MultipartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MultipartParser {
    fn new(boundary: &str) -> Self {
        Self {
            boundary: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Feed one body chunk, returning every JPEG part it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let boundary_len = self.boundary.len();
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + boundary_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > boundary_len {
                            let _ = self.buffer.split_to(self.buffer.len() - boundary_len);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        // Skip already-scanned bytes next time
                        self.jpeg_start = self.buffer.len().saturating_sub(boundary_len);
                        break;
                    };
                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..jpeg_end].ends_with(b"\r\n") {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    if end > 0 {
                        parts.push(self.buffer[..end].to_vec());
                    }
                    let _ = self.buffer.split_to(jpeg_end + boundary_len);
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use qrscan_common::frame::PixelFormat;
    use tokio::time::timeout;

    use super::*;
    use crate::source::{CameraFacing, Capability};
    use crate::test_support::{http_response, jpeg_bytes, serve_http};

    const WAIT: Duration = Duration::from_secs(5);
    const MULTIPART: &str = "multipart/x-mixed-replace; boundary=frame";

    fn part(body: &[u8]) -> Vec<u8> {
        let mut out = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn splits_parts_on_boundary() {
        let mut body = part(b"JPEG-ONE");
        body.extend(part(b"JPEG-TWO"));
        body.extend_from_slice(b"--frame\r\n");

        let mut parser = MultipartParser::new("frame");
        let parts = parser.push(&body);
        assert_eq!(parts, vec![b"JPEG-ONE".to_vec(), b"JPEG-TWO".to_vec()]);
    }

    #[test]
    fn boundary_split_across_chunks() {
        let mut body = part(b"ABCDEFGHIJ");
        body.extend_from_slice(b"--frame\r\n");

        let mut parser = MultipartParser::new("frame");
        let mut parts = Vec::new();
        for chunk in body.chunks(3) {
            parts.extend(parser.push(chunk));
        }
        assert_eq!(parts, vec![b"ABCDEFGHIJ".to_vec()]);
    }

    #[test]
    fn preamble_before_first_boundary_ignored() {
        let mut body = b"garbage preamble".to_vec();
        body.extend(part(b"X"));
        body.extend_from_slice(b"--frame\r\n");

        let mut parser = MultipartParser::new("frame");
        assert_eq!(parser.push(&body), vec![b"X".to_vec()]);
    }

    #[test]
    fn boundary_param_parsing() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--myboundary\"")
                .as_deref(),
            Some("myboundary")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
    }

    #[test]
    fn network_camera_has_no_optional_features() {
        let mut source = MjpegSource::new("http://127.0.0.1:9/stream", 80, 0);
        assert!(!source.capabilities().supports(Capability::OppositeCamera));
        assert_eq!(
            source.flip_camera(),
            Err(SourceError::CapabilityUnsupported(Capability::OppositeCamera))
        );
        assert_eq!(
            source.toggle_torch(),
            Err(SourceError::CapabilityUnsupported(Capability::Torch))
        );
        assert_eq!(source.facing(), CameraFacing::Back);
    }

    #[tokio::test]
    async fn unreachable_camera_is_unavailable() {
        // Port 9 (discard) is closed on any sane test host.
        let source = MjpegSource::new("http://127.0.0.1:9/stream", 80, 0);
        assert!(matches!(
            source.authorize().await,
            Err(SourceError::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn jpeg_parts_become_luma_frames() {
        let mut body = part(&jpeg_bytes(32, 16));
        body.extend(part(&jpeg_bytes(32, 16)));
        body.extend_from_slice(b"--frame\r\n");
        let (url, _) = serve_http(vec![http_response("200 OK", MULTIPART, &body)]).await;

        let mut source = MjpegSource::new(url, 80, 0);
        let device = source.device();
        source.set_resolution(Some(Resolution {
            width: 16,
            height: 8,
        }));
        source.set_orientation(Orientation::Deg90);

        let mut stream = source.start(&CaptureConfig::default()).unwrap();
        for expected_seq in 0..2 {
            let frame = timeout(WAIT, stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("camera error");
            assert_eq!(frame.format(), PixelFormat::Luma8);
            assert_eq!((frame.width(), frame.height()), (16, 8));
            assert_eq!(frame.orientation(), Orientation::Deg90);
            assert_eq!(frame.seq(), expected_seq);
        }
        drop(stream);
        assert!(!device.is_acquired());
    }

    #[tokio::test]
    async fn closed_port_reports_device_lost() {
        let mut source = MjpegSource::new("http://127.0.0.1:9/stream", 80, 0);
        let device = source.device();
        let mut stream = source.start(&CaptureConfig::default()).unwrap();
        assert!(device.is_acquired());

        assert!(matches!(
            timeout(WAIT, stream.next()).await.expect("timed out"),
            Some(Err(SourceError::DeviceLost(_)))
        ));
        drop(stream);
        assert!(!device.is_acquired());
        assert_eq!(device.releases(), 1);
    }

    #[tokio::test]
    async fn reconnects_before_giving_up() {
        let (url, hits) = serve_http(vec![http_response(
            "503 Service Unavailable",
            "text/plain",
            b"",
        )])
        .await;
        let mut source = MjpegSource::new(url, 80, 1);
        let mut stream = source.start(&CaptureConfig::default()).unwrap();

        // One failure, a 2s backoff, then the retry fails too.
        assert!(matches!(
            timeout(WAIT, stream.next()).await.expect("timed out"),
            Some(Err(SourceError::DeviceLost(_)))
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unusable_frame_rate_is_rejected() {
        let mut source = MjpegSource::new("http://127.0.0.1:9/stream", 80, 0);
        assert!(matches!(
            source.start(&CaptureConfig {
                fps: f64::INFINITY,
                buffer: 1,
            }),
            Err(SourceError::DeviceUnavailable(_))
        ));
        assert_eq!(source.device().acquisitions(), 0);
    }

    #[test]
    fn stream_url_carries_quality_and_fps() {
        let source = MjpegSource::new("http://cam/stream", 70, 0);
        assert_eq!(source.stream_url(15.0), "http://cam/stream?quality=70&fps=15");
    }
}
