//! MJPEG pass-through and snapshot extraction.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use super::CameraError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
/// Give up on a frame that never ends.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// A JPEG is at least this long, starts with SOI and ends with EOI.
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 20 && data.starts_with(&SOI) && data.ends_with(&EOI)
}

/// First complete JPEG in `data`.
pub fn extract_jpeg(data: &[u8]) -> Option<Bytes> {
    FrameExtractor::default().push(data)
}

/// Incremental SOI…EOI scanner over an MJPEG byte stream.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buf: Vec<u8>,
    in_frame: bool,
    scanned: usize,
}

impl FrameExtractor {
    /// Feed the next chunk; returns the first complete frame once seen.
    /// Bytes after that frame are kept, so push an empty chunk to drain
    /// further frames that arrived together.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.buf.extend_from_slice(chunk);
        if !self.in_frame {
            match find(&self.buf, &SOI) {
                Some(start) => {
                    self.buf.drain(..start);
                    self.in_frame = true;
                    self.scanned = SOI.len();
                }
                None => {
                    // A marker may straddle two chunks.
                    let keep_from = self.buf.len().saturating_sub(1);
                    self.buf.drain(..keep_from);
                    return None;
                }
            }
        }

        let from = self.scanned.saturating_sub(1);
        if let Some(pos) = find(&self.buf[from..], &EOI) {
            let end = from + pos + EOI.len();
            let frame = Bytes::copy_from_slice(&self.buf[..end]);
            self.buf.drain(..end);
            self.in_frame = false;
            self.scanned = 0;
            return Some(frame);
        }
        self.scanned = self.buf.len();
        if self.buf.len() > MAX_FRAME_BYTES {
            self.reset();
        }
        None
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.in_frame = false;
        self.scanned = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

/// Printer-side MJPEG endpoint.
#[derive(Debug, Clone)]
pub struct MjpegRelay {
    client: reqwest::Client,
    url: String,
}

impl MjpegRelay {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the upstream stream. Returns its content type (with the multipart
    /// boundary) and the raw body.
    pub async fn open(
        &self,
    ) -> Result<(String, impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static), CameraError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            tracing::warn!(url = %self.url, status = %resp.status(), "upstream MJPEG refused");
            return Err(CameraError::UpstreamStatus(resp.status().as_u16()));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("multipart/x-mixed-replace")
            .to_string();
        Ok((content_type, resp.bytes_stream()))
    }

    /// Whole JPEG frames from the live stream, in order.
    pub fn frames(&self) -> impl Stream<Item = Result<Bytes, CameraError>> + Send + '_ {
        async_stream::try_stream! {
            let (_, body) = self.open().await?;
            let mut body = std::pin::pin!(body);
            let mut extractor = FrameExtractor::default();
            while let Some(chunk) = body.next().await {
                let mut next = extractor.push(&chunk?);
                while let Some(frame) = next {
                    yield frame;
                    next = extractor.push(&[]);
                }
            }
        }
    }

    /// Grab one frame off the live stream.
    pub async fn snapshot(&self, timeout: Duration) -> Result<Bytes, CameraError> {
        let grab = async {
            let mut frames = std::pin::pin!(self.frames());
            match frames.next().await {
                Some(Ok(frame)) if is_valid_jpeg(&frame) => Ok(frame),
                Some(Err(e)) => Err(e),
                _ => Err(CameraError::NoFrame),
            }
        };
        tokio::time::timeout(timeout, grab)
            .await
            .map_err(|_| CameraError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload_len: usize) -> Vec<u8> {
        let mut data = SOI.to_vec();
        data.extend(std::iter::repeat_n(0x11, payload_len));
        data.extend_from_slice(&EOI);
        data
    }

    #[test]
    fn test_is_valid_jpeg() {
        assert!(is_valid_jpeg(&jpeg(20)));
        assert!(!is_valid_jpeg(&jpeg(4)));
        let mut truncated = jpeg(30);
        truncated.pop();
        assert!(!is_valid_jpeg(&truncated));
    }

    #[test]
    fn test_extract_from_multipart_body() {
        let mut body = b"--boundary\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        let frame = jpeg(32);
        body.extend_from_slice(&frame);
        body.extend_from_slice(b"\r\n--boundary\r\n");
        body.extend_from_slice(&jpeg(64));
        assert_eq!(extract_jpeg(&body).as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn test_markers_split_across_chunks() {
        let frame = jpeg(40);
        let mut stream = b"junk".to_vec();
        stream.extend_from_slice(&frame);
        let mut extractor = FrameExtractor::default();
        let mut found = None;
        // One byte at a time splits every marker.
        for byte in &stream {
            if let Some(f) = extractor.push(std::slice::from_ref(byte)) {
                found = Some(f);
                break;
            }
        }
        assert_eq!(found.as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn test_back_to_back_frames_in_one_chunk() {
        let mut body = jpeg(24);
        body.extend_from_slice(b"\r\n--b\r\n");
        body.extend_from_slice(&jpeg(36));
        let mut extractor = FrameExtractor::default();
        assert_eq!(extractor.push(&body).as_deref(), Some(jpeg(24).as_slice()));
        assert_eq!(extractor.push(&[]).as_deref(), Some(jpeg(36).as_slice()));
        assert_eq!(extractor.push(&[]), None);
    }

    #[tokio::test]
    async fn test_frames_from_live_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut body = b"--b\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&jpeg(32));
        body.extend_from_slice(b"\r\n--b\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&jpeg(48));
        let app = axum::Router::new().route(
            "/",
            axum::routing::get(move || {
                let body = body.clone();
                async move { body }
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await });

        let relay = MjpegRelay::new(reqwest::Client::new(), format!("http://{addr}/"));
        let frames: Vec<Bytes> = relay.frames().map(|f| f.unwrap()).collect().await;
        assert_eq!(frames, vec![Bytes::from(jpeg(32)), Bytes::from(jpeg(48))]);
        assert_eq!(relay.snapshot(Duration::from_secs(5)).await.unwrap(), Bytes::from(jpeg(32)));
    }

    #[tokio::test]
    async fn test_snapshot_upstream_refused() {
        // Nothing listens on the discard port.
        let relay = MjpegRelay::new(reqwest::Client::new(), "http://127.0.0.1:9/");
        assert!(relay.snapshot(Duration::from_secs(5)).await.is_err());
    }

    #[test]
    fn test_no_frame() {
        assert_eq!(extract_jpeg(b"no markers here"), None);
        assert_eq!(extract_jpeg(&[0xFF, 0xD8, 0x00, 0x01]), None);
    }
}
