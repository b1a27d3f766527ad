//! go2rtc-compatible streaming helper.
//!
//! The helper pulls the printer's WebRTC feed (`webrtc:` source) and
//! re-serves it as JPEG frames and MJPEG, which any client can consume.

use std::time::Duration;

use serde_json::json;

use super::CameraError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Frame and stream URLs the helper serves for one registered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperStreamUrls {
    pub frame_url: String,
    pub stream_url: String,
}

pub fn stream_urls(base_url: &str, name: &str) -> HelperStreamUrls {
    let base = base_url.trim_end_matches('/');
    HelperStreamUrls {
        frame_url: format!("{base}/api/frame.jpeg?src={name}"),
        stream_url: format!("{base}/api/stream.mjpeg?src={name}"),
    }
}

#[derive(Debug, Clone)]
pub struct StreamHelper {
    client: reqwest::Client,
    base_url: String,
}

impl StreamHelper {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the helper's API answers.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "streaming helper health check failed");
                false
            }
        }
    }

    /// Add `name` to the helper's config, sourced from the printer's
    /// signaling endpoint.
    pub async fn register_stream(&self, name: &str, signaling_url: &str) -> Result<(), CameraError> {
        let url = format!("{}/api/config", self.base_url);
        let src = format!("webrtc:{signaling_url}");
        let payload = json!({ "streams": { name: src } });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if matches!(status.as_u16(), 200 | 201 | 204) {
            tracing::info!(name = name, src = %src, "registered stream with helper");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(name = name, status = %status, body = %body, "helper rejected stream config");
        Err(CameraError::UpstreamStatus(status.as_u16()))
    }

    /// One JPEG frame of a registered stream.
    pub async fn frame(&self, name: &str) -> Result<bytes::Bytes, CameraError> {
        let urls = stream_urls(&self.base_url, name);
        let resp = self
            .client
            .get(&urls.frame_url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CameraError::UpstreamStatus(resp.status().as_u16()));
        }
        let body = resp.bytes().await?;
        if !super::is_valid_jpeg(&body) {
            tracing::warn!(name = name, len = body.len(), "invalid JPEG from helper");
            return Err(CameraError::NoFrame);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_urls_trim_slash() {
        let urls = stream_urls("http://h:11984/", "creality_x");
        assert_eq!(urls.frame_url, "http://h:11984/api/frame.jpeg?src=creality_x");
        assert_eq!(urls.stream_url, "http://h:11984/api/stream.mjpeg?src=creality_x");
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_helper_futures_can_be_spawned() {
        let helper = StreamHelper::new("http://127.0.0.1:9");
        assert_send(&helper.health_check());
        assert_send(&helper.register_stream("creality_x", "http://10.0.0.7:8000/call/webrtc_local"));
        assert_send(&helper.frame("creality_x"));
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        // Port 9 (discard) on localhost is not an HTTP server.
        let helper = StreamHelper::new("http://127.0.0.1:9");
        assert!(!helper.health_check().await);
    }
}
