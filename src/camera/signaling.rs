//! WebRTC offer/answer relay to the printer's signaling endpoint.
//!
//! The printer expects the session description as base64-encoded JSON in the
//! POST body and replies the same way.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::CameraError;

const SIGNALING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: "offer".to_string(), sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: "answer".to_string(), sdp: sdp.into() }
    }

    pub fn encode(&self) -> Result<String, CameraError> {
        let json = serde_json::to_vec(self).map_err(|e| CameraError::Signaling(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    /// Accepts the base64 envelope, or bare JSON from firmware that skips it.
    pub fn decode(raw: &[u8]) -> Result<Self, CameraError> {
        let trimmed = raw.trim_ascii();
        let json = if trimmed.starts_with(b"{") {
            trimmed.to_vec()
        } else {
            STANDARD
                .decode(trimmed)
                .map_err(|e| CameraError::Signaling(format!("base64: {e}")))?
        };
        serde_json::from_slice(&json).map_err(|e| CameraError::Signaling(e.to_string()))
    }
}

/// POST `offer` to `signaling_url` and return the printer's answer.
pub async fn relay_offer(
    client: &reqwest::Client,
    signaling_url: &str,
    offer: &SessionDescription,
) -> Result<SessionDescription, CameraError> {
    if offer.kind != "offer" {
        return Err(CameraError::Signaling(format!("expected an offer, got '{}'", offer.kind)));
    }
    let body = offer.encode()?;
    tracing::debug!(url = signaling_url, len = body.len(), "relaying WebRTC offer");
    let resp = client
        .post(signaling_url)
        .header(reqwest::header::CONTENT_TYPE, "text/plain")
        .body(body)
        .timeout(SIGNALING_TIMEOUT)
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        tracing::warn!(url = signaling_url, status = %status, "signaling endpoint refused offer");
        return Err(CameraError::UpstreamStatus(status.as_u16()));
    }
    let answer = SessionDescription::decode(&resp.bytes().await?)?;
    if answer.kind != "answer" {
        return Err(CameraError::Signaling(format!("expected an answer, got '{}'", answer.kind)));
    }
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope() {
        let offer = SessionDescription::offer("v=0\r\n");
        let encoded = offer.encode().unwrap();
        let decoded = STANDARD.decode(&encoded).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_decode_accepts_bare_json_and_whitespace() {
        let answer = SessionDescription::decode(b" {\"type\":\"answer\",\"sdp\":\"x\"}\n").unwrap();
        assert_eq!(answer, SessionDescription::answer("x"));
        let encoded = format!("{}\n", SessionDescription::answer("y").encode().unwrap());
        assert_eq!(SessionDescription::decode(encoded.as_bytes()).unwrap().sdp, "y");
        assert!(matches!(SessionDescription::decode(b"!!!"), Err(CameraError::Signaling(_))));
    }

    #[tokio::test]
    async fn test_relay_rejects_non_offer() {
        let client = reqwest::Client::new();
        let result = relay_offer(&client, "http://127.0.0.1:9/", &SessionDescription::answer("x")).await;
        assert!(matches!(result, Err(CameraError::Signaling(_))));
    }
}
