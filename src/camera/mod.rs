//! Camera transport selection.
//!
//! K1-class printers serve plain MJPEG; K2-class printers only speak WebRTC,
//! which we hand to a go2rtc-compatible helper. [`select`] decides which one
//! a printer gets and produces a descriptor the HTTP layer can act on.

pub mod helper;
pub mod mjpeg;
pub mod signaling;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detector::{CameraKind, PrinterFamily};

pub use helper::StreamHelper;
pub use mjpeg::{FrameExtractor, MjpegRelay, extract_jpeg, is_valid_jpeg};
pub use signaling::{SessionDescription, relay_offer};

/// User-facing camera mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    #[default]
    Auto,
    Mjpeg,
    WebRtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// The family has no camera, or it is unidentified.
    NoCamera,
    /// WebRTC was chosen but the streaming helper is not reachable.
    HelperUnavailable,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnavailableReason::NoCamera => f.write_str("printer has no camera"),
            UnavailableReason::HelperUnavailable => f.write_str("streaming helper unavailable"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera transport unavailable: {0}")]
    Unavailable(UnavailableReason),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),
    #[error("invalid signaling payload: {0}")]
    Signaling(String),
    #[error("no valid JPEG frame in stream")]
    NoFrame,
    #[error("timed out waiting for the camera")]
    Timeout,
}

/// Every URL a printer's camera could be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraEndpoints {
    pub mjpeg_url: String,
    pub signaling_url: String,
    pub helper_url: String,
    pub stream_name: String,
}

impl CameraEndpoints {
    pub fn for_host(host: &str, helper_url: &str) -> Self {
        Self {
            mjpeg_url: format!("http://{host}:8080/?action=stream"),
            signaling_url: format!("http://{host}:8000/call/webrtc_local"),
            helper_url: helper_url.trim_end_matches('/').to_string(),
            stream_name: stream_name(host),
        }
    }
}

/// `creality_192_168_1_50` for `192.168.1.50`.
pub fn stream_name(host: &str) -> String {
    let sanitized: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("creality_{sanitized}")
}

/// Chosen transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraTransport {
    Mjpeg {
        url: String,
        /// The family may ship without a camera, so the stream can 404.
        optional: bool,
    },
    #[serde(rename = "webrtc")]
    WebRtc {
        signaling_url: String,
        stream_name: String,
        helper_url: String,
        frame_url: String,
        stream_url: String,
    },
    Unavailable {
        reason: UnavailableReason,
    },
}

impl CameraTransport {
    pub fn kind(&self) -> CameraKind {
        match self {
            CameraTransport::Mjpeg { .. } => CameraKind::Mjpeg,
            CameraTransport::WebRtc { .. } => CameraKind::WebRtc,
            CameraTransport::Unavailable { .. } => CameraKind::None,
        }
    }
}

/// Pick a transport. An explicit mode wins over the family default; WebRTC
/// without the helper degrades to `Unavailable`, never to MJPEG.
pub fn select(
    family: PrinterFamily,
    mode: CameraMode,
    helper_available: bool,
    endpoints: &CameraEndpoints,
) -> CameraTransport {
    let defaults = family.features();
    let (kind, optional) = match mode {
        CameraMode::Auto => (defaults.camera_kind, defaults.camera_optional),
        CameraMode::Mjpeg => (CameraKind::Mjpeg, false),
        CameraMode::WebRtc => (CameraKind::WebRtc, false),
    };
    match kind {
        CameraKind::None => CameraTransport::Unavailable {
            reason: UnavailableReason::NoCamera,
        },
        CameraKind::Mjpeg => CameraTransport::Mjpeg {
            url: endpoints.mjpeg_url.clone(),
            optional,
        },
        CameraKind::WebRtc if !helper_available => CameraTransport::Unavailable {
            reason: UnavailableReason::HelperUnavailable,
        },
        CameraKind::WebRtc => {
            let urls = helper::stream_urls(&endpoints.helper_url, &endpoints.stream_name);
            CameraTransport::WebRtc {
                signaling_url: endpoints.signaling_url.clone(),
                stream_name: endpoints.stream_name.clone(),
                helper_url: endpoints.helper_url.clone(),
                frame_url: urls.frame_url,
                stream_url: urls.stream_url,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> CameraEndpoints {
        CameraEndpoints::for_host("192.168.1.50", "http://localhost:11984/")
    }

    #[test]
    fn test_endpoints() {
        let e = endpoints();
        assert_eq!(e.mjpeg_url, "http://192.168.1.50:8080/?action=stream");
        assert_eq!(e.signaling_url, "http://192.168.1.50:8000/call/webrtc_local");
        assert_eq!(e.helper_url, "http://localhost:11984");
        assert_eq!(e.stream_name, "creality_192_168_1_50");
    }

    #[test]
    fn test_family_defaults() {
        let e = endpoints();
        assert!(matches!(
            select(PrinterFamily::K1C, CameraMode::Auto, false, &e),
            CameraTransport::Mjpeg { optional: false, .. }
        ));
        assert!(matches!(
            select(PrinterFamily::Ender3V3KE, CameraMode::Auto, false, &e),
            CameraTransport::Mjpeg { optional: true, .. }
        ));
        assert!(matches!(
            select(PrinterFamily::K2Plus, CameraMode::Auto, true, &e),
            CameraTransport::WebRtc { .. }
        ));
        assert_eq!(
            select(PrinterFamily::Unknown, CameraMode::Auto, true, &e),
            CameraTransport::Unavailable { reason: UnavailableReason::NoCamera }
        );
    }

    #[test]
    fn test_webrtc_without_helper_is_unavailable() {
        let e = endpoints();
        assert_eq!(
            select(PrinterFamily::K2, CameraMode::Auto, false, &e),
            CameraTransport::Unavailable { reason: UnavailableReason::HelperUnavailable }
        );
        assert_eq!(
            select(PrinterFamily::K1, CameraMode::WebRtc, false, &e),
            CameraTransport::Unavailable { reason: UnavailableReason::HelperUnavailable }
        );
    }

    #[test]
    fn test_override_wins() {
        let e = endpoints();
        assert!(matches!(
            select(PrinterFamily::K2Pro, CameraMode::Mjpeg, true, &e),
            CameraTransport::Mjpeg { .. }
        ));
        // Even an unidentified printer gets the forced transport.
        assert!(matches!(
            select(PrinterFamily::Unknown, CameraMode::Mjpeg, false, &e),
            CameraTransport::Mjpeg { .. }
        ));
        let CameraTransport::WebRtc { frame_url, stream_url, .. } =
            select(PrinterFamily::K1, CameraMode::WebRtc, true, &e)
        else {
            panic!("expected webrtc");
        };
        assert_eq!(frame_url, "http://localhost:11984/api/frame.jpeg?src=creality_192_168_1_50");
        assert_eq!(stream_url, "http://localhost:11984/api/stream.mjpeg?src=creality_192_168_1_50");
    }

    #[test]
    fn test_mode_serde() {
        let mode: CameraMode = serde_json::from_str("\"webrtc\"").unwrap();
        assert_eq!(mode, CameraMode::WebRtc);
        let json = serde_json::to_value(CameraTransport::Unavailable { reason: UnavailableReason::NoCamera }).unwrap();
        assert_eq!(json["kind"], "unavailable");
        assert_eq!(json["reason"], "no_camera");
    }
}
