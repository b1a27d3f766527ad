//! Printer family classification.
//!
//! The firmware never states its family outright. We look at the `model`
//! string (or a configured hint) together with a few discriminating fields
//! and walk an ordered signature table; the first match wins. Everything
//! here is pure.

use serde::{Deserialize, Serialize};

use crate::camera::CameraMode;
use crate::telemetry::TelemetrySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrinterFamily {
    #[serde(rename = "k1")]
    K1,
    #[serde(rename = "k1c")]
    K1C,
    #[serde(rename = "k1_se")]
    K1SE,
    #[serde(rename = "k1_max")]
    K1Max,
    #[serde(rename = "k2")]
    K2,
    #[serde(rename = "k2_pro")]
    K2Pro,
    #[serde(rename = "k2_plus")]
    K2Plus,
    #[serde(rename = "ender3_v3")]
    Ender3V3,
    #[serde(rename = "ender3_v3_ke")]
    Ender3V3KE,
    #[serde(rename = "ender3_v3_plus")]
    Ender3V3Plus,
    #[serde(rename = "creality_hi")]
    CrealityHi,
    #[serde(rename = "unknown")]
    Unknown,
}

impl PrinterFamily {
    pub fn friendly_name(self) -> &'static str {
        match self {
            PrinterFamily::K1 => "K1",
            PrinterFamily::K1C => "K1C",
            PrinterFamily::K1SE => "K1 SE",
            PrinterFamily::K1Max => "K1 Max",
            PrinterFamily::K2 => "K2",
            PrinterFamily::K2Pro => "K2 Pro",
            PrinterFamily::K2Plus => "K2 Plus",
            PrinterFamily::Ender3V3 => "Ender-3 V3",
            PrinterFamily::Ender3V3KE => "Ender-3 V3 KE",
            PrinterFamily::Ender3V3Plus => "Ender-3 V3 Plus",
            PrinterFamily::CrealityHi => "Creality Hi",
            PrinterFamily::Unknown => "Unknown",
        }
    }

    /// Hardware feature table.
    pub fn features(self) -> FeatureSet {
        use PrinterFamily::*;
        let (has_box_temperature, box_temperature_controllable) = match self {
            K1 | K1C | K1Max | K2 => (true, false),
            K2Pro | K2Plus => (true, true),
            K1SE | Ender3V3 | Ender3V3KE | Ender3V3Plus | CrealityHi | Unknown => (false, false),
        };
        let has_light = !matches!(self, K1SE | Ender3V3 | Ender3V3KE | Ender3V3Plus | Unknown);
        let (camera_kind, camera_optional) = match self {
            K1 | K1C | K1Max | CrealityHi => (CameraKind::Mjpeg, false),
            K1SE | Ender3V3 | Ender3V3KE | Ender3V3Plus => (CameraKind::Mjpeg, true),
            K2 | K2Pro | K2Plus => (CameraKind::WebRtc, false),
            Unknown => (CameraKind::None, false),
        };
        let fans = match self {
            K1 | K1C | K1Max | K2 | K2Pro | K2Plus => FanSet { model: true, case: true, side: true },
            K1SE => FanSet { model: true, case: false, side: true },
            CrealityHi => FanSet { model: true, case: true, side: false },
            Ender3V3 | Ender3V3KE | Ender3V3Plus | Unknown => FanSet::model_only(),
        };
        FeatureSet {
            has_box_temperature,
            box_temperature_controllable,
            has_light,
            camera_kind,
            camera_optional,
            fans,
        }
    }
}

impl std::fmt::Display for PrinterFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.friendly_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Mjpeg,
    WebRtc,
    None,
}

/// Part-cooling, chamber and auxiliary fans. The discriminant is the `P`
/// index used in `M106`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanChannel {
    Model = 0,
    Case = 1,
    Side = 2,
}

impl FanChannel {
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Telemetry field reporting this fan's duty in percent.
    pub fn telemetry_field(self) -> &'static str {
        match self {
            FanChannel::Model => "modelFanPct",
            FanChannel::Case => "caseFanPct",
            FanChannel::Side => "auxiliaryFanPct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanSet {
    pub model: bool,
    pub case: bool,
    pub side: bool,
}

impl FanSet {
    pub fn model_only() -> Self {
        Self { model: true, case: false, side: false }
    }

    pub fn supports(&self, channel: FanChannel) -> bool {
        match channel {
            FanChannel::Model => self.model,
            FanChannel::Case => self.case,
            FanChannel::Side => self.side,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub has_box_temperature: bool,
    pub box_temperature_controllable: bool,
    pub has_light: bool,
    pub camera_kind: CameraKind,
    /// The family ships with and without a camera.
    pub camera_optional: bool,
    pub fans: FanSet,
}

impl FeatureSet {
    /// What an unidentified printer gets.
    pub fn minimal() -> Self {
        PrinterFamily::Unknown.features()
    }

    /// Apply an explicit camera mode. `Auto` keeps the family default.
    pub fn with_camera_override(mut self, mode: CameraMode) -> Self {
        match mode {
            CameraMode::Auto => {}
            CameraMode::Mjpeg => {
                self.camera_kind = CameraKind::Mjpeg;
                self.camera_optional = false;
            }
            CameraMode::WebRtc => {
                self.camera_kind = CameraKind::WebRtc;
                self.camera_optional = false;
            }
        }
        self
    }
}

/// Presence bits for the discriminating telemetry fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Presence(u8);

impl Presence {
    /// `targetBoxTemp`, or a non-zero `maxBoxTemp`.
    pub const BOX_SETPOINT: Presence = Presence(0b001);
    /// Truthy `webrtcSupport`.
    pub const WEBRTC: Presence = Presence(0b010);
    /// `lightSw`.
    pub const LIGHT: Presence = Presence(0b100);
    pub const NONE: Presence = Presence(0);

    pub fn of(snapshot: &TelemetrySnapshot) -> Self {
        let mut bits = 0;
        if snapshot.contains("targetBoxTemp") || snapshot.f64("maxBoxTemp").is_some_and(|v| v > 0.0) {
            bits |= Self::BOX_SETPOINT.0;
        }
        if snapshot.flag("webrtcSupport") == Some(true) {
            bits |= Self::WEBRTC.0;
        }
        if snapshot.contains("lightSw") {
            bits |= Self::LIGHT.0;
        }
        Presence(bits)
    }

    pub fn contains(self, other: Presence) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Presence) -> bool {
        self.0 & other.0 != 0
    }

    const fn union(self, other: Presence) -> Presence {
        Presence(self.0 | other.0)
    }
}

/// What detection keyed on; a change means the classification is stale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint {
    pub model: String,
    pub presence: Presence,
}

impl Fingerprint {
    pub fn of(snapshot: &TelemetrySnapshot) -> Self {
        Self {
            model: snapshot.str("model").map(normalize_model).unwrap_or_default(),
            presence: Presence::of(snapshot),
        }
    }
}

struct Signature {
    family: PrinterFamily,
    /// Word phrases matched against the normalized model name. Empty means
    /// the signature matches on shape alone.
    names: &'static [&'static str],
    requires: Presence,
    forbids: Presence,
}

const NO_CHAMBER: Presence = Presence::BOX_SETPOINT.union(Presence::WEBRTC);

/// Ordered; more specific names come before their prefixes.
const SIGNATURES: &[Signature] = &[
    Signature { family: PrinterFamily::K1Max, names: &["k1 max"], requires: Presence::NONE, forbids: Presence::NONE },
    Signature { family: PrinterFamily::K1SE, names: &["k1 se"], requires: Presence::NONE, forbids: NO_CHAMBER },
    Signature { family: PrinterFamily::K1C, names: &["k1c"], requires: Presence::NONE, forbids: Presence::NONE },
    Signature { family: PrinterFamily::K1, names: &["k1"], requires: Presence::NONE, forbids: Presence::NONE },
    Signature { family: PrinterFamily::K2Plus, names: &["k2 plus", "f008"], requires: Presence::NONE, forbids: Presence::NONE },
    Signature { family: PrinterFamily::K2Pro, names: &["k2 pro", "f012"], requires: Presence::NONE, forbids: Presence::NONE },
    Signature { family: PrinterFamily::K2, names: &["k2", "f021"], requires: Presence::NONE, forbids: Presence::NONE },
    Signature { family: PrinterFamily::Ender3V3KE, names: &["ender 3 v3 ke", "f005"], requires: Presence::NONE, forbids: NO_CHAMBER },
    Signature { family: PrinterFamily::Ender3V3Plus, names: &["ender 3 v3 plus", "f002"], requires: Presence::NONE, forbids: NO_CHAMBER },
    Signature { family: PrinterFamily::Ender3V3, names: &["ender 3 v3", "f001"], requires: Presence::NONE, forbids: NO_CHAMBER },
    Signature { family: PrinterFamily::CrealityHi, names: &["creality hi", "hi", "f018"], requires: Presence::NONE, forbids: Presence::NONE },
    // Unnamed K2 firmware: WebRTC signaling without a chamber setpoint.
    Signature { family: PrinterFamily::K2, names: &[], requires: Presence::WEBRTC, forbids: Presence::BOX_SETPOINT },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Matched,
    /// Discriminating fields were present but no signature accepted them.
    Ambiguous,
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub family: PrinterFamily,
    pub features: FeatureSet,
    pub classification: Classification,
    /// Model name the classification keyed on, if any.
    pub model: Option<String>,
    pub fingerprint: Fingerprint,
}

/// Classify a snapshot. The snapshot's own `model` is tried first, then the
/// hint. Total: every input yields a family.
pub fn detect(snapshot: &TelemetrySnapshot, hint: Option<&str>) -> Detection {
    let fingerprint = Fingerprint::of(snapshot);
    let presence = fingerprint.presence;
    let reported = snapshot.str("model").filter(|m| !m.trim().is_empty());
    let candidates = [reported, hint.filter(|h| !h.trim().is_empty())];

    for model in candidates.into_iter().flatten() {
        let normalized = normalize_model(model);
        if let Some(sig) = SIGNATURES.iter().find(|sig| matches(sig, &normalized, presence)) {
            return Detection {
                family: sig.family,
                features: sig.family.features(),
                classification: Classification::Matched,
                model: Some(model.to_string()),
                fingerprint,
            };
        }
    }
    if let Some(sig) = SIGNATURES.iter().find(|sig| sig.names.is_empty() && matches(sig, "", presence)) {
        return Detection {
            family: sig.family,
            features: sig.family.features(),
            classification: Classification::Matched,
            model: reported.map(str::to_string),
            fingerprint,
        };
    }

    let classification = if presence == Presence::NONE {
        Classification::Unmatched
    } else {
        Classification::Ambiguous
    };
    Detection {
        family: PrinterFamily::Unknown,
        features: FeatureSet::minimal(),
        classification,
        model: reported.map(str::to_string),
        fingerprint,
    }
}

fn matches(sig: &Signature, normalized_model: &str, presence: Presence) -> bool {
    if !presence.contains(sig.requires) || presence.intersects(sig.forbids) {
        return false;
    }
    sig.names.is_empty() || sig.names.iter().any(|phrase| contains_phrase(normalized_model, phrase))
}

/// Lowercase, `-`/`_` become spaces, whitespace collapsed.
fn normalize_model(model: &str) -> String {
    model
        .to_ascii_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-word phrase containment: `"k1"` matches `"cr k1 max"` but not
/// `"k1c"`.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let words: Vec<&str> = haystack.split(' ').collect();
    let needle: Vec<&str> = phrase.split(' ').collect();
    !needle.is_empty() && words.windows(needle.len()).any(|window| window == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(value: serde_json::Value) -> TelemetrySnapshot {
        TelemetrySnapshot::from_value(value).unwrap()
    }

    #[test]
    fn test_model_names() {
        let cases = [
            ("CR-K1", PrinterFamily::K1),
            ("K1C", PrinterFamily::K1C),
            ("K1 SE", PrinterFamily::K1SE),
            ("CR-K1 Max", PrinterFamily::K1Max),
            ("F021", PrinterFamily::K2),
            ("F012", PrinterFamily::K2Pro),
            ("K2 Plus", PrinterFamily::K2Plus),
            ("Ender-3 V3 KE", PrinterFamily::Ender3V3KE),
            ("F002", PrinterFamily::Ender3V3Plus),
            ("Ender-3 V3", PrinterFamily::Ender3V3),
            ("F018", PrinterFamily::CrealityHi),
        ];
        for (model, family) in cases {
            let detection = detect(&snap(json!({ "model": model })), None);
            assert_eq!(detection.family, family, "model {model}");
            assert_eq!(detection.classification, Classification::Matched);
        }
    }

    #[test]
    fn test_hint_used_when_model_missing() {
        let detection = detect(&snap(json!({"nozzleTemp": 20})), Some("K1C"));
        assert_eq!(detection.family, PrinterFamily::K1C);
        // The reported model wins over the hint
        let detection = detect(&snap(json!({"model": "F012"})), Some("K1C"));
        assert_eq!(detection.family, PrinterFamily::K2Pro);
    }

    #[test]
    fn test_shape_only_k2() {
        let detection = detect(&snap(json!({"webrtcSupport": 1})), None);
        assert_eq!(detection.family, PrinterFamily::K2);
        assert_eq!(detection.features.camera_kind, CameraKind::WebRtc);
    }

    #[test]
    fn test_unknown_is_minimal() {
        let detection = detect(&snap(json!({"nozzleTemp": 20})), None);
        assert_eq!(detection.family, PrinterFamily::Unknown);
        assert_eq!(detection.classification, Classification::Unmatched);
        let f = detection.features;
        assert!(!f.has_box_temperature && !f.has_light);
        assert_eq!(f.camera_kind, CameraKind::None);
        assert_eq!(f.fans, FanSet::model_only());
    }

    #[test]
    fn test_contradicting_shape_is_ambiguous() {
        // An Ender name cannot carry a chamber setpoint.
        let detection = detect(&snap(json!({"model": "Ender-3 V3", "targetBoxTemp": 0})), None);
        assert_eq!(detection.family, PrinterFamily::Unknown);
        assert_eq!(detection.classification, Classification::Ambiguous);
        // WebRTC plus a chamber setpoint could be either K2 Pro or Plus.
        let detection = detect(&snap(json!({"webrtcSupport": 1, "maxBoxTemp": 60})), None);
        assert_eq!(detection.classification, Classification::Ambiguous);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let s = snap(json!({"model": "K2 Pro", "targetBoxTemp": 35, "lightSw": 1}));
        assert_eq!(detect(&s, None), detect(&s, None));
    }

    #[test]
    fn test_feature_table() {
        assert!(PrinterFamily::K2Plus.features().box_temperature_controllable);
        assert!(!PrinterFamily::K2.features().box_temperature_controllable);
        assert!(!PrinterFamily::K1SE.features().has_box_temperature);
        assert!(!PrinterFamily::Ender3V3KE.features().has_light);
        assert!(PrinterFamily::Ender3V3KE.features().camera_optional);
        assert_eq!(PrinterFamily::CrealityHi.features().camera_kind, CameraKind::Mjpeg);
    }

    #[test]
    fn test_fingerprint_changes_with_shape() {
        let a = Fingerprint::of(&snap(json!({"model": "K2"})));
        let b = Fingerprint::of(&snap(json!({"model": "K2", "targetBoxTemp": 0})));
        assert_ne!(a, b);
        assert_eq!(a, Fingerprint::of(&snap(json!({"model": "k2", "nozzleTemp": 1}))));
    }

    #[test]
    fn test_camera_override() {
        let f = PrinterFamily::K1C.features().with_camera_override(CameraMode::WebRtc);
        assert_eq!(f.camera_kind, CameraKind::WebRtc);
        let f = PrinterFamily::K1C.features().with_camera_override(CameraMode::Auto);
        assert_eq!(f.camera_kind, CameraKind::Mjpeg);
    }
}
