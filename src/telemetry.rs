//! Raw telemetry as pushed by the printer.
//!
//! Creality firmware pushes flat JSON objects over the WebSocket. Most frames
//! are partial deltas carrying only the fields that changed, so the
//! coordinator keeps an accumulated [`TelemetrySnapshot`] per connection and
//! merges every frame into it.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Fields whose values some firmware ships as JSON-encoded strings.
const EMBEDDED_LIST_FIELDS: [&str; 2] = ["objects", "excluded_objects"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("binary frame is not UTF-8")]
    NotUtf8,
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `{"ModeCode":"heart_beat"}`; must be answered with `ok`.
    Heartbeat,
    Snapshot(TelemetrySnapshot),
}

/// Decode a text frame.
pub fn parse_frame(text: &str) -> Result<Frame, ParseError> {
    let value: Value = serde_json::from_str(text.trim())?;
    let Value::Object(map) = value else {
        return Err(ParseError::NotAnObject);
    };
    if map.get("ModeCode").and_then(Value::as_str) == Some("heart_beat") {
        return Ok(Frame::Heartbeat);
    }
    Ok(Frame::Snapshot(TelemetrySnapshot::from(map)))
}

/// Decode a binary frame, which carries the same JSON as a text frame.
pub fn parse_binary_frame(data: &[u8]) -> Result<Frame, ParseError> {
    let text = std::str::from_utf8(data).map_err(|_| ParseError::NotUtf8)?;
    parse_frame(text)
}

/// Field name to raw value mapping for one push event (or an accumulation
/// of them).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TelemetrySnapshot {
    fields: Map<String, Value>,
}

impl From<Map<String, Value>> for TelemetrySnapshot {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl TelemetrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value; anything but an object is rejected.
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            _ => Err(ParseError::NotAnObject),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Numeric field; numeric strings are accepted.
    pub fn f64(&self, key: &str) -> Option<f64> {
        value_as_f64(self.fields.get(key)?)
    }

    /// Integer field; fractional values are truncated.
    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.fields.get(key)?.as_str()
    }

    /// On/off style field: booleans, non-zero numbers, and `"1"`/`"true"`/`"on"`.
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.fields.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Some(true),
                "0" | "false" | "off" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// `err.errcode`, 0 when absent.
    pub fn error_code(&self) -> i64 {
        self.fields
            .get("err")
            .and_then(|err| err.get("errcode"))
            .and_then(value_as_f64)
            .map(|f| f as i64)
            .unwrap_or(0)
    }

    /// `curPosition`, as `"X:1.0 Y:2.0 Z:3.0"` or `[x, y, z]`.
    pub fn position(&self) -> Option<(f64, f64, f64)> {
        match self.fields.get("curPosition")? {
            Value::String(s) => parse_position(s),
            Value::Array(items) if items.len() >= 3 => Some((
                value_as_f64(&items[0])?,
                value_as_f64(&items[1])?,
                value_as_f64(&items[2])?,
            )),
            _ => None,
        }
    }

    /// Merge a later frame over this one. Embedded JSON lists are decoded on
    /// the way in.
    pub fn merge(&mut self, frame: &TelemetrySnapshot) {
        for (key, value) in &frame.fields {
            let value = if EMBEDDED_LIST_FIELDS.contains(&key.as_str()) {
                decode_embedded_list(value)
            } else {
                value.clone()
            };
            self.fields.insert(key.clone(), value);
        }
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn decode_embedded_list(value: &Value) -> Value {
    if let Value::String(s) = value {
        let trimmed = s.trim();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Ok(decoded) = serde_json::from_str::<Value>(trimmed) {
                return decoded;
            }
        }
    }
    value.clone()
}

fn parse_position(raw: &str) -> Option<(f64, f64, f64)> {
    let (mut x, mut y, mut z) = (None, None, None);
    for token in raw.split_whitespace() {
        let Some((axis, number)) = token.split_once(':') else {
            continue;
        };
        let number = number.trim_end_matches(',').parse::<f64>().ok();
        match axis.trim().to_ascii_uppercase().as_str() {
            "X" => x = number,
            "Y" => y = number,
            "Z" => z = number,
            _ => {}
        }
    }
    Some((x?, y?, z?))
}

/// Hardware and software versions from `modelVersion`, e.g.
/// `printer hw ver:;printer sw ver:;DWIN hw ver:CR4CU220812S11;DWIN sw ver:1.3.3.46;`.
///
/// Printer versions are preferred; DWIN display versions are used (prefixed)
/// when the printer ones are blank.
pub fn parse_model_version(raw: &str) -> (Option<String>, Option<String>) {
    let mut printer_hw = None;
    let mut printer_sw = None;
    let mut dwin_hw = None;
    let mut dwin_sw = None;
    for segment in raw.split(';') {
        let Some((key, value)) = segment.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let slot = match key.trim().to_ascii_lowercase().as_str() {
            "printer hw ver" => &mut printer_hw,
            "printer sw ver" => &mut printer_sw,
            "dwin hw ver" => &mut dwin_hw,
            "dwin sw ver" => &mut dwin_sw,
            _ => continue,
        };
        *slot = Some(value.to_string());
    }
    let hw = printer_hw.or_else(|| dwin_hw.map(|v| format!("DWIN {v}")));
    let sw = printer_sw.or_else(|| dwin_sw.map(|v| format!("DWIN {v}")));
    (hw, sw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: Value) -> TelemetrySnapshot {
        TelemetrySnapshot::from_value(value).unwrap()
    }

    #[test]
    fn test_heartbeat_is_not_a_snapshot() {
        let frame = parse_frame(r#"{"ModeCode":"heart_beat"}"#).unwrap();
        assert_eq!(frame, Frame::Heartbeat);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(matches!(parse_frame("{nope"), Err(ParseError::Json(_))));
        assert!(matches!(parse_frame("[1,2]"), Err(ParseError::NotAnObject)));
        assert!(matches!(parse_binary_frame(&[0xff, 0xfe]), Err(ParseError::NotUtf8)));
    }

    #[test]
    fn test_numeric_accessors_accept_strings() {
        let s = snapshot(json!({"nozzleTemp": "215.50", "state": "1", "layer": 12.0}));
        assert_eq!(s.f64("nozzleTemp"), Some(215.5));
        assert_eq!(s.i64("state"), Some(1));
        assert_eq!(s.i64("layer"), Some(12));
        assert_eq!(s.f64("missing"), None);
    }

    #[test]
    fn test_flag_forms() {
        let s = snapshot(json!({"a": 1, "b": "0", "c": true, "d": "bogus"}));
        assert_eq!(s.flag("a"), Some(true));
        assert_eq!(s.flag("b"), Some(false));
        assert_eq!(s.flag("c"), Some(true));
        assert_eq!(s.flag("d"), None);
    }

    #[test]
    fn test_position_forms() {
        let s = snapshot(json!({"curPosition": "X:10.50 Y:-2.00 Z:0.20"}));
        assert_eq!(s.position(), Some((10.5, -2.0, 0.2)));
        let s = snapshot(json!({"curPosition": [1, 2, 3.5]}));
        assert_eq!(s.position(), Some((1.0, 2.0, 3.5)));
        let s = snapshot(json!({"curPosition": "X:1 Y:2"}));
        assert_eq!(s.position(), None);
    }

    #[test]
    fn test_merge_overlays_and_decodes_lists() {
        let mut acc = snapshot(json!({"nozzleTemp": 20, "bedTemp0": 21}));
        acc.merge(&snapshot(json!({"nozzleTemp": 200, "objects": "[{\"name\":\"a\"},{\"name\":\"b\"}]"})));
        assert_eq!(acc.f64("nozzleTemp"), Some(200.0));
        assert_eq!(acc.f64("bedTemp0"), Some(21.0));
        assert_eq!(acc.get("objects").and_then(Value::as_array).map(Vec::len), Some(2));
    }

    #[test]
    fn test_error_code() {
        assert_eq!(snapshot(json!({"err": {"errcode": 2001, "key": 0}})).error_code(), 2001);
        assert_eq!(snapshot(json!({})).error_code(), 0);
    }

    #[test]
    fn test_model_version_prefers_printer_versions() {
        let (hw, sw) = parse_model_version("printer hw ver:ABC;printer sw ver:1.2.3;DWIN hw ver:XYZ;DWIN sw ver:9.9;");
        assert_eq!(hw.as_deref(), Some("ABC"));
        assert_eq!(sw.as_deref(), Some("1.2.3"));
        let (hw, sw) = parse_model_version("printer hw ver:;printer sw ver:;DWIN hw ver:XYZ;DWIN sw ver:9.9;");
        assert_eq!(hw.as_deref(), Some("DWIN XYZ"));
        assert_eq!(sw.as_deref(), Some("DWIN 9.9"));
        assert_eq!(parse_model_version("garbage"), (None, None));
    }
}
