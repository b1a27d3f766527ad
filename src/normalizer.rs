//! Telemetry → normalized device state.
//!
//! [`normalize`] is pure: the same snapshot, features and power state always
//! produce the same [`DeviceState`]. Fields the feature set rules out are
//! never read, so a K1 SE that happens to report `boxTemp` still shows no
//! chamber temperature.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detector::{FanChannel, FeatureSet, PrinterFamily};
use crate::telemetry::{TelemetrySnapshot, parse_model_version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Idle,
    Printing,
    Paused,
    Pausing,
    Resuming,
    Stopped,
    Completed,
    Error,
    SelfTesting,
    Off,
    Unknown,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Printing => "printing",
            Status::Paused => "paused",
            Status::Pausing => "pausing",
            Status::Resuming => "resuming",
            Status::Stopped => "stopped",
            Status::Completed => "completed",
            Status::Error => "error",
            Status::SelfTesting => "self-testing",
            Status::Off => "off",
            Status::Unknown => "unknown",
        }
    }

    /// Case-insensitive; `_` and spaces count as `-`. Anything unrecognized
    /// is `Unknown`, never `Idle`.
    pub fn parse(raw: &str) -> Status {
        let canonical = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match canonical.as_str() {
            "idle" => Status::Idle,
            "printing" => Status::Printing,
            "paused" => Status::Paused,
            "pausing" => Status::Pausing,
            "resuming" => Status::Resuming,
            "stopped" => Status::Stopped,
            "completed" => Status::Completed,
            "error" => Status::Error,
            "self-testing" => Status::SelfTesting,
            "off" => Status::Off,
            _ => Status::Unknown,
        }
    }

    /// Firmware `state` codes.
    pub fn from_code(code: i64) -> Status {
        match code {
            0 => Status::Idle,
            1 => Status::Printing,
            4 => Status::Stopped,
            5 => Status::Paused,
            _ => Status::Unknown,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External power switch reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub nozzle: f64,
    pub nozzle_target: f64,
    pub bed: f64,
    pub bed_target: f64,
    /// Absent when the printer has no chamber sensor.
    pub chamber: Option<f64>,
    /// Absent unless the chamber heater is controllable.
    pub chamber_target: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Fan duty in percent; `None` for fans the printer doesn't have.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FanSpeeds {
    pub model: Option<u8>,
    pub case: Option<u8>,
    pub side: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub status: Status,
    pub progress: u8,
    /// Seconds.
    pub time_left: u64,
    /// Seconds.
    pub job_time: u64,
    pub layer: u32,
    pub total_layers: u32,
    pub temperatures: Temperatures,
    pub position: Position,
    pub feedrate_pct: f64,
    pub flowrate_pct: f64,
    pub fans: FanSpeeds,
    pub object_count: u32,
    pub current_object: String,
    /// `None` when the printer has no controllable light.
    pub light_on: Option<bool>,
    pub file_name: Option<String>,
    pub used_material_cm: f64,
    /// mm³/s
    pub real_time_flow: f64,
    pub error_code: i64,
    /// Set while the connection is down; values are the last known ones.
    pub stale: bool,
}

impl DeviceState {
    /// The state reported while the bound power switch is off.
    pub fn off(features: &FeatureSet) -> Self {
        let temperatures = Temperatures {
            chamber: features.has_box_temperature.then_some(0.0),
            chamber_target: features.box_temperature_controllable.then_some(0.0),
            ..Temperatures::default()
        };
        let fans = FanSpeeds {
            model: features.fans.model.then_some(0),
            case: features.fans.case.then_some(0),
            side: features.fans.side.then_some(0),
        };
        Self {
            status: Status::Off,
            progress: 0,
            time_left: 0,
            job_time: 0,
            layer: 0,
            total_layers: 0,
            temperatures,
            position: Position::default(),
            feedrate_pct: 0.0,
            flowrate_pct: 0.0,
            fans,
            object_count: 0,
            current_object: String::new(),
            light_on: features.has_light.then_some(false),
            file_name: None,
            used_material_cm: 0.0,
            real_time_flow: 0.0,
            error_code: 0,
            stale: false,
        }
    }
}

/// Map a snapshot onto the device model.
pub fn normalize(snapshot: &TelemetrySnapshot, features: &FeatureSet, power: Option<PowerState>) -> DeviceState {
    if power == Some(PowerState::Off) {
        return DeviceState::off(features);
    }

    let file_name = snapshot
        .str("printFileName")
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let progress = progress(snapshot);
    let error_code = snapshot.error_code();

    let temperatures = Temperatures {
        nozzle: snapshot.f64("nozzleTemp").unwrap_or(0.0),
        nozzle_target: snapshot.f64("targetNozzleTemp").unwrap_or(0.0),
        bed: snapshot.f64("bedTemp0").unwrap_or(0.0),
        bed_target: snapshot.f64("targetBedTemp0").unwrap_or(0.0),
        // Only read when the family has the sensor, and absent if not reported.
        chamber: features
            .has_box_temperature
            .then(|| snapshot.f64("boxTemp"))
            .flatten(),
        chamber_target: features
            .box_temperature_controllable
            .then(|| snapshot.f64("targetBoxTemp"))
            .flatten(),
    };

    let position = snapshot
        .position()
        .map(|(x, y, z)| Position { x, y, z })
        .unwrap_or_default();

    let fan = |channel: FanChannel| {
        features
            .fans
            .supports(channel)
            .then(|| snapshot.f64(channel.telemetry_field()).unwrap_or(0.0).clamp(0.0, 100.0).round() as u8)
    };
    let fans = FanSpeeds {
        model: fan(FanChannel::Model),
        case: fan(FanChannel::Case),
        side: fan(FanChannel::Side),
    };

    let object_count = if file_name.is_some() { object_count(snapshot.get("objects")) } else { 0 };
    let current_object = snapshot
        .str("current_object")
        .or_else(|| snapshot.str("currentObject"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("unknown")
        .to_string();

    let light_on = features
        .has_light
        .then(|| snapshot.flag("lightSw").unwrap_or(false));

    DeviceState {
        status: status(snapshot, error_code, file_name.is_some(), progress),
        progress: progress.clamp(0.0, 100.0).round() as u8,
        time_left: non_negative(snapshot.f64("printLeftTime")),
        job_time: non_negative(snapshot.f64("printJobTime")),
        layer: non_negative(snapshot.f64("layer")) as u32,
        total_layers: non_negative(snapshot.f64("TotalLayer")) as u32,
        temperatures,
        position,
        feedrate_pct: snapshot
            .f64("curFeedratePct")
            .or_else(|| snapshot.f64("feedratePct"))
            .unwrap_or(0.0),
        flowrate_pct: snapshot
            .f64("curFlowratePct")
            .or_else(|| snapshot.f64("flowratePct"))
            .unwrap_or(0.0),
        fans,
        object_count,
        current_object,
        light_on,
        file_name,
        used_material_cm: snapshot
            .f64("usedMaterialLength")
            .map(|mm| (mm / 10.0 * 100.0).round() / 100.0)
            .unwrap_or(0.0),
        real_time_flow: snapshot.f64("realTimeFlow").unwrap_or(0.0),
        error_code,
        stale: false,
    }
}

fn status(snapshot: &TelemetrySnapshot, error_code: i64, has_file: bool, progress: f64) -> Status {
    if error_code != 0 {
        return Status::Error;
    }
    if snapshot.i64("withSelfTest").is_some_and(|v| (1..=99).contains(&v)) {
        return Status::SelfTesting;
    }
    if has_file && progress >= 100.0 {
        return Status::Completed;
    }
    reported_status(snapshot)
}

/// The `state` field alone, as a code or a status string.
pub fn reported_status(snapshot: &TelemetrySnapshot) -> Status {
    match snapshot.get("state") {
        Some(Value::String(raw)) => match raw.trim().parse::<i64>() {
            Ok(code) => Status::from_code(code),
            Err(_) => Status::parse(raw),
        },
        Some(_) => snapshot.i64("state").map(Status::from_code).unwrap_or(Status::Unknown),
        None => Status::Unknown,
    }
}

fn progress(snapshot: &TelemetrySnapshot) -> f64 {
    snapshot
        .f64("printProgress")
        .filter(|p| *p > 0.0)
        .or_else(|| snapshot.f64("dProgress"))
        .or_else(|| snapshot.f64("printProgress"))
        .unwrap_or(0.0)
}

fn non_negative(value: Option<f64>) -> u64 {
    value.map(|v| v.max(0.0) as u64).unwrap_or(0)
}

/// `objects` arrives as an array, a `{list: [...]}` wrapper, or a
/// JSON-encoded string of either.
fn object_count(objects: Option<&Value>) -> u32 {
    match objects {
        Some(Value::Array(items)) => items.len() as u32,
        Some(Value::Object(wrapper)) => wrapper
            .get("list")
            .and_then(Value::as_array)
            .map(|items| items.len() as u32)
            .unwrap_or(0),
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .ok()
            .filter(|decoded| !decoded.is_string())
            .map(|decoded| object_count(Some(&decoded)))
            .unwrap_or(0),
        _ => 0,
    }
}

/// Printer-reported temperature ceilings used to clamp setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureLimits {
    pub nozzle_max: f64,
    pub bed_max: f64,
    pub chamber_max: f64,
}

impl Default for TemperatureLimits {
    fn default() -> Self {
        Self {
            nozzle_max: 300.0,
            bed_max: 100.0,
            chamber_max: 60.0,
        }
    }
}

impl TemperatureLimits {
    pub fn from_snapshot(snapshot: &TelemetrySnapshot) -> Self {
        let defaults = Self::default();
        let positive = |key: &str| snapshot.f64(key).filter(|v| *v > 0.0);
        Self {
            nozzle_max: positive("maxNozzleTemp").unwrap_or(defaults.nozzle_max),
            bed_max: positive("maxBedTemp").unwrap_or(defaults.bed_max),
            chamber_max: positive("maxBoxTemp").unwrap_or(defaults.chamber_max),
        }
    }
}

/// Identification details for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub friendly_name: String,
    pub hostname: Option<String>,
    pub hardware_version: Option<String>,
    pub software_version: Option<String>,
    pub limits: TemperatureLimits,
}

impl DeviceInfo {
    pub fn from_snapshot(snapshot: &TelemetrySnapshot, family: PrinterFamily) -> Self {
        let model = snapshot
            .str("model")
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let friendly_name = match (family, &model) {
            (PrinterFamily::Unknown, Some(raw)) => raw.clone(),
            _ => family.friendly_name().to_string(),
        };
        let (hardware_version, software_version) = snapshot
            .str("modelVersion")
            .map(parse_model_version)
            .unwrap_or((None, None));
        Self {
            model,
            friendly_name,
            hostname: snapshot.str("hostname").map(str::to_string),
            hardware_version,
            software_version,
            limits: TemperatureLimits::from_snapshot(snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(value: Value) -> TelemetrySnapshot {
        TelemetrySnapshot::from_value(value).unwrap()
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(Status::parse("PRINTING"), Status::Printing);
        assert_eq!(Status::parse("Self_Testing"), Status::SelfTesting);
        assert_eq!(Status::parse("self testing"), Status::SelfTesting);
        assert_eq!(Status::parse("warming up"), Status::Unknown);
        assert_eq!(Status::parse(""), Status::Unknown);
    }

    #[test]
    fn test_absent_state_is_unknown_not_idle() {
        let state = normalize(&snap(json!({"nozzleTemp": 25})), &FeatureSet::minimal(), None);
        assert_eq!(state.status, Status::Unknown);
    }

    #[test]
    fn test_state_codes() {
        let f = PrinterFamily::K1C.features();
        let code = |c: i64| normalize(&snap(json!({"state": c, "printFileName": "a.gcode"})), &f, None).status;
        assert_eq!(code(0), Status::Idle);
        assert_eq!(code(1), Status::Printing);
        assert_eq!(code(4), Status::Stopped);
        assert_eq!(code(5), Status::Paused);
        assert_eq!(code(42), Status::Unknown);
        let s = snap(json!({"state": 1, "printFileName": "a.gcode", "printProgress": 100}));
        assert_eq!(normalize(&s, &f, None).status, Status::Completed);
        let s = snap(json!({"state": "Paused"}));
        assert_eq!(normalize(&s, &f, None).status, Status::Paused);
    }

    #[test]
    fn test_error_and_self_test_take_priority() {
        let f = FeatureSet::minimal();
        let s = snap(json!({"state": 1, "err": {"errcode": 7}, "withSelfTest": 50}));
        assert_eq!(normalize(&s, &f, None).status, Status::Error);
        let s = snap(json!({"state": 1, "withSelfTest": 50}));
        assert_eq!(normalize(&s, &f, None).status, Status::SelfTesting);
        let s = snap(json!({"state": 1, "withSelfTest": 100}));
        assert_eq!(normalize(&s, &f, None).status, Status::Printing);
    }

    #[test]
    fn test_no_fabricated_chamber_temperature() {
        let s = snap(json!({"boxTemp": 38, "targetBoxTemp": 40, "lightSw": 1}));
        let state = normalize(&s, &PrinterFamily::K1SE.features(), None);
        assert_eq!(state.temperatures.chamber, None);
        assert_eq!(state.temperatures.chamber_target, None);
        assert_eq!(state.light_on, None);

        let state = normalize(&s, &PrinterFamily::K2Pro.features(), None);
        assert_eq!(state.temperatures.chamber, Some(38.0));
        assert_eq!(state.temperatures.chamber_target, Some(40.0));
        assert_eq!(state.light_on, Some(true));
    }

    #[test]
    fn test_paused_k1c_without_box_reading() {
        let s = snap(json!({"state": "paused", "printFileName": "cube.gcode", "printProgress": 42, "nozzleTemp": 210.3, "bedTemp0": 60.0}));
        let state = normalize(&s, &PrinterFamily::K1C.features(), Some(PowerState::On));
        assert_eq!(state.status, Status::Paused);
        assert_eq!(state.progress, 42);
        assert_eq!(state.temperatures.nozzle, 210.3);
        assert_eq!(state.temperatures.bed, 60.0);
        assert_eq!(state.temperatures.chamber, None);
    }

    #[test]
    fn test_power_off_overrides_everything() {
        let s = snap(json!({"state": 1, "printFileName": "x", "printProgress": 55, "nozzleTemp": 210, "boxTemp": 30}));
        let f = PrinterFamily::K1.features();
        let state = normalize(&s, &f, Some(PowerState::Off));
        assert_eq!(state.status, Status::Off);
        assert_eq!(state.progress, 0);
        assert_eq!(state.temperatures.nozzle, 0.0);
        assert_eq!(state.temperatures.chamber, Some(0.0));
        assert_eq!(state.file_name, None);
        assert_eq!(normalize(&s, &f, Some(PowerState::On)).status, Status::Printing);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let s = snap(json!({
            "state": 1, "printFileName": "benchy.gcode", "printProgress": 42,
            "printLeftTime": 1200, "nozzleTemp": "210.4", "curPosition": "X:1 Y:2 Z:0.4",
            "objects": "[1,2,3]", "modelFanPct": 55, "caseFanPct": 20
        }));
        let f = PrinterFamily::K1C.features();
        let a = normalize(&s, &f, None);
        assert_eq!(a, normalize(&s, &f, None));
        assert_eq!(a.progress, 42);
        assert_eq!(a.time_left, 1200);
        assert_eq!(a.object_count, 3);
        assert_eq!(a.position, Position { x: 1.0, y: 2.0, z: 0.4 });
        assert_eq!(a.fans.model, Some(55));
        assert_eq!(a.fans.case, Some(20));
    }

    #[test]
    fn test_progress_fallback_and_clamp() {
        let f = FeatureSet::minimal();
        assert_eq!(normalize(&snap(json!({"printProgress": 0, "dProgress": 12})), &f, None).progress, 12);
        assert_eq!(normalize(&snap(json!({"printProgress": 140})), &f, None).progress, 100);
        assert_eq!(normalize(&snap(json!({"printLeftTime": -5})), &f, None).time_left, 0);
    }

    #[test]
    fn test_object_count_forms() {
        assert_eq!(object_count(Some(&json!([1, 2]))), 2);
        assert_eq!(object_count(Some(&json!({"list": [1, 2, 3]}))), 3);
        assert_eq!(object_count(Some(&json!("{\"list\":[1]}"))), 1);
        assert_eq!(object_count(Some(&json!("garbage"))), 0);
        assert_eq!(object_count(None), 0);
    }

    #[test]
    fn test_device_info() {
        let s = snap(json!({
            "model": "F012", "hostname": "K2Pro-1A2B", "maxNozzleTemp": 350,
            "modelVersion": "printer hw ver:CR4NS;printer sw ver:1.1.2.10;"
        }));
        let info = DeviceInfo::from_snapshot(&s, PrinterFamily::K2Pro);
        assert_eq!(info.friendly_name, "K2 Pro");
        assert_eq!(info.software_version.as_deref(), Some("1.1.2.10"));
        assert_eq!(info.limits.nozzle_max, 350.0);
        assert_eq!(info.limits.bed_max, 100.0);
    }
}
