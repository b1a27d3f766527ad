//! Outbound control commands.
//!
//! A [`PrinterCommand`] is first planned against what we know about the
//! printer ([`CommandContext`]): unsupported or redundant requests are
//! rejected here, before anything touches the wire. A plan is a list of
//! `{"method":"set","params":{...}}` frames, each paired with the telemetry
//! change that acknowledges it. The firmware has no request ids, so waits
//! are correlated by our own id against every inbound frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

use crate::detector::{FanChannel, FeatureSet};
use crate::normalizer::{Status, TemperatureLimits, reported_status};
use crate::session::{SessionError, SessionHandle};
use crate::telemetry::TelemetrySnapshot;

/// Chamber setpoints at or below this are sent as 0 (heater off).
const CHAMBER_OFF_THRESHOLD: f64 = 40.0;
const RATE_MIN_PCT: f64 = 1.0;
const RATE_MAX_PCT: f64 = 1000.0;
/// Fan duty read back may be off by rounding through the 0–255 scale.
const FAN_TOLERANCE_PCT: f64 = 1.0;
/// `deviceState` while the toolhead is homing.
const DEVICE_STATE_HOMING: f64 = 7.0;
/// Homing takes a moment to show up in `deviceState`.
const HOMING_SETTLE: Duration = Duration::from_secs(1);
const HOMING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("not supported by this printer: {0}")]
    Unsupported(String),
    #[error("printer is already {0}")]
    Redundant(Status),
    #[error("not allowed while {0}")]
    InvalidState(Status),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("printer did not acknowledge within {0:?}")]
    Timeout(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<SessionError> for CommandError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotConnected => CommandError::NotConnected,
            other => CommandError::Send(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PrinterCommand {
    Pause,
    Resume,
    Stop,
    Light { on: bool },
    NozzleTarget { value: f64 },
    BedTarget {
        #[serde(default)]
        index: u8,
        value: f64,
    },
    ChamberTarget { value: f64 },
    Fan { channel: FanChannel, percent: f64 },
    Feedrate { percent: f64 },
    Flowrate { percent: f64 },
    /// Feedrate and flowrate together.
    PrintTuning { percent: f64 },
    /// `autohome` X and Y, then Z.
    HomeXyThenZ,
}

impl PrinterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PrinterCommand::Pause => "pause",
            PrinterCommand::Resume => "resume",
            PrinterCommand::Stop => "stop",
            PrinterCommand::Light { .. } => "light",
            PrinterCommand::NozzleTarget { .. } => "nozzle_target",
            PrinterCommand::BedTarget { .. } => "bed_target",
            PrinterCommand::ChamberTarget { .. } => "chamber_target",
            PrinterCommand::Fan { .. } => "fan",
            PrinterCommand::Feedrate { .. } => "feedrate",
            PrinterCommand::Flowrate { .. } => "flowrate",
            PrinterCommand::PrintTuning { .. } => "print_tuning",
            PrinterCommand::HomeXyThenZ => "home_xy_then_z",
        }
    }
}

/// What planning needs to know about the printer right now.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandContext {
    pub features: FeatureSet,
    pub status: Status,
    pub limits: TemperatureLimits,
}

/// Telemetry predicate that acknowledges a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AckRule {
    Number { field: String, value: f64, tolerance: f64 },
    Flag { field: String, value: bool },
    /// Reported and no longer `value`.
    Differs { field: String, value: f64 },
    /// The printer's own `state`, code or string.
    StateIn(Vec<Status>),
    All(Vec<AckRule>),
    /// The next frame of any kind.
    AnyFrame,
}

impl AckRule {
    fn number(field: impl Into<String>, value: f64) -> Self {
        AckRule::Number { field: field.into(), value, tolerance: 0.5 }
    }

    pub fn is_satisfied(&self, snapshot: &TelemetrySnapshot) -> bool {
        match self {
            AckRule::Number { field, value, tolerance } => snapshot
                .f64(field)
                .is_some_and(|reported| (reported - value).abs() <= *tolerance),
            AckRule::Flag { field, value } => snapshot.flag(field) == Some(*value),
            AckRule::Differs { field, value } => snapshot.f64(field).is_some_and(|reported| reported != *value),
            AckRule::StateIn(statuses) => statuses.contains(&reported_status(snapshot)),
            AckRule::All(rules) => rules.iter().all(|rule| rule.is_satisfied(snapshot)),
            AckRule::AnyFrame => true,
        }
    }
}

/// One `set` frame and how to tell it landed.
#[derive(Debug, Clone, PartialEq)]
pub struct WireStep {
    pub params: Map<String, Value>,
    pub ack: AckRule,
    /// Frames arriving this soon after the write cannot acknowledge it.
    pub settle: Duration,
    /// Overrides the relay's timeout for this step.
    pub timeout: Option<Duration>,
}

impl WireStep {
    fn new(params: Value, ack: AckRule) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { params, ack, settle: Duration::ZERO, timeout: None }
    }

    fn settle(mut self, settle: Duration, timeout: Duration) -> Self {
        self.settle = settle;
        self.timeout = Some(timeout);
        self
    }

    pub fn to_text(&self) -> String {
        json!({ "method": "set", "params": self.params }).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    pub command: PrinterCommand,
    pub steps: Vec<WireStep>,
}

/// Validate `command` and encode it. Errors here mean nothing was sent.
pub fn plan(command: &PrinterCommand, ctx: &CommandContext) -> Result<CommandPlan, CommandError> {
    let features = &ctx.features;
    let steps = match *command {
        PrinterCommand::Pause => {
            match ctx.status {
                Status::Paused | Status::Pausing => return Err(CommandError::Redundant(ctx.status)),
                Status::SelfTesting => return Err(CommandError::InvalidState(ctx.status)),
                _ => {}
            }
            vec![WireStep::new(json!({"pause": 1}), AckRule::StateIn(vec![Status::Paused]))]
        }
        PrinterCommand::Resume => {
            match ctx.status {
                Status::Paused => {}
                Status::Printing | Status::Resuming => return Err(CommandError::Redundant(ctx.status)),
                // Nothing to resume; the printer would never report printing.
                _ => return Err(CommandError::InvalidState(ctx.status)),
            }
            vec![WireStep::new(json!({"pause": 0}), AckRule::StateIn(vec![Status::Printing]))]
        }
        PrinterCommand::Stop => vec![WireStep::new(
            json!({"stop": 1}),
            AckRule::StateIn(vec![Status::Idle, Status::Stopped]),
        )],
        PrinterCommand::Light { on } => {
            if !features.has_light {
                return Err(CommandError::Unsupported("light".to_string()));
            }
            vec![WireStep::new(
                json!({"lightSw": i32::from(on)}),
                AckRule::Flag { field: "lightSw".to_string(), value: on },
            )]
        }
        PrinterCommand::NozzleTarget { value } => {
            let v = clamp_setpoint(value, ctx.limits.nozzle_max)?;
            vec![WireStep::new(json!({"nozzleTempControl": v}), AckRule::number("targetNozzleTemp", v as f64))]
        }
        PrinterCommand::BedTarget { index, value } => {
            let v = clamp_setpoint(value, ctx.limits.bed_max)?;
            vec![WireStep::new(
                json!({"bedTempControl": {"num": index, "val": v}}),
                AckRule::number(format!("targetBedTemp{index}"), v as f64),
            )]
        }
        PrinterCommand::ChamberTarget { value } => {
            if !features.box_temperature_controllable {
                return Err(CommandError::Unsupported("chamber temperature control".to_string()));
            }
            let v = clamp_setpoint(value, ctx.limits.chamber_max)?;
            let v = if (v as f64) <= CHAMBER_OFF_THRESHOLD { 0 } else { v };
            vec![WireStep::new(json!({"boxTempControl": v}), AckRule::number("targetBoxTemp", v as f64))]
        }
        PrinterCommand::Fan { channel, percent } => {
            if !features.fans.supports(channel) {
                return Err(CommandError::Unsupported(format!("{channel:?} fan").to_lowercase()));
            }
            let pct = finite(percent)?.round().clamp(0.0, 100.0);
            let duty = (255.0 * pct / 100.0).round() as u8;
            vec![WireStep::new(
                json!({"gcodeCmd": format!("M106 P{} S{}", channel.index(), duty)}),
                AckRule::Number {
                    field: channel.telemetry_field().to_string(),
                    value: pct,
                    tolerance: FAN_TOLERANCE_PCT,
                },
            )]
        }
        PrinterCommand::Feedrate { percent } => {
            let v = clamp_rate(percent)?;
            vec![WireStep::new(json!({"setFeedratePct": v}), AckRule::number("curFeedratePct", v as f64))]
        }
        PrinterCommand::Flowrate { percent } => {
            let v = clamp_rate(percent)?;
            vec![WireStep::new(json!({"setFlowratePct": v}), AckRule::number("curFlowratePct", v as f64))]
        }
        PrinterCommand::PrintTuning { percent } => {
            let v = clamp_rate(percent)?;
            vec![
                WireStep::new(json!({"setFeedratePct": v}), AckRule::number("curFeedratePct", v as f64)),
                WireStep::new(json!({"setFlowratePct": v}), AckRule::number("curFlowratePct", v as f64)),
            ]
        }
        PrinterCommand::HomeXyThenZ => vec![
            WireStep::new(
                json!({"autohome": "X Y"}),
                AckRule::Differs { field: "deviceState".to_string(), value: DEVICE_STATE_HOMING },
            )
            .settle(HOMING_SETTLE, HOMING_TIMEOUT),
            WireStep::new(json!({"autohome": "Z"}), AckRule::AnyFrame),
        ],
    };
    Ok(CommandPlan { command: command.clone(), steps })
}

fn finite(value: f64) -> Result<f64, CommandError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CommandError::InvalidArgument(format!("{value} is not a number")))
    }
}

fn clamp_setpoint(value: f64, max: f64) -> Result<i64, CommandError> {
    Ok(finite(value)?.round().clamp(0.0, max.floor()) as i64)
}

fn clamp_rate(percent: f64) -> Result<i64, CommandError> {
    Ok(finite(percent)?.round().clamp(RATE_MIN_PCT, RATE_MAX_PCT) as i64)
}

/// Waiters keyed by request id, resolved by inbound telemetry.
#[derive(Debug, Default)]
pub struct PendingAcks {
    waiters: HashMap<u64, Waiter>,
}

#[derive(Debug)]
struct Waiter {
    rule: AckRule,
    ready_at: Instant,
    done: oneshot::Sender<()>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `rule`, ignoring frames for the first `settle`.
    pub fn register(&mut self, id: u64, rule: AckRule, settle: Duration) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let ready_at = Instant::now() + settle;
        self.waiters.insert(id, Waiter { rule, ready_at, done });
        rx
    }

    /// Complete every waiter whose rule `snapshot` satisfies.
    pub fn resolve(&mut self, snapshot: &TelemetrySnapshot) -> usize {
        let now = Instant::now();
        let done: Vec<u64> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.ready_at <= now && w.rule.is_satisfied(snapshot))
            .map(|(id, _)| *id)
            .collect();
        for id in &done {
            if let Some(waiter) = self.waiters.remove(id) {
                let _ = waiter.done.send(());
            }
        }
        done.len()
    }

    pub fn remove(&mut self, id: u64) {
        self.waiters.remove(&id);
    }

    /// Drop every waiter; their callers see `Cancelled`.
    pub fn cancel_all(&mut self) -> usize {
        let n = self.waiters.len();
        self.waiters.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Statistics for command execution
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub rejected_commands: u64,
    pub failed_commands: u64,
    pub timeouts: u64,
    pub average_response_time: f64,
    pub total_response_time: f64,
}

/// Sends planned commands through a session and waits for their acks.
#[derive(Clone)]
pub struct CommandRelay {
    printer: Arc<str>,
    session: SessionHandle,
    pending: Arc<Mutex<PendingAcks>>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
    stats: Arc<Mutex<CommandStats>>,
}

impl CommandRelay {
    pub fn new(printer: impl Into<Arc<str>>, session: SessionHandle, timeout: Duration) -> Self {
        Self {
            printer: printer.into(),
            session,
            pending: Arc::new(Mutex::new(PendingAcks::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
            stats: Arc::new(Mutex::new(CommandStats::default())),
        }
    }

    /// Shared with the receive path, which resolves waiters.
    pub fn pending(&self) -> Arc<Mutex<PendingAcks>> {
        self.pending.clone()
    }

    pub async fn stats(&self) -> CommandStats {
        self.stats.lock().await.clone()
    }

    pub async fn record_rejection(&self) {
        self.stats.lock().await.rejected_commands += 1;
    }

    /// Run the steps in order, each waiting for its ack. `on_written` fires
    /// once the first frame is on the wire. Each step (write and ack) gets
    /// the relay timeout. No retries.
    pub async fn execute<F>(&self, plan: &CommandPlan, on_written: F) -> Result<(), CommandError>
    where
        F: FnOnce() + Send,
    {
        let start = Instant::now();
        let mut on_written = Some(on_written);
        let result = self.run_steps(plan, &mut on_written).await;
        let elapsed = start.elapsed().as_secs_f64();

        let mut stats = self.stats.lock().await;
        stats.total_commands += 1;
        match &result {
            Ok(()) => {
                stats.successful_commands += 1;
                stats.total_response_time += elapsed;
                stats.average_response_time = stats.total_response_time / stats.successful_commands as f64;
                tracing::debug!(printer = %self.printer, command = plan.command.name(), "acknowledged in {:.3}ms", elapsed * 1000.0);
            }
            Err(CommandError::Timeout(_)) => {
                stats.failed_commands += 1;
                stats.timeouts += 1;
                tracing::warn!(printer = %self.printer, command = plan.command.name(), "command timed out");
            }
            Err(e) => {
                stats.failed_commands += 1;
                tracing::warn!(printer = %self.printer, command = plan.command.name(), error = %e, "command failed");
            }
        }
        result
    }

    async fn run_steps<F>(&self, plan: &CommandPlan, on_written: &mut Option<F>) -> Result<(), CommandError>
    where
        F: FnOnce() + Send,
    {
        for step in &plan.steps {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // Register before sending so a fast reply cannot be missed.
            let ack = self.pending.lock().await.register(id, step.ack.clone(), step.settle);

            let text = step.to_text();
            tracing::debug!(printer = %self.printer, id, frame = %text, "sending");
            let limit = step.timeout.unwrap_or(self.timeout);
            let outcome = tokio::time::timeout(limit, async {
                self.session.send(text).await?;
                if let Some(callback) = on_written.take() {
                    callback();
                }
                ack.await.map_err(|_| CommandError::Cancelled)
            })
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.pending.lock().await.remove(id);
                    return Err(e);
                }
                Err(_) => {
                    self.pending.lock().await.remove(id);
                    return Err(CommandError::Timeout(limit));
                }
            }
        }
        Ok(())
    }
}
