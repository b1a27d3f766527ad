//! Per-printer coordinator.
//!
//! One task per printer owns the session's event stream, the accumulated
//! telemetry and the current detection. It is the only writer of the
//! published [`PrinterSnapshot`]; everything else (HTTP handlers, command
//! callers) talks to it through a [`CoordinatorHandle`], either by reading
//! the latest published value or by posting an input.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::camera::{
    self, CameraEndpoints, CameraError, CameraMode, CameraTransport, MjpegRelay, SessionDescription, StreamHelper,
    UnavailableReason,
};
use crate::command::{self, CommandContext, CommandError, CommandRelay, CommandStats, PrinterCommand};
use crate::config::PrinterConfig;
use crate::detector::{CameraKind, Classification, Detection, FeatureSet, Fingerprint, PrinterFamily, detect};
use crate::normalizer::{DeviceInfo, DeviceState, PowerState, Status, normalize};
use crate::session::{self, ConnectionState, Connector, SessionEvent, SessionEvents, SessionHandle, SessionSettings, SessionStats};
use crate::telemetry::TelemetrySnapshot;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Connecting,
    Detecting,
    Publishing,
    Reconnecting,
    Closed,
}

/// What subscribers see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrinterSnapshot {
    pub printer: String,
    pub phase: Phase,
    pub connection: ConnectionState,
    pub family: PrinterFamily,
    pub features: FeatureSet,
    /// `None` until the first normalization after startup.
    pub state: Option<DeviceState>,
    pub power: Option<PowerState>,
    pub device: Option<DeviceInfo>,
}

impl PrinterSnapshot {
    pub fn status(&self) -> Status {
        self.state.as_ref().map(|s| s.status).unwrap_or(Status::Unknown)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub generated_at: DateTime<Utc>,
    pub printer: String,
    pub host: String,
    pub available: bool,
    pub power: Option<PowerState>,
    pub phase: Phase,
    pub connection: ConnectionState,
    pub pending_commands: usize,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub telemetry: TelemetrySnapshot,
    pub detection: Option<Detection>,
    pub features: FeatureSet,
    pub device: Option<DeviceInfo>,
    pub camera: CameraTransport,
    pub session: SessionStats,
    pub commands: CommandStats,
}

/// Task-maintained part of the diagnostics bundle.
#[derive(Debug, Default)]
struct DiagnosticsState {
    telemetry: TelemetrySnapshot,
    detection: Option<Detection>,
    last_frame_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum Input {
    Power(Option<PowerState>),
    Overlay(Option<Status>),
    CameraMode(CameraMode),
    HelperAvailable(bool),
}

struct Shared {
    config: PrinterConfig,
    published: watch::Sender<PrinterSnapshot>,
    camera: watch::Sender<CameraTransport>,
    diagnostics: RwLock<DiagnosticsState>,
    inputs: mpsc::Sender<Input>,
    shutdown: broadcast::Sender<()>,
    session: SessionHandle,
    relay: CommandRelay,
    http: reqwest::Client,
    helper: StreamHelper,
    endpoints: CameraEndpoints,
}

/// Everything a coordinator needs besides its printer entry.
#[derive(Clone)]
pub struct CoordinatorOptions {
    pub session: SessionSettings,
    pub command_timeout: Duration,
    pub connector: Arc<dyn Connector>,
    pub http: reqwest::Client,
    pub helper_url: String,
    /// How often the helper is re-checked while the camera depends on it.
    pub helper_recheck: Duration,
}

/// Start supervising one printer.
pub fn spawn(config: PrinterConfig, options: CoordinatorOptions) -> CoordinatorHandle {
    let id = config.id.clone();
    let (session, events) = session::spawn(id.clone(), config.ws_url(), options.connector.clone(), options.session.clone());
    let relay = CommandRelay::new(id.as_str(), session.clone(), options.command_timeout);

    let power = config.power_switch.as_ref().map(|_| PowerState::On);
    let provisional = detect(&TelemetrySnapshot::new(), config.model_hint.as_deref());
    let endpoints = CameraEndpoints::for_host(&config.host, &options.helper_url);
    let initial_camera = camera::select(provisional.family, config.camera_mode, false, &endpoints);

    let (published, _) = watch::channel(PrinterSnapshot {
        printer: id.clone(),
        phase: Phase::Idle,
        connection: ConnectionState::Disconnected,
        family: provisional.family,
        features: provisional.features,
        state: None,
        power,
        device: None,
    });
    let (camera_tx, _) = watch::channel(initial_camera);
    let (inputs_tx, inputs_rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let shared = Arc::new(Shared {
        helper: StreamHelper::with_client(options.http.clone(), options.helper_url.clone()),
        config,
        published,
        camera: camera_tx,
        diagnostics: RwLock::new(DiagnosticsState::default()),
        inputs: inputs_tx,
        shutdown: shutdown_tx,
        session,
        relay,
        http: options.http,
        endpoints,
    });

    let task = CoordinatorTask {
        helper_recheck: options.helper_recheck,
        shared: shared.clone(),
        events,
        inputs: inputs_rx,
        accumulated: TelemetrySnapshot::new(),
        detection: provisional,
        redetect: true,
        power,
        overlay: None,
        camera_mode: shared.config.camera_mode,
        helper_available: None,
        checking_helper: false,
        phase: Phase::Idle,
        connection: ConnectionState::Disconnected,
        state: None,
        device: None,
    };
    tokio::spawn(task.run(shutdown_rx));

    CoordinatorHandle { shared }
}

struct CoordinatorTask {
    shared: Arc<Shared>,
    events: SessionEvents,
    inputs: mpsc::Receiver<Input>,
    accumulated: TelemetrySnapshot,
    detection: Detection,
    /// Set on every new connection; the next frame re-runs detection.
    redetect: bool,
    power: Option<PowerState>,
    overlay: Option<Status>,
    camera_mode: CameraMode,
    helper_available: Option<bool>,
    checking_helper: bool,
    helper_recheck: Duration,
    phase: Phase,
    connection: ConnectionState,
    state: Option<DeviceState>,
    device: Option<DeviceInfo>,
}

impl CoordinatorTask {
    fn id(&self) -> &str {
        &self.shared.config.id
    }

    fn family(&self) -> PrinterFamily {
        self.detection.family
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(printer = %self.id(), host = %self.shared.config.host, "coordinator started");
        self.refresh_camera();
        let mut helper_check = interval_at(Instant::now() + self.helper_recheck, self.helper_recheck);
        helper_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = self.events.recv() => match event {
                    Some(SessionEvent::State(state)) => self.on_connection(state).await,
                    Some(SessionEvent::Snapshot(frame)) => self.on_frame(frame).await,
                    None => break,
                },
                Some(input) = self.inputs.recv() => self.on_input(input),
                _ = helper_check.tick(), if self.wants_helper() && !self.checking_helper => self.spawn_helper_check(),
            }
        }

        let cancelled = self.shared.relay.pending().lock().await.cancel_all();
        if cancelled > 0 {
            tracing::info!(printer = %self.id(), cancelled, "cancelled pending command waits");
        }
        self.events.close();
        self.shared.session.close().await;
        self.connection = ConnectionState::Disconnected;
        self.phase = Phase::Closed;
        self.publish();
        tracing::info!(printer = %self.id(), family = ?self.family(), "coordinator closed");
    }

    async fn on_connection(&mut self, state: ConnectionState) {
        self.connection = state;
        match state {
            ConnectionState::Connecting => {
                if self.phase == Phase::Idle {
                    self.phase = Phase::Connecting;
                }
            }
            ConnectionState::Connected => {
                // Frames are deltas relative to this connection only.
                self.accumulated = TelemetrySnapshot::new();
                self.redetect = true;
                self.phase = Phase::Detecting;
                if self.helper_available == Some(false) {
                    self.helper_available = None;
                }
                self.refresh_camera();
            }
            ConnectionState::Reconnecting { attempt, backoff_ms } => {
                if self.phase != Phase::Reconnecting {
                    tracing::warn!(printer = %self.id(), family = ?self.family(), attempt, backoff_ms, "printer unreachable, reconnecting");
                }
                self.phase = Phase::Reconnecting;
                if let Some(state) = self.state.as_mut() {
                    state.stale = true;
                }
                let cancelled = self.shared.relay.pending().lock().await.cancel_all();
                if cancelled > 0 {
                    tracing::debug!(printer = %self.id(), cancelled, "dropped waits for lost connection");
                }
            }
            ConnectionState::Disconnected => {}
        }
        self.publish();
    }

    async fn on_frame(&mut self, frame: TelemetrySnapshot) {
        self.accumulated.merge(&frame);
        {
            let mut diag = self.shared.diagnostics.write().await;
            diag.telemetry = self.accumulated.clone();
            diag.last_frame_at = Some(Utc::now());
        }

        let resolved = self.shared.relay.pending().lock().await.resolve(&self.accumulated);
        if resolved > 0 {
            tracing::debug!(printer = %self.id(), resolved, "command acknowledged");
        }

        if self.redetect || Fingerprint::of(&self.accumulated) != self.detection.fingerprint {
            self.run_detection().await;
        }
        self.device = Some(DeviceInfo::from_snapshot(&self.accumulated, self.family()));
        self.renormalize();
        self.phase = Phase::Publishing;
        self.publish();
    }

    async fn run_detection(&mut self) {
        let previous = self.detection.family;
        let detection = detect(&self.accumulated, self.shared.config.model_hint.as_deref());
        match detection.classification {
            Classification::Ambiguous => tracing::warn!(
                printer = %self.id(),
                model = ?detection.model,
                "telemetry matches no known family, using minimal features"
            ),
            _ if detection.family != previous || self.redetect => tracing::info!(
                printer = %self.id(),
                family = ?detection.family,
                model = ?detection.model,
                "printer family detected"
            ),
            _ => {}
        }
        self.redetect = false;
        self.detection = detection;
        self.shared.diagnostics.write().await.detection = Some(self.detection.clone());
        if self.family() != previous {
            self.refresh_camera();
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Power(power) => {
                tracing::info!(printer = %self.id(), power = ?power, "power switch changed");
                self.power = power;
                self.renormalize();
            }
            Input::Overlay(overlay) => {
                self.overlay = overlay;
                self.renormalize();
            }
            Input::CameraMode(mode) => {
                self.camera_mode = mode;
                self.refresh_camera();
                return;
            }
            Input::HelperAvailable(available) => {
                self.checking_helper = false;
                if self.helper_available.is_some() && self.helper_available != Some(available) {
                    tracing::info!(printer = %self.id(), available, "streaming helper availability changed");
                }
                self.helper_available = Some(available);
                self.refresh_camera();
                return;
            }
        }
        self.publish();
    }

    fn features(&self) -> FeatureSet {
        self.detection.features.with_camera_override(self.camera_mode)
    }

    /// Recompute the device state from what we hold; never reads the wire.
    fn renormalize(&mut self) {
        let features = self.features();
        if self.power == Some(PowerState::Off) {
            self.state = Some(DeviceState::off(&features));
            return;
        }
        if self.accumulated.is_empty() {
            // Keep the last good state (or none) until telemetry arrives.
            if let Some(state) = self.state.as_mut().filter(|s| s.status == Status::Off) {
                state.status = Status::Unknown;
            }
            return;
        }
        let mut state = normalize(&self.accumulated, &features, self.power);
        state.stale = !self.connection.is_connected();
        self.apply_overlay(&mut state);
        self.state = Some(state);
    }

    /// Show `pausing`/`resuming` until the printer reports where it landed.
    fn apply_overlay(&mut self, state: &mut DeviceState) {
        let Some(overlay) = self.overlay else {
            return;
        };
        let holds = match overlay {
            Status::Pausing => state.status == Status::Printing,
            Status::Resuming => state.status == Status::Paused,
            _ => false,
        };
        if holds {
            state.status = overlay;
        } else {
            self.overlay = None;
        }
    }

    /// Whether the selected camera goes through the streaming helper.
    fn wants_helper(&self) -> bool {
        match self.camera_mode {
            CameraMode::WebRtc => true,
            CameraMode::Mjpeg => false,
            CameraMode::Auto => self.family().features().camera_kind == CameraKind::WebRtc,
        }
    }

    fn refresh_camera(&mut self) {
        let family = self.family();
        if self.wants_helper() && self.helper_available.is_none() && !self.checking_helper {
            self.spawn_helper_check();
        }
        let transport = camera::select(
            family,
            self.camera_mode,
            self.helper_available == Some(true),
            &self.shared.endpoints,
        );
        let changed = self.shared.camera.send_if_modified(|current| {
            if *current == transport {
                return false;
            }
            *current = transport.clone();
            true
        });
        if changed {
            tracing::info!(printer = %self.id(), family = ?family, camera = ?transport.kind(), "camera transport selected");
        }
    }

    /// Check the helper in the background. A helper that was already
    /// serving our stream only needs to answer; otherwise the stream is
    /// (re)registered.
    fn spawn_helper_check(&mut self) {
        self.checking_helper = true;
        let registered = self.helper_available == Some(true);
        let known_down = self.helper_available == Some(false);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let endpoints = &shared.endpoints;
            let mut available = shared.helper.health_check().await;
            if available && !registered {
                if let Err(e) = shared
                    .helper
                    .register_stream(&endpoints.stream_name, &endpoints.signaling_url)
                    .await
                {
                    tracing::warn!(printer = %shared.config.id, error = %e, "stream registration failed");
                    available = false;
                }
            } else if !available && !known_down {
                tracing::warn!(printer = %shared.config.id, helper = %shared.helper.base_url(), "streaming helper unreachable");
            }
            let _ = shared.inputs.send(Input::HelperAvailable(available)).await;
        });
    }

    fn publish(&self) {
        let snapshot = PrinterSnapshot {
            printer: self.id().to_string(),
            phase: self.phase,
            connection: self.connection,
            family: self.family(),
            features: self.features(),
            state: self.state.clone(),
            power: self.power,
            device: self.device.clone(),
        };
        self.shared.published.send_replace(snapshot);
    }
}

/// Cheap, cloneable access to one coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    shared: Arc<Shared>,
}

impl CoordinatorHandle {
    pub fn id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.shared.config
    }

    /// Latest published state.
    pub fn snapshot(&self) -> PrinterSnapshot {
        self.shared.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrinterSnapshot> {
        self.shared.published.subscribe()
    }

    pub fn camera(&self) -> CameraTransport {
        self.shared.camera.borrow().clone()
    }

    pub fn subscribe_camera(&self) -> watch::Receiver<CameraTransport> {
        self.shared.camera.subscribe()
    }

    pub fn connection(&self) -> ConnectionState {
        self.shared.session.state()
    }

    /// Validate against the current state and relay to the printer.
    pub async fn send_command(&self, command: PrinterCommand) -> Result<(), CommandError> {
        let snapshot = self.snapshot();
        let ctx = CommandContext {
            features: snapshot.features,
            status: snapshot.status(),
            limits: snapshot.device.map(|d| d.limits).unwrap_or_default(),
        };
        let relay = &self.shared.relay;
        let plan = match command::plan(&command, &ctx) {
            Ok(plan) => plan,
            Err(e) => {
                relay.record_rejection().await;
                tracing::warn!(printer = %self.id(), family = ?snapshot.family, command = command.name(), error = %e, "command rejected");
                return Err(e);
            }
        };

        let overlay = match command {
            PrinterCommand::Pause => Some(Status::Pausing),
            PrinterCommand::Resume => Some(Status::Resuming),
            _ => None,
        };
        let inputs = self.shared.inputs.clone();
        let result = relay
            .execute(&plan, move || {
                if let Some(status) = overlay {
                    let _ = inputs.try_send(Input::Overlay(Some(status)));
                }
            })
            .await;
        if result.is_err() && overlay.is_some() {
            let _ = self.shared.inputs.send(Input::Overlay(None)).await;
        }
        result
    }

    /// External power-switch reading; `None` unbinds the switch.
    pub async fn set_power(&self, power: Option<PowerState>) {
        let _ = self.shared.inputs.send(Input::Power(power)).await;
    }

    pub async fn set_camera_mode(&self, mode: CameraMode) {
        let _ = self.shared.inputs.send(Input::CameraMode(mode)).await;
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let snapshot = self.snapshot();
        let pending_commands = self.shared.relay.pending().lock().await.len();
        let session = self.shared.session.stats().await;
        let commands = self.shared.relay.stats().await;
        let diag = self.shared.diagnostics.read().await;
        Diagnostics {
            generated_at: Utc::now(),
            printer: snapshot.printer,
            host: self.shared.config.host.clone(),
            available: snapshot.connection.is_connected(),
            power: snapshot.power,
            phase: snapshot.phase,
            connection: snapshot.connection,
            pending_commands,
            last_frame_at: diag.last_frame_at,
            telemetry: diag.telemetry.clone(),
            detection: diag.detection.clone(),
            features: snapshot.features,
            device: snapshot.device,
            camera: self.camera(),
            session,
            commands,
        }
    }

    /// Pass a browser's offer to the printer's signaling endpoint.
    pub async fn relay_webrtc_offer(&self, offer: &SessionDescription) -> Result<SessionDescription, CameraError> {
        match self.camera() {
            CameraTransport::WebRtc { signaling_url, .. } => {
                camera::relay_offer(&self.shared.http, &signaling_url, offer).await
            }
            CameraTransport::Mjpeg { .. } => Err(CameraError::Unavailable(UnavailableReason::NoCamera)),
            CameraTransport::Unavailable { reason } => Err(CameraError::Unavailable(reason)),
        }
    }

    /// MJPEG source for this printer: the printer itself, or the helper's
    /// re-encoded stream for WebRTC printers.
    pub fn mjpeg_relay(&self) -> Result<MjpegRelay, CameraError> {
        match self.camera() {
            CameraTransport::Mjpeg { url, .. } => Ok(MjpegRelay::new(self.shared.http.clone(), url)),
            CameraTransport::WebRtc { stream_url, .. } => Ok(MjpegRelay::new(self.shared.http.clone(), stream_url)),
            CameraTransport::Unavailable { reason } => Err(CameraError::Unavailable(reason)),
        }
    }

    /// One JPEG from whichever transport is active.
    pub async fn camera_snapshot(&self) -> Result<Bytes, CameraError> {
        match self.camera() {
            CameraTransport::WebRtc { stream_name, .. } => self.shared.helper.frame(&stream_name).await,
            _ => self.mjpeg_relay()?.snapshot(SNAPSHOT_TIMEOUT).await,
        }
    }

    /// Stop the coordinator: pending waits are cancelled and the session is
    /// closed before this returns.
    pub async fn shutdown(&self) {
        let mut published = self.subscribe();
        let _ = self.shared.shutdown.send(());
        while published.borrow_and_update().phase != Phase::Closed {
            if published.changed().await.is_err() {
                break;
            }
        }
    }
}
