//! Transport session: one WebSocket per printer.
//!
//! A session task owns the link. It is the only writer: outbound text goes
//! through an mpsc queue and is written from the same `select!` loop that
//! reads. Lost connections are retried forever with capped exponential
//! backoff; a link that stays silent past the liveness window is dropped and
//! reconnected.

mod backoff;
pub mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout, timeout_at};

use crate::config::SessionConfig;
use crate::telemetry::{self, Frame, TelemetrySnapshot};

pub use backoff::Backoff;
pub use transport::{Connector, Inbound, Link, WsConnector};

/// Reply to the printer's heartbeat.
const HEARTBEAT_ACK: &str = "ok";
/// Benign request that makes the printer push a full snapshot.
const POLL_REQUEST: &str = r#"{"method":"get"}"#;
/// Longest a single write or ping may block the loop.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("not connected")]
    NotConnected,
    #[error("no frames within {0:?}")]
    LivenessTimeout(Duration),
    #[error("connection closed by peer")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, backoff_ms: u64 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Timing knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub liveness_timeout: Duration,
    pub ping_interval: Duration,
    pub poll_on_silence: Duration,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            min_backoff: config.min_backoff(),
            max_backoff: config.max_backoff(),
            liveness_timeout: config.stale_after(),
            ping_interval: config.heartbeat(),
            poll_on_silence: config.poll_on_silence(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// What the coordinator hears from its session, in order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    State(ConnectionState),
    Snapshot(TelemetrySnapshot),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub heartbeats: u64,
    pub messages_sent: u64,
    pub connects: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

struct Outbound {
    text: String,
    written: oneshot::Sender<Result<(), SessionError>>,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    shutdown: broadcast::Sender<()>,
    stats: Arc<Mutex<SessionStats>>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Write `text` on the current connection. Resolves once it is on the
    /// wire; fails with `NotConnected` if there is no connection.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SessionError> {
        if !self.state().is_connected() {
            return Err(SessionError::NotConnected);
        }
        let (written, result) = oneshot::channel();
        self.outbound
            .send(Outbound { text: text.into(), written })
            .await
            .map_err(|_| SessionError::NotConnected)?;
        result.await.map_err(|_| SessionError::NotConnected)?
    }

    pub async fn stats(&self) -> SessionStats {
        self.stats.lock().await.clone()
    }

    /// Stop the session and wait for its task to finish.
    pub async fn close(&self) {
        let _ = self.shutdown.send(());
        let mut state = self.state.clone();
        while state.changed().await.is_ok() {}
    }
}

/// Receiving half of a session.
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Stop accepting events; a session blocked on delivery gives up.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Start a session task for `url`.
pub fn spawn(
    printer: impl Into<String>,
    url: impl Into<String>,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
) -> (SessionHandle, SessionEvents) {
    let (outbound_tx, outbound_rx) = mpsc::channel(32);
    let (events_tx, events_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let stats = Arc::new(Mutex::new(SessionStats::default()));

    let task = SessionTask {
        printer: printer.into(),
        url: url.into(),
        connector,
        settings,
        outbound: outbound_rx,
        events: events_tx,
        state: state_tx,
        stats: stats.clone(),
    };
    tokio::spawn(task.run(shutdown_rx));

    let handle = SessionHandle {
        outbound: outbound_tx,
        state: state_rx,
        shutdown: shutdown_tx,
        stats,
    };
    (handle, SessionEvents { rx: events_rx })
}

enum Exit {
    Shutdown,
    Lost(SessionError),
}

struct SessionTask {
    printer: String,
    url: String,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    outbound: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<Mutex<SessionStats>>,
}

impl SessionTask {
    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.settings.min_backoff, self.settings.max_backoff);
        loop {
            if !self.transition(ConnectionState::Connecting).await {
                break;
            }
            let connected = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.connector.connect(&self.url) => result,
            };
            match connected {
                Ok(link) => {
                    self.stats.lock().await.connects += 1;
                    tracing::info!(printer = %self.printer, url = %self.url, "connected");
                    let exit = self.drive(link, &mut backoff, &mut shutdown).await;
                    self.fail_queued();
                    match exit {
                        Exit::Shutdown => break,
                        Exit::Lost(e) => tracing::warn!(printer = %self.printer, error = %e, "connection lost"),
                    }
                }
                Err(e) => tracing::warn!(printer = %self.printer, error = %e, "connect failed"),
            }

            let delay = backoff.next_delay();
            let reconnecting = ConnectionState::Reconnecting {
                attempt: backoff.attempt(),
                backoff_ms: delay.as_millis() as u64,
            };
            if !self.transition(reconnecting).await {
                break;
            }
            tracing::debug!(printer = %self.printer, attempt = backoff.attempt(), delay = ?delay, "reconnecting");
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(delay) => {}
            }
        }
        self.outbound.close();
        self.fail_queued();
        self.transition(ConnectionState::Disconnected).await;
        tracing::info!(printer = %self.printer, "session stopped");
    }

    /// Anything still queued targets a connection that is gone.
    fn fail_queued(&mut self) {
        while let Ok(stale) = self.outbound.try_recv() {
            let _ = stale.written.send(Err(SessionError::NotConnected));
        }
    }

    /// Publish a state change. Returns false once nobody is listening.
    async fn transition(&self, state: ConnectionState) -> bool {
        self.state.send_replace(state);
        self.events.send(SessionEvent::State(state)).await.is_ok()
    }

    async fn drive(
        &mut self,
        mut link: Box<dyn Link>,
        backoff: &mut Backoff,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Exit {
        self.fail_queued();
        if !self.transition(ConnectionState::Connected).await {
            close(link.as_mut()).await;
            return Exit::Shutdown;
        }

        let ping_every = self.settings.ping_interval;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();
        let mut polled = false;
        let mut heard = false;

        let exit = loop {
            let poll_at = last_frame + self.settings.poll_on_silence;
            let dead_at = last_frame + self.settings.liveness_timeout;
            tokio::select! {
                _ = shutdown.recv() => break Exit::Shutdown,
                inbound = link.recv() => {
                    let frame = match inbound {
                        Some(Ok(Inbound::Text(text))) => telemetry::parse_frame(&text),
                        Some(Ok(Inbound::Binary(data))) => telemetry::parse_binary_frame(&data),
                        Some(Err(e)) => break Exit::Lost(e),
                        None => break Exit::Lost(SessionError::Closed),
                    };
                    last_frame = Instant::now();
                    polled = false;
                    if !heard {
                        // Only a link that actually talks counts as a successful connection.
                        heard = true;
                        backoff.reset();
                    }
                    match frame {
                        Ok(Frame::Heartbeat) => {
                            self.stats.lock().await.heartbeats += 1;
                            let deadline = write_deadline(last_frame + self.settings.liveness_timeout);
                            if let Err(exit) = bounded(link.send_text(HEARTBEAT_ACK.to_string()), deadline, shutdown).await {
                                break exit;
                            }
                        }
                        Ok(Frame::Snapshot(snapshot)) => {
                            {
                                let mut stats = self.stats.lock().await;
                                stats.frames_received += 1;
                                stats.last_frame_at = Some(Utc::now());
                            }
                            tracing::debug!(printer = %self.printer, fields = snapshot.len(), "frame");
                            if self.events.send(SessionEvent::Snapshot(snapshot)).await.is_err() {
                                break Exit::Shutdown;
                            }
                        }
                        Err(e) => {
                            self.stats.lock().await.frames_dropped += 1;
                            tracing::warn!(printer = %self.printer, error = %e, "dropping malformed frame");
                        }
                    }
                }
                Some(outbound) = self.outbound.recv() => {
                    match bounded(link.send_text(outbound.text), write_deadline(dead_at), shutdown).await {
                        Ok(()) => {
                            self.stats.lock().await.messages_sent += 1;
                            let _ = outbound.written.send(Ok(()));
                        }
                        Err(exit) => {
                            let error = match &exit {
                                Exit::Lost(e) => e.clone(),
                                Exit::Shutdown => SessionError::NotConnected,
                            };
                            let _ = outbound.written.send(Err(error));
                            break exit;
                        }
                    }
                }
                _ = ping.tick() => {
                    if let Err(exit) = bounded(link.ping(), write_deadline(dead_at), shutdown).await {
                        break exit;
                    }
                }
                _ = sleep_until(poll_at), if !polled => {
                    polled = true;
                    tracing::debug!(printer = %self.printer, "printer silent, polling");
                    if let Err(exit) = bounded(link.send_text(POLL_REQUEST.to_string()), write_deadline(dead_at), shutdown).await {
                        break exit;
                    }
                }
                _ = sleep_until(dead_at) => {
                    break Exit::Lost(SessionError::LivenessTimeout(self.settings.liveness_timeout));
                }
            }
        };
        close(link.as_mut()).await;
        exit
    }
}

/// A write must finish by the liveness deadline, and never takes longer
/// than [`WRITE_TIMEOUT`].
fn write_deadline(dead_at: Instant) -> Instant {
    dead_at.min(Instant::now() + WRITE_TIMEOUT)
}

/// Run one link write; shutdown and `deadline` both interrupt it.
async fn bounded<F>(write: F, deadline: Instant, shutdown: &mut broadcast::Receiver<()>) -> Result<(), Exit>
where
    F: Future<Output = Result<(), SessionError>>,
{
    tokio::select! {
        _ = shutdown.recv() => Err(Exit::Shutdown),
        written = timeout_at(deadline, write) => match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Exit::Lost(e)),
            Err(_) => Err(Exit::Lost(SessionError::Send("write timed out".to_string()))),
        },
    }
}

async fn close(link: &mut dyn Link) {
    if timeout(CLOSE_TIMEOUT, link.close()).await.is_err() {
        tracing::debug!("link close timed out");
    }
}
