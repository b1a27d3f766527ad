//! In-memory printer link shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use creality_ws::config::Config;
use creality_ws::coordinator::{CoordinatorHandle, CoordinatorOptions, PrinterSnapshot};
use creality_ws::fleet::Fleet;
use creality_ws::session::{Connector, Inbound, Link, SessionError, SessionSettings};
use tokio::sync::mpsc;

pub struct MockLink {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    written: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Link for MockLink {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        let _ = self.written.send(text);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Inbound, SessionError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {}
}

/// The far side of a [`MockLink`]: push frames in, read what the bridge wrote.
pub struct MockPrinter {
    pub frames: mpsc::UnboundedSender<Inbound>,
    pub written: mpsc::UnboundedReceiver<String>,
}

impl MockPrinter {
    pub fn push(&self, frame: serde_json::Value) {
        self.frames.send(Inbound::Text(frame.to_string())).unwrap();
    }

    pub async fn next_write(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.written.recv())
            .await
            .expect("no write within 5s")
            .expect("link dropped");
        serde_json::from_str(&text).unwrap()
    }
}

pub fn mock_printer() -> (MockLink, MockPrinter) {
    let (frames, inbound) = mpsc::unbounded_channel();
    let (written_tx, written) = mpsc::unbounded_channel();
    (MockLink { inbound, written: written_tx }, MockPrinter { frames, written })
}

/// Hands out the given links in order, then refuses.
pub struct MockConnector {
    links: Mutex<VecDeque<MockLink>>,
}

impl MockConnector {
    pub fn new(links: Vec<MockLink>) -> Arc<Self> {
        Arc::new(Self { links: Mutex::new(links.into()) })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Link>, SessionError> {
        match self.links.lock().unwrap().pop_front() {
            Some(link) => Ok(Box::new(link)),
            None => Err(SessionError::Connection("connection refused".to_string())),
        }
    }
}

/// A fleet whose printers share one [`MockConnector`].
pub fn fleet(config: &Config, links: Vec<MockLink>) -> Fleet {
    let connector = MockConnector::new(links);
    Fleet::start_with(config, move |_| -> Arc<dyn Connector> { connector.clone() })
}

/// A link that accepts the connection and then never finishes a write.
pub struct StuckLink;

#[async_trait]
impl Link for StuckLink {
    async fn send_text(&mut self, _text: String) -> Result<(), SessionError> {
        std::future::pending().await
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        std::future::pending().await
    }

    async fn recv(&mut self) -> Option<Result<Inbound, SessionError>> {
        std::future::pending().await
    }

    async fn close(&mut self) {
        std::future::pending().await
    }
}

pub struct StuckConnector;

#[async_trait]
impl Connector for StuckConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Link>, SessionError> {
        Ok(Box::new(StuckLink))
    }
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        min_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        liveness_timeout: Duration::from_secs(30),
        ping_interval: Duration::from_secs(10),
        poll_on_silence: Duration::from_secs(10),
    }
}

pub fn options(connector: Arc<dyn Connector>) -> CoordinatorOptions {
    CoordinatorOptions {
        session: settings(),
        command_timeout: Duration::from_secs(2),
        connector,
        http: reqwest::Client::new(),
        // Nothing listens on the discard port.
        helper_url: "http://127.0.0.1:9".to_string(),
        helper_recheck: Duration::from_millis(200),
    }
}

/// Wait until the published snapshot satisfies `pred`.
pub async fn wait_for(handle: &CoordinatorHandle, pred: impl Fn(&PrinterSnapshot) -> bool) -> PrinterSnapshot {
    let mut rx = handle.subscribe();
    let wait = async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            rx.changed().await.expect("coordinator stopped");
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out; last snapshot: {:?}", handle.snapshot()))
}
