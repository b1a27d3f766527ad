//! The wire underneath a session.
//!
//! [`Connector`] and [`Link`] are the seam between the session loop and the
//! socket, so the loop can be driven by an in-memory link in tests.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::SessionError;
use crate::config::PrinterConfig;

/// A data frame read off the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

#[async_trait]
pub trait Link: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError>;

    async fn ping(&mut self) -> Result<(), SessionError>;

    /// Next data frame; `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<Inbound, SessionError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, SessionError>;
}

/// WebSocket connector. Creality firmware is unauthenticated today; a bearer
/// token is sent on the upgrade request when configured.
#[derive(Debug, Clone)]
pub struct WsConnector {
    token: Option<String>,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { token: None, connect_timeout }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Connector for one configured printer, carrying its token if any.
    pub fn for_printer(printer: &PrinterConfig) -> Self {
        let connector = Self::default();
        match &printer.token {
            Some(token) => connector.with_token(token.clone()),
            None => connector,
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, SessionError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SessionError::Connection(format!("invalid token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| SessionError::Connection(format!("connect to {url} timed out")))?
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| SessionError::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        self.stream
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| SessionError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, SessionError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.to_string()))),
                Ok(Message::Binary(data)) => return Some(Ok(Inbound::Binary(data.to_vec()))),
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(SessionError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "websocket close failed");
        }
    }
}
