use thiserror::Error;

use crate::camera::CameraError;
use crate::command::CommandError;
use crate::config::ConfigError;
use crate::session::SessionError;
use crate::telemetry::ParseError;

/// Anything the bridge can fail with, for callers that don't care which part
/// failed.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Parse(#[from] ParseError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("command error: {0}")]
    Command(#[from] CommandError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
