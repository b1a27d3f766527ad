//! Bridge between Creality printers' local WebSocket API and a normalized
//! per-printer state/command model.

pub mod camera;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod fleet;
pub mod normalizer;
pub mod session;
pub mod telemetry;
pub mod web;

pub use error::{BridgeError, Result};
