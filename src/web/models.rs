//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::camera::CameraMode;
use crate::coordinator::{Phase, PrinterSnapshot};
use crate::detector::PrinterFamily;
use crate::normalizer::{PowerState, Status};
use crate::session::ConnectionState;

/// One entry of `GET /api/v1/printers`.
#[derive(Debug, Serialize)]
pub struct PrinterSummary {
    pub id: String,
    pub host: String,
    pub family: PrinterFamily,
    pub connection: ConnectionState,
    pub phase: Phase,
    pub status: Status,
}

impl PrinterSummary {
    pub fn new(host: &str, snapshot: &PrinterSnapshot) -> Self {
        Self {
            id: snapshot.printer.clone(),
            host: host.to_string(),
            family: snapshot.family,
            connection: snapshot.connection,
            phase: snapshot.phase,
            status: snapshot.status(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PrinterListResponse {
    pub printers: Vec<PrinterSummary>,
}

/// `PUT /power`. `null` unbinds the switch.
#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub power: Option<PowerState>,
}

/// `PUT /camera/mode`.
#[derive(Debug, Deserialize)]
pub struct CameraModeRequest {
    pub mode: CameraMode,
}
