use serde::Serialize;

use crate::relay::RelayMode;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayStatus {
    pub id: u32,
    pub name: String,
    pub state: bool,
    pub mode: RelayMode,
    #[serde(rename = "timeRemaining")]
    pub time_remaining: u32,
    #[serde(rename = "timerActive")]
    pub timer_active: bool,
    #[serde(rename = "durationSecs")]
    pub duration_secs: u32,
    #[serde(rename = "hasHardware")]
    pub has_hardware: bool,
    #[serde(rename = "currentAmps", skip_serializing_if = "Option::is_none")]
    pub current_amps: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PanelStatus {
    pub relays: Vec<RelayStatus>,
    #[serde(rename = "masterOn")]
    pub master_on: bool,
    #[serde(rename = "relaysOn")]
    pub relays_on: usize,
}

/// Body of `GET`/`POST /api/relay/{id}` on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStateResponse {
    pub success: bool,
    pub id: u32,
    pub state: bool,
}

impl RelayStateResponse {
    pub fn new(id: u32, state: bool) -> Self {
        Self {
            success: true,
            id,
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
