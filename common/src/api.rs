//! Transport-independent handling of the `/api/relay/{id}` endpoints, shared
//! by the axum host server and the ESP HTTP server.

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::{panel::RelayPanel, types::RelayStateResponse};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayApiError {
    #[error("Invalid relay ID")]
    InvalidId,
    #[error("Invalid JSON body")]
    InvalidBody,
    #[error("Relay panel not initialized")]
    NotInitialized,
}

impl RelayApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidId | Self::InvalidBody => 400,
            Self::NotInitialized => 503,
        }
    }
}

/// `POST` body. A missing `state` field means toggle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RelayCommand {
    #[serde(default)]
    pub state: Option<bool>,
}

impl RelayCommand {
    pub fn parse(body: &[u8]) -> Result<Self, RelayApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|_| RelayApiError::InvalidBody)
    }
}

pub fn parse_id(raw: &str) -> Result<u32, RelayApiError> {
    raw.trim().parse().map_err(|_| RelayApiError::InvalidId)
}

pub fn get_relay(panel: Option<&RelayPanel>, id: u32) -> Result<RelayStateResponse, RelayApiError> {
    let panel = panel.ok_or(RelayApiError::NotInitialized)?;
    let engine = panel.relay(id).map_err(|_| RelayApiError::InvalidId)?;
    Ok(RelayStateResponse::new(id, engine.get_state()))
}

pub fn post_relay(
    panel: Option<&RelayPanel>,
    id: u32,
    command: RelayCommand,
) -> Result<RelayStateResponse, RelayApiError> {
    let panel = panel.ok_or(RelayApiError::NotInitialized)?;
    let engine = panel.relay(id).map_err(|_| RelayApiError::InvalidId)?;

    match command.state {
        Some(state) => {
            engine.set_state(state);
        }
        None => engine.toggle(),
    }
    let state = engine.get_state();
    info!("api: relay {id} -> {}", if state { "ON" } else { "OFF" });
    Ok(RelayStateResponse::new(id, state))
}
