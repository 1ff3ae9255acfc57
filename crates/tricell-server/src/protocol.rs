//! Wire messages exchanged with viewers, independent of the transport that
//! carries them. Control messages are internally tagged unions; an unknown
//! tag is a protocol error reported to the sender, never a silent drop.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tricell_core::{ControlVerb, Phase, SimConfigInput, SimState, TickMetrics};

/// Control messages consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start {
        #[serde(default)]
        config: Option<SimConfigInput>,
        #[serde(default)]
        backend: Option<String>,
    },
    Pause,
    Resume,
    Step {
        #[serde(default)]
        ticks: Option<f64>,
    },
    Reset {
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default)]
        config: Option<SimConfigInput>,
    },
    Stop,
}

impl ClientMessage {
    /// The slice of this message the control decision table reads.
    #[must_use]
    pub fn verb(&self) -> ControlVerb {
        match self {
            Self::Start { .. } => ControlVerb::Start,
            Self::Pause => ControlVerb::Pause,
            Self::Resume => ControlVerb::Resume,
            Self::Step { ticks } => ControlVerb::Step { ticks: *ticks },
            Self::Reset { .. } => ControlVerb::Reset,
            Self::Stop => ControlVerb::Stop,
        }
    }
}

/// Authoritative session snapshot, sent after every handled control message
/// and on every (re)connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMessage {
    pub phase: Phase,
    pub has_run: bool,
    pub run_id: Option<String>,
    pub tick: u64,
    pub backend: Option<String>,
    pub seed: Option<u64>,
}

/// One advanced tick of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMessage {
    pub run_id: String,
    pub tick: u64,
    pub digest: String,
    pub backend: String,
    pub metrics: TickMetrics,
    /// Full-state arrays; omitted on replay-only sends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<FramePayload>,
}

impl FrameMessage {
    /// The bandwidth-trimmed copy cached for reconnect replay.
    #[must_use]
    pub fn replay_copy(&self) -> Self {
        Self { payload: None, ..self.clone() }
    }
}

/// Base64-encoded little-endian state arrays: types as `u8`, energy as
/// `u16`, age as `u32`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub types: String,
    pub energy10: String,
    pub age: String,
}

/// Errors produced while unpacking a frame payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload length is not a multiple of the element size")]
    Truncated,
}

impl FramePayload {
    /// Packs a state into the wire encoding.
    #[must_use]
    pub fn encode(state: &SimState) -> Self {
        let energy: Vec<u8> = state
            .energy10
            .iter()
            .flat_map(|&e| (e as u16).to_le_bytes())
            .collect();
        let age: Vec<u8> = state.age.iter().flat_map(|&a| a.to_le_bytes()).collect();
        Self {
            types: BASE64.encode(&state.types),
            energy10: BASE64.encode(energy),
            age: BASE64.encode(age),
        }
    }

    /// Unpacks the encoded arrays. The server never calls this; it exists
    /// for drivers and tests that consume frames.
    pub fn decode(&self) -> Result<(Vec<u8>, Vec<u16>, Vec<u32>), PayloadError> {
        let types = BASE64.decode(&self.types)?;
        let energy_bytes = BASE64.decode(&self.energy10)?;
        let age_bytes = BASE64.decode(&self.age)?;
        if !energy_bytes.len().is_multiple_of(2) || !age_bytes.len().is_multiple_of(4) {
            return Err(PayloadError::Truncated);
        }
        let energy = energy_bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let age = age_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok((types, energy, age))
    }
}

/// Messages produced for viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    State(StateMessage),
    Frame(FrameMessage),
    Info { message: String },
    Error { message: String },
}
