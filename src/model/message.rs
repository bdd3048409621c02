//! Signaling wire messages
//!
//! JSON objects exchanged over the WebSocket: `{id, sdpOffer?, sdpAnswer?, key?}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const START: &str = "start";
pub const START_RESPONSE: &str = "startResponse";

/// One signaling message, in either direction.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish the offered media to `rtmp base + key`.
    Start { offer: String, key: String },
}

/// Messages that can't be turned into a [`Command`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported message id {0:?}")]
    Unsupported(String),
}

impl SignalMessage {
    pub fn start_response(answer: impl Into<String>) -> SignalMessage {
        SignalMessage {
            id: START_RESPONSE.to_string(),
            sdp_answer: Some(answer.into()),
            ..Default::default()
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<SignalMessage, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Interprets a client message.
    ///
    /// A `start` without an offer or key still decodes; the empty offer is
    /// rejected later by negotiation, which leaves the connection open.
    pub fn into_command(self) -> Result<Command, ProtocolError> {
        match self.id.as_str() {
            START => Ok(Command::Start {
                offer: self.sdp_offer.unwrap_or_default(),
                key: self.key.unwrap_or_default(),
            }),
            _ => Err(ProtocolError::Unsupported(self.id)),
        }
    }
}
