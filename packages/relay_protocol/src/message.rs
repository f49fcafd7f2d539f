//! Application messages carried in text frames.
//!
//! Wire shape: `{"type": "login" | "chat", "userId"?: string, "data"?: string}`

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MessageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApplicationMessage {
    Login {
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
}

impl ApplicationMessage {
    /// Acknowledgement sent back to a peer that logged in.
    pub fn login_ack(user_id: impl Into<String>) -> Self {
        Self::Login {
            user_id: Some(user_id.into()),
        }
    }

    /// Chat line stamped with its sender.
    pub fn chat_from(user_id: impl Into<String>, data: Option<String>) -> Self {
        Self::Chat {
            data,
            user_id: Some(user_id.into()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Strict parse of a text payload.
pub fn parse_message(payload: &[u8]) -> Result<ApplicationMessage, MessageError> {
    let text = std::str::from_utf8(payload)?;
    Ok(serde_json::from_str(text)?)
}

/// Lenient view of a payload, as consumed by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Message(ApplicationMessage),
    /// Anything that did not parse: bad UTF-8, bad JSON, an unknown `type`.
    Empty,
}

impl InboundMessage {
    pub fn from_payload(payload: &[u8]) -> Self {
        match parse_message(payload) {
            Ok(message) => Self::Message(message),
            Err(e) => {
                debug!(error = %e, len = payload.len(), "unparseable message payload");
                Self::Empty
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}
