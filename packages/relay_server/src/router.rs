//! Dispatches decoded messages: login acks go back to the sender, chat lines
//! go to everyone else.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

use relay_protocol::{ApplicationMessage, Frame, InboundMessage, Opcode, ProtocolError, encode_text};

use crate::registry::{BroadcastReport, ConnectionHandle, Registry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Login acknowledged to the sender.
    Acknowledged,
    /// Chat fanned out to the other connections.
    Broadcast(BroadcastReport),
    /// Nothing to do (non-text frame, empty or unrecognized message).
    Ignored,
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<Registry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Route one frame received from `sender`.
    ///
    /// Errors only when the reply cannot be framed.
    pub async fn route(
        &self,
        sender: &ConnectionHandle,
        frame: &Frame,
    ) -> Result<RouteOutcome, ProtocolError> {
        if frame.opcode != Opcode::Text {
            debug!(opcode = ?frame.opcode, "ignoring non-text frame");
            return Ok(RouteOutcome::Ignored);
        }

        match frame.message() {
            InboundMessage::Message(ApplicationMessage::Login { .. }) => {
                let ack = encode_message(&ApplicationMessage::login_ack(sender.user_id()))?;
                // Unicast on the sender's own handle: it may have been displaced
                // from the registry by a later connection with the same id.
                if let Err(e) = sender.send(ack) {
                    warn!(user_id = %sender.user_id(), error = %e, "failed to queue login ack");
                }
                Ok(RouteOutcome::Acknowledged)
            }
            InboundMessage::Message(ApplicationMessage::Chat { data, .. }) => {
                let line = encode_message(&ApplicationMessage::chat_from(
                    sender.user_id(),
                    data.clone(),
                ))?;
                let report = self
                    .registry
                    .broadcast_except(sender.user_id(), line)
                    .await;
                debug!(
                    user_id = %sender.user_id(),
                    delivered = report.delivered,
                    failed = report.failed,
                    "chat broadcast"
                );
                Ok(RouteOutcome::Broadcast(report))
            }
            InboundMessage::Empty => Ok(RouteOutcome::Ignored),
        }
    }
}

fn encode_message(message: &ApplicationMessage) -> Result<Bytes, ProtocolError> {
    let json = serde_json::to_vec(message)?;
    encode_text(&json)
}
